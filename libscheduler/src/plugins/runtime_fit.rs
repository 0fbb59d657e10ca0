use common::Node;

use crate::plugins::{FilterPlugin, Plugin, PodContext, Status};

/// Bars nodes whose runtime cannot execute the pack. A `universal` pack runs
/// anywhere; anything else must match the node's advertised runtime.
pub struct RuntimeFit;

const NAME: &str = "RuntimeFit";

impl Plugin for RuntimeFit {
    fn name(&self) -> &'static str {
        NAME
    }
}

impl FilterPlugin for RuntimeFit {
    fn filter(&self, ctx: &PodContext<'_>, node: &Node) -> Status {
        if node.accepts_runtime(ctx.runtime_tag) {
            Status::success(NAME)
        } else {
            Status::unresolvable(
                NAME,
                format!(
                    "node runtime {} does not support pack runtime {}",
                    node.runtime_type, ctx.runtime_tag
                ),
            )
        }
    }
}
