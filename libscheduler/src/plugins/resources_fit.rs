use common::{Node, Resources};

use crate::plugins::{FilterPlugin, Plugin, PodContext, ScorePlugin, Status};
use crate::state::effective_requests;

/// Filters nodes without headroom for the pod's requests and scores the
/// survivors least-allocated first, so load spreads before it stacks.
pub struct ResourcesFit;

const NAME: &str = "ResourcesFit";

impl Plugin for ResourcesFit {
    fn name(&self) -> &'static str {
        NAME
    }
}

fn is_fit(requests: &Resources, node: &Node) -> bool {
    requests.fits(&node.available())
}

impl FilterPlugin for ResourcesFit {
    fn filter(&self, ctx: &PodContext<'_>, node: &Node) -> Status {
        let requests = effective_requests(ctx.pod);
        if is_fit(&requests, node) {
            Status::success(NAME)
        } else {
            Status::unschedulable(NAME, "node didn't have enough resources".to_string())
        }
    }
}

impl ScorePlugin for ResourcesFit {
    /// Least-allocated: 100 for an empty node, 0 for a node the pod would
    /// fill completely on its tightest dimension.
    fn score(&self, ctx: &PodContext<'_>, node: &Node) -> i64 {
        let requests = effective_requests(ctx.pod);
        let projected = node.allocated.saturating_add(&requests);
        let fraction = projected.max_fraction_of(&node.allocatable);
        ((1.0 - fraction.min(1.0)) * 100.0) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{make_node, make_pod};

    #[test]
    fn filter_uses_headroom_not_capacity() {
        let pod = make_pod("p", 80, 200, |_| {});
        let ctx = PodContext {
            pod: &pod,
            runtime_tag: "node",
        };
        let empty = make_node("n1", 100, 256, |_| {});
        let busy = make_node("n2", 100, 256, |n| {
            n.allocated = Resources::new(40, 100);
        });

        assert!(ResourcesFit.filter(&ctx, &empty).is_success());
        assert!(!ResourcesFit.filter(&ctx, &busy).is_success());
    }

    #[test]
    fn emptier_nodes_score_higher() {
        let pod = make_pod("p", 10, 10, |_| {});
        let ctx = PodContext {
            pod: &pod,
            runtime_tag: "node",
        };
        let empty = make_node("n1", 100, 256, |_| {});
        let busy = make_node("n2", 100, 256, |n| {
            n.allocated = Resources::new(80, 100);
        });

        assert!(ResourcesFit.score(&ctx, &empty) > ResourcesFit.score(&ctx, &busy));
    }
}
