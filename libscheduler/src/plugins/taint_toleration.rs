use common::{Node, Taint, TaintEffect, Toleration};

use crate::plugins::{FilterPlugin, Plugin, PodContext, ScorePlugin, Status};

/// Bars nodes whose `NoSchedule`/`NoExecute` taints are not tolerated and
/// penalizes untolerated `PreferNoSchedule` taints in scoring.
pub struct TaintToleration;

const NAME: &str = "TaintToleration";

impl Plugin for TaintToleration {
    fn name(&self) -> &'static str {
        NAME
    }
}

fn tolerated(tolerations: &[Toleration], taint: &Taint) -> bool {
    tolerations.iter().any(|t| t.tolerates(taint))
}

fn find_untolerated<'a>(
    taints: &'a [Taint],
    tolerations: &[Toleration],
    mut pred: impl FnMut(&Taint) -> bool,
) -> Option<&'a Taint> {
    taints
        .iter()
        .filter(|t| pred(t))
        .find(|t| !tolerated(tolerations, t))
}

impl FilterPlugin for TaintToleration {
    fn filter(&self, ctx: &PodContext<'_>, node: &Node) -> Status {
        let untolerated = find_untolerated(&node.taints, &ctx.pod.scheduling.tolerations, |t| {
            matches!(t.effect, TaintEffect::NoSchedule | TaintEffect::NoExecute)
        });
        match untolerated {
            Some(t) => Status::unresolvable(
                NAME,
                format!("node had untolerated taint {{{}: {}}}", t.key, t.value),
            ),
            None => Status::success(NAME),
        }
    }
}

impl ScorePlugin for TaintToleration {
    fn score(&self, ctx: &PodContext<'_>, node: &Node) -> i64 {
        let penalty = node
            .taints
            .iter()
            .filter(|t| {
                t.effect == TaintEffect::PreferNoSchedule
                    && !tolerated(&ctx.pod.scheduling.tolerations, t)
            })
            .count();
        -(penalty as i64)
    }
}
