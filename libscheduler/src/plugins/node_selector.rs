use common::Node;

use crate::plugins::{FilterPlugin, Plugin, PodContext, Status};

/// Enforces the pod's node selector, required affinity labels and
/// anti-affinity exclusions. Label mismatches cannot be fixed by preemption.
pub struct NodeSelector;

const NAME: &str = "NodeSelector";

impl Plugin for NodeSelector {
    fn name(&self) -> &'static str {
        NAME
    }
}

impl FilterPlugin for NodeSelector {
    fn filter(&self, ctx: &PodContext<'_>, node: &Node) -> Status {
        let scheduling = &ctx.pod.scheduling;

        let required = scheduling
            .node_selector
            .iter()
            .chain(scheduling.affinity.iter());
        for (key, value) in required {
            if node.labels.get(key) != Some(value) {
                return Status::unresolvable(
                    NAME,
                    format!("node label {key} does not match selector"),
                );
            }
        }

        for (key, value) in &scheduling.anti_affinity {
            if node.labels.get(key) == Some(value) {
                return Status::unresolvable(NAME, format!("node label {key}={value} is barred"));
            }
        }

        Status::success(NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::Code;
    use crate::test_support::{make_node, make_pod};

    #[test]
    fn all_selector_labels_must_match() {
        let pod = make_pod("p", 1, 1, |p| {
            p.scheduling
                .node_selector
                .insert("gpu".to_string(), "nvidia".to_string());
        });
        let ctx = PodContext {
            pod: &pod,
            runtime_tag: "node",
        };

        let gpu = make_node("gpu-node", 100, 256, |n| {
            n.labels.insert("gpu".to_string(), "nvidia".to_string());
        });
        let cpu = make_node("cpu-node", 100, 256, |n| {
            n.labels.insert("cpu".to_string(), "intel".to_string());
        });

        assert!(NodeSelector.filter(&ctx, &gpu).is_success());
        let status = NodeSelector.filter(&ctx, &cpu);
        assert_eq!(status.code, Code::UnschedulableAndUnresolvable);
    }

    #[test]
    fn anti_affinity_bars_matching_nodes() {
        let pod = make_pod("p", 1, 1, |p| {
            p.scheduling
                .anti_affinity
                .insert("zone".to_string(), "a".to_string());
        });
        let ctx = PodContext {
            pod: &pod,
            runtime_tag: "node",
        };
        let zone_a = make_node("n1", 100, 256, |n| {
            n.labels.insert("zone".to_string(), "a".to_string());
        });
        let zone_b = make_node("n2", 100, 256, |n| {
            n.labels.insert("zone".to_string(), "b".to_string());
        });

        assert!(!NodeSelector.filter(&ctx, &zone_a).is_success());
        assert!(NodeSelector.filter(&ctx, &zone_b).is_success());
    }
}
