use common::Pod;

use crate::state::{ClusterState, effective_requests};

/// Select victims so the incoming pod fits on `node_id`.
///
/// Candidates are active pods with strictly lower priority; system-critical
/// pods are protected unless the incoming pod is itself system-critical (its
/// priority is already known to be strictly higher). Victims accumulate
/// lowest priority first, newest first within a priority, until the freed
/// capacity suffices. `None` means the node cannot be freed up at all.
pub fn plan_victims(
    state: &ClusterState,
    incoming: &Pod,
    incoming_system_critical: bool,
    node_id: &str,
) -> Option<Vec<String>> {
    let node = state.node(node_id)?;
    let requests = effective_requests(incoming);
    let mut free = node.available();
    if requests.fits(&free) {
        return Some(vec![]);
    }

    let mut candidates: Vec<&Pod> = state
        .pods_on_node(node_id)
        .into_iter()
        .filter(|p| p.status.is_active())
        .filter(|p| p.priority < incoming.priority)
        .filter(|p| incoming_system_critical || !state.pod_is_system_critical(p))
        .collect();
    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.created_at.cmp(&a.created_at))
    });

    let mut victims = Vec::new();
    for candidate in candidates {
        free = free.saturating_add(&effective_requests(candidate));
        victims.push(candidate.id.clone());
        if requests.fits(&free) {
            return Some(victims);
        }
    }
    None
}
