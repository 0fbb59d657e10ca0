//! Key schema. Control-plane records live under `/registry/`; the per-user
//! routing tier lives under `/users/<user>/`.

pub fn pod_key(pod_id: &str) -> String {
    format!("/registry/pods/{pod_id}")
}

pub const POD_PREFIX: &str = "/registry/pods/";

pub fn node_key(node_id: &str) -> String {
    format!("/registry/nodes/{node_id}")
}

pub const NODE_PREFIX: &str = "/registry/nodes/";

pub fn pack_key(pack_id: &str) -> String {
    format!("/registry/packs/{pack_id}")
}

pub const PACK_PREFIX: &str = "/registry/packs/";

pub fn priority_class_key(name: &str) -> String {
    format!("/registry/priorityclasses/{name}")
}

pub const PRIORITY_CLASS_PREFIX: &str = "/registry/priorityclasses/";

/// Pod admission requests written by admin tooling, consumed by the
/// orchestrator's submission watcher.
pub fn submission_key(id: &str) -> String {
    format!("/registry/submissions/{id}")
}

pub const SUBMISSION_PREFIX: &str = "/registry/submissions/";

pub fn user_nodes_prefix(user: &str) -> String {
    format!("/users/{user}/nodes/")
}

pub fn user_node_key(user: &str, node_name: &str) -> String {
    format!("/users/{user}/nodes/{node_name}")
}

pub fn user_services_prefix(user: &str) -> String {
    format!("/users/{user}/services/")
}

pub fn user_service_key(user: &str, service: &str) -> String {
    format!("/users/{user}/services/{service}")
}

pub fn user_requests_prefix(user: &str) -> String {
    format!("/users/{user}/requests/")
}

pub fn user_request_key(user: &str, request_id: &str) -> String {
    format!("/users/{user}/requests/{request_id}")
}

pub fn user_responses_prefix(user: &str) -> String {
    format!("/users/{user}/responses/")
}

pub fn user_response_key(user: &str, request_id: &str) -> String {
    format!("/users/{user}/responses/{request_id}")
}

/// Final path segment of a key, used to recover an id from a watch event.
pub fn last_segment(key: &str) -> Option<&str> {
    key.split('/').filter(|s| !s.is_empty()).next_back()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_segment_recovers_the_id() {
        assert_eq!(last_segment("/registry/pods/p-1"), Some("p-1"));
        assert_eq!(last_segment("/users/alice/requests/r-9"), Some("r-9"));
        assert_eq!(last_segment("///"), None);
    }
}
