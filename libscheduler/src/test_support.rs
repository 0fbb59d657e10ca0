//! Builders shared by unit tests.

use std::collections::HashMap;

use chrono::Utc;
use common::{Node, NodeStatus, Pod, PodStatus, Resources};

pub fn make_node(id: &str, cpu: u64, memory: u64, customize: impl FnOnce(&mut Node)) -> Node {
    let mut node = Node {
        id: id.to_string(),
        name: id.to_string(),
        owner: "admin".to_string(),
        runtime_type: "node".to_string(),
        allocatable: Resources {
            cpu,
            memory,
            pods: 100,
            storage: 0,
        },
        allocated: Resources::default(),
        labels: HashMap::new(),
        taints: vec![],
        status: NodeStatus::Online,
        last_heartbeat: None,
    };
    customize(&mut node);
    node
}

pub fn make_pod(id: &str, cpu: u64, memory: u64, customize: impl FnOnce(&mut Pod)) -> Pod {
    let now = Utc::now();
    let mut pod = Pod {
        id: id.to_string(),
        pack_id: "pack".to_string(),
        pack_version: "1.0.0".to_string(),
        namespace: "default".to_string(),
        labels: HashMap::new(),
        annotations: HashMap::new(),
        priority: 0,
        priority_class_name: None,
        preemption_policy: Default::default(),
        resource_requests: Resources::new(cpu, memory),
        resource_limits: Resources::default(),
        scheduling: Default::default(),
        status: PodStatus::Pending,
        node_id: None,
        created_at: now,
        updated_at: now,
    };
    customize(&mut pod);
    pod
}
