pub mod error;
pub mod message;
pub mod node;
pub mod pack;
pub mod pod;
pub mod priority;
pub mod request;
pub mod resources;

pub use error::{ErrorCode, OrchestratorError, OrchestratorResult};
pub use message::{Frame, frame_type};
pub use node::{Node, NodeStatus, Taint, TaintEffect, Toleration, TolerationOperator};
pub use pack::{BundleLocator, CAP_ROOT, Pack, PackMetadata};
pub use pod::{Pod, PodScheduling, PodStatus, PreemptionPolicy};
pub use priority::{
    PriorityClass, SYSTEM_CLUSTER_CRITICAL, SYSTEM_CRITICAL_FLOOR, SYSTEM_NODE_CRITICAL,
    is_system_critical_name,
};
pub use request::{Request, RequestMode, Response};
pub use resources::Resources;
