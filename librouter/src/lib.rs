pub mod docs;
pub mod requester;
pub mod retry;
pub mod router;

pub use docs::{RouterNodeDoc, ServiceDoc};
pub use requester::{Requester, RequesterConfig, RequesterError};
pub use retry::{RetryPolicy, retry_until_cancelled};
pub use router::{Router, RouterConfig};
