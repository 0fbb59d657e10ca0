use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::message::ErrorPayload;
use common::{Frame, OrchestratorError, OrchestratorResult};
use log::debug;
use tokio::sync::{Mutex, mpsc, oneshot};

/// Default deadline for a server-initiated RPC to a node agent.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// One registered agent connection: an outbound frame queue plus the pending
/// correlations awaiting its replies.
pub struct AgentSession {
    pub node_id: String,
    pub user: String,
    tx: mpsc::Sender<Frame>,
    correlations: Mutex<HashMap<String, oneshot::Sender<Frame>>>,
}

impl AgentSession {
    pub fn new(node_id: String, user: String, tx: mpsc::Sender<Frame>) -> Self {
        AgentSession {
            node_id,
            user,
            tx,
            correlations: Mutex::new(HashMap::new()),
        }
    }

    pub async fn send(&self, frame: Frame) -> OrchestratorResult<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| OrchestratorError::internal("agent connection closed"))
    }

    /// Send a frame and wait for its correlated `:success`/`:error` reply.
    pub async fn send_request(
        &self,
        mut frame: Frame,
        timeout: Duration,
    ) -> OrchestratorResult<Frame> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        frame.correlation_id = Some(correlation_id.clone());

        let (resolve, resolved) = oneshot::channel();
        self.correlations
            .lock()
            .await
            .insert(correlation_id.clone(), resolve);

        if let Err(e) = self.send(frame).await {
            self.correlations.lock().await.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, resolved).await {
            Ok(Ok(reply)) if reply.is_error() => {
                let payload: ErrorPayload = reply.payload_as().map_err(|e| {
                    OrchestratorError::internal(format!("malformed error reply: {e}"))
                })?;
                Err(OrchestratorError::new(payload.code, payload.message))
            }
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(OrchestratorError::internal("Connection closed")),
            Err(_) => {
                self.correlations.lock().await.remove(&correlation_id);
                Err(OrchestratorError::timeout(format!(
                    "node {} did not reply within {}s",
                    self.node_id,
                    timeout.as_secs()
                )))
            }
        }
    }

    /// Route a correlated reply to its waiter. Returns false for strays.
    pub async fn resolve(&self, frame: Frame) -> bool {
        let Some(correlation_id) = frame.correlation_id.clone() else {
            return false;
        };
        match self.correlations.lock().await.remove(&correlation_id) {
            Some(resolve) => resolve.send(frame).is_ok(),
            None => {
                debug!("stray reply with correlation {correlation_id}");
                false
            }
        }
    }

    /// Reject every pending correlation; used when the socket closes.
    pub async fn reject_all(&self) {
        self.correlations.lock().await.clear();
    }
}

/// Registered agents by node id.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, Arc<AgentSession>>>,
}

impl SessionRegistry {
    pub async fn register(&self, session: Arc<AgentSession>) {
        let mut inner = self.inner.lock().await;
        inner.insert(session.node_id.clone(), session);
    }

    pub async fn unregister(&self, node_id: &str) -> Option<Arc<AgentSession>> {
        self.inner.lock().await.remove(node_id)
    }

    pub async fn get(&self, node_id: &str) -> Option<Arc<AgentSession>> {
        self.inner.lock().await.get(node_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::frame_type;

    #[tokio::test]
    async fn request_resolves_on_matching_reply() {
        let (tx, mut rx) = mpsc::channel(8);
        let session = Arc::new(AgentSession::new(
            "n1".to_string(),
            "alice".to_string(),
            tx,
        ));

        let responder = session.clone();
        tokio::spawn(async move {
            let sent: Frame = rx.recv().await.unwrap();
            let reply =
                Frame::success_reply(&sent, &serde_json::json!({"ok": true})).unwrap();
            assert!(responder.resolve(reply).await);
        });

        let reply = session
            .send_request(Frame::bare(frame_type::POD_DEPLOY), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.kind, "pod:deploy:success");
    }

    #[tokio::test]
    async fn error_replies_surface_their_code() {
        let (tx, mut rx) = mpsc::channel(8);
        let session = Arc::new(AgentSession::new(
            "n1".to_string(),
            "alice".to_string(),
            tx,
        ));

        let responder = session.clone();
        tokio::spawn(async move {
            let sent: Frame = rx.recv().await.unwrap();
            let reply = Frame::error_reply(&sent, common::ErrorCode::AlreadyRunning, "busy");
            responder.resolve(reply).await;
        });

        let err = session
            .send_request(Frame::bare(frame_type::POD_DEPLOY), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code, common::ErrorCode::AlreadyRunning);
    }

    #[tokio::test]
    async fn timeouts_clean_up_the_correlation() {
        let (tx, _rx) = mpsc::channel(8);
        let session = AgentSession::new("n1".to_string(), "alice".to_string(), tx);

        let err = session
            .send_request(Frame::bare(frame_type::POD_STOP), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code, common::ErrorCode::Timeout);
        assert!(session.correlations.lock().await.is_empty());
    }
}
