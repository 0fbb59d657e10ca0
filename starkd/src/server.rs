use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::message::{
    AuthenticatePayload, AuthenticatedPayload, ConnectedPayload, HeartbeatPayload,
    RegisterPayload, RegisteredPayload, ReconnectPayload, StatusUpdatePayload,
};
use common::{ErrorCode, Frame, frame_type};
use libscheduler::{NodeManager, NodeRegistration, Scheduler};
use libstore::{DocumentStore, keys, put_json};
use librouter::RouterNodeDoc;
use log::{debug, error, info, warn};
use quinn::{Connection, Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use tokio::sync::mpsc;

use crate::config::AuthSection;
use crate::session::{AgentSession, SessionRegistry};

pub struct ServerDeps {
    pub store: Arc<dyn DocumentStore>,
    pub scheduler: Arc<Scheduler>,
    pub node_manager: Arc<NodeManager>,
    pub sessions: Arc<SessionRegistry>,
    pub auth: AuthSection,
    pub ping_interval: Duration,
}

/// Launch the control-plane server and accept agent connections, each
/// handled in a dedicated task.
pub async fn serve(addr: String, deps: Arc<ServerDeps>) -> Result<()> {
    let endpoint = make_server_endpoint(addr.parse()?)?;
    info!("control plane listening on {addr}");

    loop {
        let Some(connecting) = endpoint.accept().await else {
            break;
        };
        let deps = deps.clone();
        match connecting.await {
            Ok(conn) => {
                let remote = conn.remote_address().to_string();
                info!("[server] connection accepted: addr={remote}");
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(conn, deps).await {
                        error!("[server] handle_connection error: {e:?}");
                    }
                });
            }
            Err(e) => error!("connection failed: {e}"),
        }
    }
    Ok(())
}

/// Frames are JSON, one frame per unidirectional stream.
async fn write_frame(conn: &Connection, frame: &Frame) -> Result<()> {
    let mut stream = conn.open_uni().await?;
    stream.write_all(&serde_json::to_vec(frame)?).await?;
    stream.finish()?;
    Ok(())
}

const MAX_FRAME_BYTES: usize = 1024 * 1024;

async fn read_frame(recv: &mut quinn::RecvStream) -> Result<Frame> {
    let buf = recv.read_to_end(MAX_FRAME_BYTES).await?;
    Ok(serde_json::from_slice(&buf)?)
}

struct ConnectionCtx {
    deps: Arc<ServerDeps>,
    tx: mpsc::Sender<Frame>,
    user: Option<crate::config::AuthUser>,
    session: Option<Arc<AgentSession>>,
}

async fn handle_connection(conn: Connection, deps: Arc<ServerDeps>) -> Result<()> {
    // Outbound writer: every queued frame goes out on its own uni stream.
    let (tx, mut outbound) = mpsc::channel::<Frame>(32);
    let writer_conn = conn.clone();
    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = write_frame(&writer_conn, &frame).await {
                debug!("[server] write failed, dropping connection writer: {e}");
                return;
            }
        }
    });

    // Greet, then ping on an interval until the channel dies.
    let connection_id = uuid::Uuid::new_v4().to_string();
    tx.send(Frame::new(
        frame_type::CONNECTED,
        &ConnectedPayload {
            connection_id: connection_id.clone(),
        },
    )?)
    .await?;
    let ping_tx = tx.clone();
    let ping_interval = deps.ping_interval;
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(ping_interval);
        timer.tick().await;
        loop {
            timer.tick().await;
            if ping_tx.send(Frame::bare(frame_type::PING)).await.is_err() {
                return;
            }
        }
    });

    let mut ctx = ConnectionCtx {
        deps,
        tx,
        user: None,
        session: None,
    };

    loop {
        match conn.accept_uni().await {
            Ok(mut recv) => match read_frame(&mut recv).await {
                Ok(frame) => ctx.handle_frame(frame).await,
                Err(e) => warn!("[server] bad frame: {e}"),
            },
            Err(e) => {
                info!("[server] connection closed: {e}");
                break;
            }
        }
    }

    // Drop the session; pending server-side RPCs reject, liveness decides
    // the node's fate. A newer session for the same node wins the slot.
    if let Some(session) = ctx.session.take() {
        session.reject_all().await;
        if let Some(current) = ctx.deps.sessions.get(&session.node_id).await
            && Arc::ptr_eq(&current, &session)
        {
            ctx.deps.sessions.unregister(&session.node_id).await;
        }
        info!("[server] session for node {} closed", session.node_id);
    }
    Ok(())
}

impl ConnectionCtx {
    async fn reply(&self, frame: Frame) {
        if self.tx.send(frame).await.is_err() {
            debug!("[server] reply dropped, connection gone");
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        // Correlated replies to server-initiated RPCs route to their waiter.
        if frame.correlation_id.is_some()
            && (frame.kind.ends_with(frame_type::SUCCESS_SUFFIX) || frame.is_error())
        {
            if let Some(session) = &self.session {
                session.resolve(frame).await;
            } else {
                debug!("[server] correlated reply before registration");
            }
            return;
        }

        match frame.kind.as_str() {
            frame_type::AUTHENTICATE => self.on_authenticate(frame).await,
            frame_type::NODE_REGISTER => self.on_register(frame).await,
            frame_type::NODE_RECONNECT => self.on_reconnect(frame).await,
            frame_type::NODE_HEARTBEAT => self.on_heartbeat(frame).await,
            frame_type::POD_STATUS_UPDATE => self.on_status_update(frame).await,
            frame_type::PONG => debug!("[server] pong received"),
            other => debug!("[server] ignoring unknown frame type {other}"),
        }
    }

    async fn on_authenticate(&mut self, frame: Frame) {
        let payload: AuthenticatePayload = match frame.payload_as() {
            Ok(p) => p,
            Err(e) => {
                self.reply(Frame::error_reply(&frame, ErrorCode::Validation, &e.to_string()))
                    .await;
                return;
            }
        };
        match self.deps.auth.tokens.get(&payload.token) {
            Some(user) => {
                self.user = Some(user.clone());
                let reply = Frame::success_reply(
                    &frame,
                    &AuthenticatedPayload {
                        user_id: user.user_id.clone(),
                        email: user.email.clone(),
                    },
                )
                .unwrap_or_else(|_| Frame::bare("auth:authenticate:success"));
                self.reply(reply).await;
            }
            None => {
                self.reply(Frame::error_reply(
                    &frame,
                    ErrorCode::Unauthorized,
                    "unknown token",
                ))
                .await;
            }
        }
    }

    fn authed_user(&self) -> Option<String> {
        self.user.as_ref().map(|u| u.user_id.clone())
    }

    async fn on_register(&mut self, frame: Frame) {
        let Some(user) = self.authed_user() else {
            self.reply(Frame::error_reply(
                &frame,
                ErrorCode::Unauthorized,
                "authenticate first",
            ))
            .await;
            return;
        };
        let payload: RegisterPayload = match frame.payload_as() {
            Ok(p) => p,
            Err(e) => {
                self.reply(Frame::error_reply(&frame, ErrorCode::Validation, &e.to_string()))
                    .await;
                return;
            }
        };
        let input = NodeRegistration {
            name: payload.name,
            runtime_type: payload.runtime_type,
            capabilities: payload.capabilities,
            allocatable: payload.allocatable,
            labels: payload.labels,
            taints: payload.taints,
        };
        match self.deps.node_manager.register(input, &user).await {
            Ok(node) => {
                self.attach_session(node.id.clone(), user.clone()).await;
                self.persist_node_docs(&user, &node.id, &node.name).await;
                let reply = Frame::success_reply(
                    &frame,
                    &RegisteredPayload {
                        node_id: node.id.clone(),
                    },
                )
                .unwrap_or_else(|_| Frame::bare("node:register:success"));
                self.reply(reply).await;
                self.deps.scheduler.on_cluster_change().await;
            }
            Err(e) => {
                self.reply(Frame::error_reply(&frame, e.code, &e.message)).await;
            }
        }
    }

    async fn on_reconnect(&mut self, frame: Frame) {
        let Some(user) = self.authed_user() else {
            self.reply(Frame::error_reply(
                &frame,
                ErrorCode::Unauthorized,
                "authenticate first",
            ))
            .await;
            return;
        };
        let payload: ReconnectPayload = match frame.payload_as() {
            Ok(p) => p,
            Err(e) => {
                self.reply(Frame::error_reply(&frame, ErrorCode::Validation, &e.to_string()))
                    .await;
                return;
            }
        };
        match self.deps.node_manager.reconnect(&payload.node_id).await {
            Ok(node) => {
                self.attach_session(node.id.clone(), user).await;
                let reply = Frame::success_reply(
                    &frame,
                    &RegisteredPayload {
                        node_id: node.id.clone(),
                    },
                )
                .unwrap_or_else(|_| Frame::bare("node:reconnect:success"));
                self.reply(reply).await;
                self.deps.scheduler.on_cluster_change().await;
            }
            Err(e) => {
                self.reply(Frame::error_reply(&frame, e.code, &e.message)).await;
            }
        }
    }

    async fn attach_session(&mut self, node_id: String, user: String) {
        let session = Arc::new(AgentSession::new(node_id, user, self.tx.clone()));
        self.deps.sessions.register(session.clone()).await;
        self.session = Some(session);
    }

    /// Mirror the node into the registry and the owner's routing tier.
    async fn persist_node_docs(&self, user: &str, node_id: &str, node_name: &str) {
        let state = self.deps.scheduler.state();
        let node = state.read().await.node(node_id).cloned();
        if let Some(node) = node
            && let Err(e) =
                put_json(self.deps.store.as_ref(), &keys::node_key(node_id), &node).await
        {
            warn!("persisting node {node_id} failed: {e}");
        }
        let doc = RouterNodeDoc {
            name: node_name.to_string(),
            inbox: None,
        };
        if let Err(e) = put_json(
            self.deps.store.as_ref(),
            &keys::user_node_key(user, node_name),
            &doc,
        )
        .await
        {
            warn!("persisting router node doc for {node_name} failed: {e}");
        }
    }

    async fn on_heartbeat(&mut self, frame: Frame) {
        let payload: HeartbeatPayload = match frame.payload_as() {
            Ok(p) => p,
            Err(e) => {
                self.reply(Frame::error_reply(&frame, ErrorCode::Validation, &e.to_string()))
                    .await;
                return;
            }
        };
        match self
            .deps
            .node_manager
            .heartbeat(&payload.node_id, payload.allocated, payload.timestamp)
            .await
        {
            Ok(()) => {
                let reply = Frame::success_reply(&frame, &serde_json::json!({}))
                    .unwrap_or_else(|_| Frame::bare("node:heartbeat:success"));
                self.reply(reply).await;
            }
            Err(e) => {
                self.reply(Frame::error_reply(&frame, e.code, &e.message)).await;
            }
        }
    }

    async fn on_status_update(&mut self, frame: Frame) {
        let payload: StatusUpdatePayload = match frame.payload_as() {
            Ok(p) => p,
            Err(e) => {
                self.reply(Frame::error_reply(&frame, ErrorCode::Validation, &e.to_string()))
                    .await;
                return;
            }
        };
        if let Some(error) = &payload.error {
            warn!("pod {} reported: {error}", payload.pod_id);
        }
        match self
            .deps
            .scheduler
            .record_agent_status(&payload.pod_id, payload.status)
            .await
        {
            Ok(()) => {
                self.persist_pod(&payload.pod_id).await;
                let reply = Frame::success_reply(&frame, &serde_json::json!({}))
                    .unwrap_or_else(|_| Frame::bare("pod:status:update:success"));
                self.reply(reply).await;
            }
            Err(e) => {
                self.reply(Frame::error_reply(&frame, e.code, &e.message)).await;
            }
        }
    }

    async fn persist_pod(&self, pod_id: &str) {
        let state = self.deps.scheduler.state();
        let pod = state.read().await.pod(pod_id).cloned();
        if let Some(pod) = pod
            && let Err(e) = put_json(self.deps.store.as_ref(), &keys::pod_key(pod_id), &pod).await
        {
            warn!("persisting pod {pod_id} failed: {e}");
        }
    }
}

/// Set up the QUIC server endpoint with a self-signed TLS certificate.
fn make_server_endpoint(bind_addr: SocketAddr) -> Result<Endpoint> {
    let server_config = configure_server()?;
    let endpoint = Endpoint::server(server_config, bind_addr)?;
    Ok(endpoint)
}

fn configure_server() -> Result<ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let cert_der = CertificateDer::from(cert.serialize_der()?);
    let key = PrivatePkcs8KeyDer::from(cert.serialize_private_key_der());
    let server_config = ServerConfig::with_single_cert(
        vec![cert_der],
        rustls::pki_types::PrivateKeyDer::Pkcs8(key),
    )?;
    Ok(server_config)
}
