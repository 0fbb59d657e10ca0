use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use common::message::{
    AuthenticatePayload, AuthenticatedPayload, ConnectedPayload, DeployPayload, ErrorPayload,
    HeartbeatPayload, PongPayload, RegisterPayload, RegisteredPayload, ReconnectPayload,
    StatusUpdatePayload, StopPayload,
};
use common::{ErrorCode, Frame, NodeStatus, Resources, frame_type};
use libexecutor::{ExecutorConfig, PackExecutor};
use log::{debug, error, info, warn};
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig as QuinnClientConfig, Connection, Endpoint};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig as RustlsClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{Mutex, oneshot};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthClient;
use crate::config::AgentConfig;
use crate::persist::{NodeCredentials, RegisteredNodeEntry, StatePersistence};
use crate::pod_handler::PodHandler;

/// Default deadline for agent-initiated RPCs.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Refresh the access token when it expires within this window.
const REFRESH_WINDOW: chrono::Duration = chrono::Duration::minutes(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Registering,
    Registered,
}

/// Skip certificate verification; the control plane uses a self-signed cert.
#[derive(Debug)]
pub struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

pub fn init_crypto() {
    let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider());
}

/// Reconnect delay: `min(5, attempt) × reconnect_delay`.
pub(crate) fn reconnect_delay(attempt: i64, base: Duration) -> Duration {
    base * attempt.clamp(1, 5) as u32
}

/// The long-lived node agent singleton: one control-plane connection,
/// re-established with state resumption, driving the local pod handler.
pub struct NodeAgent {
    config: AgentConfig,
    executor: Arc<PackExecutor>,
    handler: Arc<PodHandler>,
    persistence: Option<StatePersistence>,
    auth_client: AuthClient,
    state: StdMutex<AgentState>,
    node_id: StdMutex<Option<String>>,
    connection_id: StdMutex<Option<String>>,
    connection: Mutex<Option<Connection>>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    correlations: Mutex<HashMap<String, oneshot::Sender<Frame>>>,
    /// Single-flight lock for token refresh.
    refresh_flight: Mutex<()>,
    status_rx: Mutex<Option<UnboundedReceiver<StatusUpdatePayload>>>,
    /// Bumped on every registration; stale heartbeat tasks notice and exit.
    heartbeat_epoch: std::sync::atomic::AtomicU64,
    started: std::sync::atomic::AtomicBool,
    cancel: CancellationToken,
}

impl NodeAgent {
    pub fn new(config: AgentConfig) -> Result<Arc<Self>> {
        init_crypto();
        let persistence = if config.persist_state {
            Some(StatePersistence::new()?)
        } else {
            None
        };
        let executor = Arc::new(PackExecutor::new(ExecutorConfig {
            bundle_dir: config.bundle_dir(),
            orchestrator_url: Some(config.api_base()),
            auth_token: config.auth_token.clone(),
            default_timeout_ms: config.executor.default_timeout_ms,
            max_concurrent: config.executor.max_concurrent,
            max_memory_mb: config.executor.max_memory_mb,
            graceful_shutdown_timeout: Duration::from_millis(
                config.executor.graceful_shutdown_timeout_ms,
            ),
            runtime_command: config.executor.runtime_command.clone(),
        }));
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(PodHandler::new(executor.clone(), status_tx));
        let auth_client = AuthClient::new(config.api_base());

        Ok(Arc::new(NodeAgent {
            config,
            executor,
            handler,
            persistence,
            auth_client,
            state: StdMutex::new(AgentState::Disconnected),
            node_id: StdMutex::new(None),
            connection_id: StdMutex::new(None),
            connection: Mutex::new(None),
            outbound: Mutex::new(None),
            correlations: Mutex::new(HashMap::new()),
            refresh_flight: Mutex::new(()),
            status_rx: Mutex::new(Some(status_rx)),
            heartbeat_epoch: std::sync::atomic::AtomicU64::new(0),
            started: std::sync::atomic::AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: AgentState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn node_id(&self) -> Option<String> {
        self.node_id.lock().unwrap().clone()
    }

    pub fn handler(&self) -> Arc<PodHandler> {
        self.handler.clone()
    }

    /// Bring the agent up: executor ready, token refresh ticking, connection
    /// loop running. Starting from any state but `disconnected` is an error.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self
            .started
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            bail!("agent already started (state {:?})", self.state());
        }
        if self.state() != AgentState::Disconnected {
            self.started
                .store(false, std::sync::atomic::Ordering::SeqCst);
            bail!("agent cannot start from state {:?}", self.state());
        }
        self.set_state(AgentState::Connecting);

        self.spawn_status_forwarder().await;
        self.spawn_token_refresh();

        let agent = self.clone();
        tokio::spawn(async move {
            agent.connection_loop().await;
        });
        Ok(())
    }

    /// Tear down: cancel timers, close the socket gracefully, reject every
    /// pending correlation, stop local pods.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(conn) = self.connection.lock().await.take() {
            conn.close(0u32.into(), b"shutdown");
        }
        self.reject_all().await;
        self.handler.stop_all().await;
        self.set_state(AgentState::Disconnected);
        self.started
            .store(false, std::sync::atomic::Ordering::SeqCst);
        info!("agent stopped");
    }

    async fn connection_loop(self: Arc<Self>) {
        let mut attempt: i64 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            self.set_state(AgentState::Connecting);
            match self.run_once().await {
                Ok(reached_registered) => {
                    if reached_registered {
                        attempt = 0;
                    }
                }
                Err(e) => warn!("connection attempt failed: {e:#}"),
            }
            if self.cancel.is_cancelled() {
                self.set_state(AgentState::Disconnected);
                return;
            }

            // The node identity survives; the connection identity does not.
            *self.connection_id.lock().unwrap() = None;
            self.reject_all().await;
            self.set_state(AgentState::Disconnected);

            attempt += 1;
            if self.config.max_reconnect_attempts >= 0
                && attempt > self.config.max_reconnect_attempts
            {
                error!(
                    "giving up after {} reconnect attempts",
                    self.config.max_reconnect_attempts
                );
                return;
            }
            let delay =
                reconnect_delay(attempt, Duration::from_secs(self.config.reconnect_delay_secs));
            info!("reconnecting in {}s (attempt {attempt})", delay.as_secs());
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(delay) => {}
            }
        }
    }

    /// One connection lifecycle: connect, wait for `connected`, authenticate,
    /// register or resume, then serve frames until the socket closes.
    async fn run_once(self: &Arc<Self>) -> Result<bool> {
        let mut tls = RustlsClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        tls.dangerous()
            .set_certificate_verifier(Arc::new(SkipServerVerification));
        let quic_crypto = QuicClientConfig::try_from(tls)?;
        let client_cfg = QuinnClientConfig::new(Arc::new(quic_crypto));
        let mut endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap())?;
        endpoint.set_default_client_config(client_cfg);

        let addr = self
            .config
            .orchestrator_url
            .parse()
            .context("orchestrator_url must be host:port")?;
        let conn = endpoint.connect(addr, "localhost")?.await?;
        info!("connected to orchestrator at {addr}");
        self.set_state(AgentState::Connected);
        *self.connection.lock().await = Some(conn.clone());

        let (tx, mut outbound_rx) = mpsc::channel::<Frame>(32);
        *self.outbound.lock().await = Some(tx);
        let writer_conn = conn.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&writer_conn, &frame).await {
                    debug!("outbound write failed: {e}");
                    return;
                }
            }
        });

        loop {
            match conn.accept_uni().await {
                Ok(mut recv) => match read_frame(&mut recv).await {
                    Ok(frame) => {
                        let agent = self.clone();
                        tokio::spawn(async move {
                            agent.handle_frame(frame).await;
                        });
                    }
                    Err(e) => warn!("bad frame from server: {e}"),
                },
                Err(e) => {
                    info!("connection closed: {e}");
                    break;
                }
            }
        }

        *self.outbound.lock().await = None;
        *self.connection.lock().await = None;
        Ok(self.state() == AgentState::Registered)
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        let outbound = self.outbound.lock().await.clone();
        match outbound {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| anyhow::anyhow!("Connection closed")),
            None => bail!("Connection closed"),
        }
    }

    /// Correlated RPC to the server with the default 30 s deadline.
    async fn send_request(&self, mut frame: Frame) -> Result<Frame> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        frame.correlation_id = Some(correlation_id.clone());
        let (resolve, resolved) = oneshot::channel();
        self.correlations
            .lock()
            .await
            .insert(correlation_id.clone(), resolve);

        if let Err(e) = self.send_frame(frame).await {
            self.correlations.lock().await.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(RPC_TIMEOUT, resolved).await {
            Ok(Ok(reply)) if reply.is_error() => {
                let payload: ErrorPayload = reply
                    .payload_as()
                    .unwrap_or_else(|_| ErrorPayload {
                        code: ErrorCode::Internal,
                        message: "malformed error reply".to_string(),
                    });
                bail!("{}: {}", payload.code, payload.message)
            }
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => bail!("Connection closed"),
            Err(_) => {
                self.correlations.lock().await.remove(&correlation_id);
                bail!("request timed out after {}s", RPC_TIMEOUT.as_secs())
            }
        }
    }

    async fn reject_all(&self) {
        // Dropping the senders rejects every pending wait.
        self.correlations.lock().await.clear();
    }

    async fn handle_frame(self: Arc<Self>, frame: Frame) {
        if frame.correlation_id.is_some()
            && (frame.kind.ends_with(frame_type::SUCCESS_SUFFIX) || frame.is_error())
        {
            let correlation_id = frame.correlation_id.clone().unwrap();
            match self.correlations.lock().await.remove(&correlation_id) {
                Some(resolve) => {
                    let _ = resolve.send(frame);
                }
                None => debug!("stray reply with correlation {correlation_id}"),
            }
            return;
        }

        match frame.kind.as_str() {
            frame_type::CONNECTED => {
                if let Ok(payload) = frame.payload_as::<ConnectedPayload>() {
                    *self.connection_id.lock().unwrap() = Some(payload.connection_id);
                }
                let agent = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = agent.authenticate_and_register().await {
                        error!("session setup failed: {e:#}");
                        if let Some(conn) = agent.connection.lock().await.take() {
                            conn.close(1u32.into(), b"setup failed");
                        }
                    }
                });
            }
            frame_type::PING => {
                let pong = Frame::new(frame_type::PONG, &PongPayload { timestamp: Utc::now() })
                    .unwrap_or_else(|_| Frame::bare(frame_type::PONG));
                if let Err(e) = self.send_frame(pong).await {
                    debug!("pong not sent: {e}");
                }
            }
            frame_type::DISCONNECT => {
                info!("server requested disconnect");
            }
            frame_type::POD_DEPLOY => {
                let agent = self.clone();
                tokio::spawn(async move {
                    agent.on_pod_deploy(frame).await;
                });
            }
            frame_type::POD_STOP => {
                let agent = self.clone();
                tokio::spawn(async move {
                    agent.on_pod_stop(frame).await;
                });
            }
            other => debug!("ignoring unknown frame type {other}"),
        }
    }

    async fn on_pod_deploy(&self, frame: Frame) {
        let payload: DeployPayload = match frame.payload_as() {
            Ok(p) => p,
            Err(e) => {
                let _ = self
                    .send_frame(Frame::error_reply(&frame, ErrorCode::Validation, &e.to_string()))
                    .await;
                return;
            }
        };
        let pod_id = payload.pod_id.clone();
        match self.handler.handle_deploy(payload).await {
            Ok(()) => {
                let reply = Frame::success_reply(&frame, &serde_json::json!({ "podId": pod_id }))
                    .unwrap_or_else(|_| Frame::bare("pod:deploy:success"));
                let _ = self.send_frame(reply).await;
            }
            Err(e) => {
                let _ = self
                    .send_frame(Frame::error_reply(&frame, e.code, &e.message))
                    .await;
            }
        }
    }

    async fn on_pod_stop(&self, frame: Frame) {
        let payload: StopPayload = match frame.payload_as() {
            Ok(p) => p,
            Err(e) => {
                let _ = self
                    .send_frame(Frame::error_reply(&frame, ErrorCode::Validation, &e.to_string()))
                    .await;
                return;
            }
        };
        let pod_id = payload.pod_id.clone();
        match self.handler.handle_stop(payload).await {
            Ok(()) => {
                let reply = Frame::success_reply(&frame, &serde_json::json!({ "podId": pod_id }))
                    .unwrap_or_else(|_| Frame::bare("pod:stop:success"));
                let _ = self.send_frame(reply).await;
            }
            Err(e) => {
                let _ = self
                    .send_frame(Frame::error_reply(&frame, e.code, &e.message))
                    .await;
            }
        }
    }

    fn access_token(&self) -> Option<String> {
        self.config.auth_token.clone().or_else(|| {
            self.persistence
                .as_ref()
                .and_then(|p| p.load_credentials())
                .map(|c| c.access_token)
        })
    }

    async fn authenticate_and_register(self: &Arc<Self>) -> Result<()> {
        self.set_state(AgentState::Authenticating);
        let token = self
            .access_token()
            .context("no auth token configured or persisted")?;
        let reply = self
            .send_request(Frame::new(
                frame_type::AUTHENTICATE,
                &AuthenticatePayload {
                    token: token.clone(),
                },
            )?)
            .await
            .context("authentication failed")?;
        let authed: AuthenticatedPayload = reply
            .payload_as()
            .context("malformed authentication reply")?;
        info!("authenticated as {}", authed.user_id);
        self.set_state(AgentState::Authenticated);

        if let Some(persistence) = &self.persistence {
            let previous = persistence.load_credentials();
            let credentials = NodeCredentials {
                access_token: token,
                refresh_token: previous.as_ref().and_then(|c| c.refresh_token.clone()),
                expires_at: previous.as_ref().and_then(|c| c.expires_at),
                user_id: Some(authed.user_id.clone()),
                email: authed.email.clone(),
                created_at: Utc::now(),
            };
            if let Err(e) = persistence.save_credentials(&credentials) {
                warn!("persisting credentials failed: {e:#}");
            }
        }

        self.register_or_resume().await
    }

    async fn register_or_resume(self: &Arc<Self>) -> Result<()> {
        self.set_state(AgentState::Registering);
        let node_name = self.config.node_name();
        let url = &self.config.orchestrator_url;

        let known_id = self.node_id().or_else(|| {
            if !self.config.resume_existing {
                return None;
            }
            self.persistence
                .as_ref()
                .and_then(|p| p.load_registered_node(url, &node_name))
                .map(|entry| entry.node_id)
        });

        if let Some(node_id) = known_id {
            match self.reconnect_node(&node_id).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // The node record is gone; start over with a clean slate.
                    warn!("reconnect as {node_id} failed ({e:#}), registering fresh");
                    *self.node_id.lock().unwrap() = None;
                    if let Some(p) = &self.persistence {
                        let _ = p.remove_registered_node(url, &node_name);
                    }
                }
            }
        }

        match self.register_node(&node_name).await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("conflict") => {
                // The name is taken: adopt the existing node id by lookup.
                info!("node name {node_name} already registered, adopting");
                let token = self.access_token().context("token vanished mid-flight")?;
                match self.auth_client.node_by_name(&token, &node_name).await? {
                    Some(lookup) => {
                        match self.reconnect_node(&lookup.node.id).await {
                            Ok(()) => Ok(()),
                            Err(_) => {
                                if let Some(p) = &self.persistence {
                                    let _ = p.remove_registered_node(url, &node_name);
                                }
                                self.register_node(&node_name).await
                            }
                        }
                    }
                    None => {
                        if let Some(p) = &self.persistence {
                            let _ = p.remove_registered_node(url, &node_name);
                        }
                        self.register_node(&node_name).await
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn reconnect_node(self: &Arc<Self>, node_id: &str) -> Result<()> {
        let reply = self
            .send_request(Frame::new(
                frame_type::NODE_RECONNECT,
                &ReconnectPayload {
                    node_id: node_id.to_string(),
                },
            )?)
            .await?;
        let payload: RegisteredPayload = reply.payload_as()?;
        self.enter_registered(payload.node_id).await;
        Ok(())
    }

    async fn register_node(self: &Arc<Self>, node_name: &str) -> Result<()> {
        let reply = self
            .send_request(Frame::new(
                frame_type::NODE_REGISTER,
                &RegisterPayload {
                    name: node_name.to_string(),
                    runtime_type: self.config.runtime_type.clone(),
                    capabilities: self.config.capabilities.clone(),
                    allocatable: self.config.allocatable(),
                    labels: self.config.labels.clone(),
                    taints: self.config.taints.clone(),
                },
            )?)
            .await?;
        let payload: RegisteredPayload = reply.payload_as()?;
        if let Some(persistence) = &self.persistence {
            let now = Utc::now();
            let entry = RegisteredNodeEntry {
                node_id: payload.node_id.clone(),
                registered_by: self
                    .persistence
                    .as_ref()
                    .and_then(|p| p.load_credentials())
                    .and_then(|c| c.user_id),
                registered_at: now,
                last_started: now,
            };
            if let Err(e) =
                persistence.save_registered_node(&self.config.orchestrator_url, node_name, entry)
            {
                warn!("persisting node registration failed: {e:#}");
            }
        }
        self.enter_registered(payload.node_id).await;
        Ok(())
    }

    async fn enter_registered(self: &Arc<Self>, node_id: String) {
        info!("registered as node {node_id}");
        *self.node_id.lock().unwrap() = Some(node_id.clone());
        self.set_state(AgentState::Registered);

        if let Some(persistence) = &self.persistence {
            let node_name = self.config.node_name();
            let url = &self.config.orchestrator_url;
            let mut entry = persistence
                .load_registered_node(url, &node_name)
                .unwrap_or_else(|| RegisteredNodeEntry {
                    node_id: node_id.clone(),
                    registered_by: None,
                    registered_at: Utc::now(),
                    last_started: Utc::now(),
                });
            entry.node_id = node_id;
            entry.last_started = Utc::now();
            if let Err(e) = persistence.save_registered_node(url, &node_name, entry) {
                warn!("updating node registration state failed: {e:#}");
            }
        }

        // One heartbeat right away, then the interval. The epoch retires any
        // heartbeat task left over from a previous session.
        let epoch = self
            .heartbeat_epoch
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        self.send_heartbeat().await;
        let agent = self.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs(agent.config.heartbeat_interval_secs);
            loop {
                tokio::select! {
                    _ = agent.cancel.cancelled() => return,
                    _ = sleep(interval) => {}
                }
                if agent.heartbeat_epoch.load(std::sync::atomic::Ordering::SeqCst) != epoch {
                    return;
                }
                if agent.outbound.lock().await.is_none() {
                    // Connection gone; the next session restarts heartbeats.
                    return;
                }
                agent.send_heartbeat().await;
            }
        });
    }

    async fn send_heartbeat(&self) {
        let Some(node_id) = self.node_id() else {
            return;
        };
        let frame = match Frame::new(
            frame_type::NODE_HEARTBEAT,
            &HeartbeatPayload {
                node_id,
                status: NodeStatus::Online,
                allocated: Resources {
                    pods: self.handler.active_pods(),
                    ..Default::default()
                },
                timestamp: Utc::now(),
            },
        ) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("heartbeat frame failed to build: {e}");
                return;
            }
        };
        // Failures are logged only; a dead socket reconnects on its own.
        if let Err(e) = self.send_request(frame).await {
            warn!("heartbeat failed: {e:#}");
        }
    }

    async fn spawn_status_forwarder(self: &Arc<Self>) {
        let mut status_rx = self
            .handler_status_rx()
            .await
            .expect("status receiver already taken");
        let agent = self.clone();
        tokio::spawn(async move {
            while let Some(update) = status_rx.recv().await {
                if agent.cancel.is_cancelled() {
                    return;
                }
                let frame = match Frame::new(frame_type::POD_STATUS_UPDATE, &update) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("status frame failed to build: {e}");
                        continue;
                    }
                };
                let agent = agent.clone();
                tokio::spawn(async move {
                    if let Err(e) = agent.send_request(frame).await {
                        warn!("status update for {} not delivered: {e:#}", update.pod_id);
                    }
                });
            }
        });
    }

    async fn handler_status_rx(&self) -> Option<UnboundedReceiver<StatusUpdatePayload>> {
        self.status_rx.lock().await.take()
    }

    /// Minute-granularity refresh: when the access token nears expiry and a
    /// refresh token exists, swap tokens in place without reconnecting.
    fn spawn_token_refresh(self: &Arc<Self>) {
        let agent = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = agent.cancel.cancelled() => return,
                    _ = sleep(Duration::from_secs(60)) => {}
                }
                agent.refresh_token_if_due().await;
            }
        });
    }

    async fn refresh_token_if_due(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let Some(credentials) = persistence.load_credentials() else {
            return;
        };
        let Some(refresh_token) = credentials.refresh_token.clone() else {
            return;
        };
        let due = credentials
            .expires_at
            .is_some_and(|expires_at| expires_at - Utc::now() <= REFRESH_WINDOW);
        if !due {
            return;
        }
        let Ok(_flight) = self.refresh_flight.try_lock() else {
            return;
        };

        match self.auth_client.refresh(&refresh_token).await {
            Ok(tokens) => {
                let updated = NodeCredentials {
                    access_token: tokens.access_token.clone(),
                    refresh_token: tokens.refresh_token.or(Some(refresh_token)),
                    expires_at: tokens.expires_at,
                    user_id: tokens
                        .user
                        .as_ref()
                        .map(|u| u.id.clone())
                        .or(credentials.user_id),
                    email: tokens.user.and_then(|u| u.email).or(credentials.email),
                    created_at: Utc::now(),
                };
                if let Err(e) = persistence.save_credentials(&updated) {
                    warn!("persisting refreshed credentials failed: {e:#}");
                }
                // In-place header swap; the connection stays up.
                self.executor.set_auth_token(Some(tokens.access_token));
                info!("access token refreshed");
            }
            Err(e) => {
                // Keep the current token and try again next tick.
                warn!("token refresh failed: {e:#}");
            }
        }
    }
}

/// Frames are JSON, one per unidirectional stream.
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
