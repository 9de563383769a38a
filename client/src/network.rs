use crate::commands::{self, ClientRegistry, SendPolicy};
use crate::session::LocalGameUserState;
use log::{debug, error, info, warn};
use shared::message::{ChatMessage, ConnectAccepted, ConnectRequest, Ping, PlayerState};
use shared::{
    Delivery, GameCredential, GameKind, IncomingMessage, MessageData, MessageKind,
    OutgoingMessage, ProtocolError, RawEnvelope, Transport, CLIENT_HEARTBEAT_INTERVAL,
    MAX_DATAGRAM_SIZE, MIN_TIMER_PERIOD, RESEND_INTERVAL,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Version reported in the connect request
pub const CLIENT_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    /// Local address to bind; port 0 picks an ephemeral one
    pub bind: String,
    pub heartbeat_interval: Duration,
    pub resend_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:8080".to_string(),
            bind: "0.0.0.0:0".to_string(),
            heartbeat_interval: CLIENT_HEARTBEAT_INTERVAL,
            resend_interval: RESEND_INTERVAL,
        }
    }
}

/// Background tasks of a started client. Dropping this stops them.
pub struct ClientTasks {
    handles: Vec<JoinHandle<()>>,
}

impl ClientTasks {
    pub fn abort(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for ClientTasks {
    fn drop(&mut self) {
        self.abort();
    }
}

/// One player's connection to one game. Cheap to clone; clones share the
/// socket and the session state.
#[derive(Clone)]
pub struct Client {
    transport: Transport,
    server_addr: SocketAddr,
    heartbeat_interval: Duration,
    state: Arc<Mutex<LocalGameUserState>>,
    registry: Arc<ClientRegistry>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_addr", &self.server_addr)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub async fn new(
        config: &ClientConfig,
        credential: GameCredential,
        game_kind: GameKind,
    ) -> Result<Self, ProtocolError> {
        let server_addr: SocketAddr = config.server.parse().map_err(|e| {
            ProtocolError::InvalidArgument(format!("server address {}: {}", config.server, e))
        })?;
        let registry =
            commands::build_registry().map_err(|e| ProtocolError::Internal(e.to_string()))?;
        let transport = Transport::bind(&config.bind, config.resend_interval).await?;
        debug!("Client bound to {}", transport.local_addr()?);

        let heartbeat_interval = config.heartbeat_interval.max(MIN_TIMER_PERIOD);
        let state = LocalGameUserState::new(credential, game_kind)
            .with_heartbeat_interval(heartbeat_interval);

        Ok(Client {
            transport,
            server_addr,
            heartbeat_interval,
            state: Arc::new(Mutex::new(state)),
            registry: Arc::new(registry),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        self.transport.local_addr()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.is_ready()
    }

    /// Runs `f` against the session state.
    pub async fn inspect<R>(&self, f: impl FnOnce(&LocalGameUserState) -> R) -> R {
        f(&*self.state.lock().await)
    }

    /// Spawns the receive, retry and heartbeat loops.
    pub fn start(&self) -> ClientTasks {
        let receiver = self.clone();
        let heartbeat = self.clone();

        ClientTasks {
            handles: vec![
                tokio::spawn(async move { receiver.receive_loop().await }),
                self.transport.spawn_retry_loop(),
                tokio::spawn(async move { heartbeat.heartbeat_loop().await }),
            ],
        }
    }

    /// Sends a command through its invoker. Everything except connect is
    /// refused with [`ProtocolError::NotReady`] until the connect response
    /// has been processed; no datagram leaves in that case.
    pub async fn send(&self, data: MessageData) -> Result<Option<Delivery>, ProtocolError> {
        let kind = data.kind();
        let (policy, key) = {
            let state = self.state.lock().await;
            if kind != MessageKind::CommandConnect && !state.is_ready() {
                return Err(ProtocolError::NotReady);
            }
            let game_kind = state.game_kind;
            let invoke = commands::invoker(&self.registry, game_kind, kind)
                .ok_or(ProtocolError::UnknownCommand { kind, game_kind })?;
            (invoke(&state, &data)?, state.key().to_string())
        };

        let builder = OutgoingMessage::command(data).key(key);
        let message = match policy {
            SendPolicy::Acked(viability) => builder.expect_ack(viability).build(),
            SendPolicy::FireAndForget => builder.build(),
        };
        self.transport.send(self.server_addr, message).await
    }

    /// Sends an acked command and waits for the server's reply. Error
    /// replies come back as the matching [`ProtocolError`].
    pub async fn request(&self, data: MessageData) -> Result<IncomingMessage, ProtocolError> {
        let kind = data.kind();
        let delivery = self.send(data).await?.ok_or_else(|| {
            ProtocolError::Internal(format!("{} is not sent with an ack", kind))
        })?;

        let reply = delivery
            .wait()
            .await
            .map_err(|e| ProtocolError::Transient(e.to_string()))?;

        if reply.is_success() {
            Ok(reply)
        } else {
            Err(ProtocolError::from_error_data(&reply.data).unwrap_or_else(|| {
                ProtocolError::IllegalState(format!("{} rejected", kind))
            }))
        }
    }

    pub async fn connect(&self) -> Result<ConnectAccepted, ProtocolError> {
        info!("Connecting to {}...", self.server_addr);
        let reply = self
            .request(MessageData::CommandConnect(ConnectRequest {
                client_version: CLIENT_VERSION,
            }))
            .await?;

        match reply.data {
            MessageData::RespConnect(accepted) => Ok(accepted),
            other => Err(ProtocolError::Malformed(format!(
                "connect answered with {}",
                other.kind()
            ))),
        }
    }

    /// Measures one round trip.
    pub async fn ping(&self) -> Result<Duration, ProtocolError> {
        self.request(MessageData::CommandPing(Ping {
            sent_at: shared::now_millis(),
        }))
        .await?;
        self.state
            .lock()
            .await
            .round_trip
            .ok_or_else(|| ProtocolError::Internal("ping reply not recorded".into()))
    }

    pub async fn heartbeat(&self) -> Result<(), ProtocolError> {
        self.request(MessageData::CommandHeartbeat).await.map(|_| ())
    }

    pub async fn say(&self, text: &str) -> Result<(), ProtocolError> {
        self.request(MessageData::CommandChat(ChatMessage {
            text: text.to_string(),
            from: None,
        }))
        .await
        .map(|_| ())
    }

    /// Unacked position update
    pub async fn send_player_state(
        &self,
        x: f32,
        y: f32,
        vel_x: f32,
        vel_y: f32,
    ) -> Result<(), ProtocolError> {
        self.send(MessageData::CommandPlayerState(PlayerState {
            user_id: None,
            x,
            y,
            vel_x,
            vel_y,
        }))
        .await
        .map(|_| ())
    }

    pub async fn disconnect(&self) -> Result<(), ProtocolError> {
        info!("Disconnecting from {}", self.server_addr);
        self.request(MessageData::CommandDisconnect).await.map(|_| ())
    }

    async fn receive_loop(&self) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            match self.transport.recv_from(&mut buffer).await {
                Ok((len, addr)) => {
                    if addr != self.server_addr {
                        debug!("Ignoring datagram from {}", addr);
                        continue;
                    }
                    self.handle_datagram(&buffer[..len], Instant::now()).await;
                }
                Err(e) => {
                    error!("Error receiving datagram: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    async fn heartbeat_loop(&self) {
        let mut ticker = interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.is_ready().await {
                continue;
            }
            // The response handler drops readiness on rejection
            match self.send(MessageData::CommandHeartbeat).await {
                Ok(_) => debug!("Heartbeat sent"),
                Err(ProtocolError::NotReady) => {}
                Err(e) => warn!("Failed to send heartbeat: {}", e),
            }
        }
    }

    /// Processes one datagram from the server.
    pub async fn handle_datagram(&self, bytes: &[u8], now: Instant) {
        let raw = match RawEnvelope::decode(bytes) {
            Ok(raw) => raw,
            Err(e) => {
                match RawEnvelope::salvage_message_id(bytes) {
                    Some(message_id) => {
                        warn!("Rejecting malformed datagram {}: {}", message_id, e);
                        let key = RawEnvelope::salvage_key(bytes).unwrap_or_default();
                        self.reply(OutgoingMessage::error(message_id, &e).key(key).build())
                            .await;
                    }
                    None => warn!("Dropping undecodable datagram: {}", e),
                }
                return;
            }
        };

        let game_kind = self.state.lock().await.game_kind;
        let registry = &self.registry;
        let decoded = raw.decode_payload(game_kind, |gk, kind| commands::parser(registry, gk, kind));
        let message_id = raw.message_id;
        let key = raw.key.clone();

        match decoded {
            Ok(data) => {
                let incoming = raw.into_incoming(data);
                if incoming.ack_message_id.is_some() {
                    self.handle_reply(incoming, now).await;
                } else {
                    self.handle_command(incoming).await;
                }
            }
            Err(e) => {
                warn!("Failed to decode payload: {}", e);
                if let (Some(message_id), false) = (message_id, raw.is_ack()) {
                    self.reply(OutgoingMessage::error(message_id, &e).key(key).build())
                        .await;
                }
            }
        }
    }

    async fn handle_reply(&self, reply: IncomingMessage, now: Instant) {
        let Some(message_id) = reply.ack_message_id else {
            return;
        };
        let Some(pending) = self.transport.take_pending(&message_id).await else {
            debug!("Ack for {} arrived after its record was settled", message_id);
            return;
        };

        {
            let mut state = self.state.lock().await;
            let kind = pending.kind();
            debug!("{} acked after {} attempt(s)", kind, pending.attempts());

            if reply.kind() == MessageKind::AuthenticationFailure {
                state.mark_not_ready("credential rejected", now);
            }

            match commands::responder(&self.registry, state.game_kind, kind) {
                Some(respond) => {
                    if let Err(e) = respond(&mut state, &reply, now) {
                        warn!("{} failed: {}", kind, e);
                    }
                }
                None if !reply.is_success() => {
                    warn!("{} rejected: {}", kind, reply.kind());
                }
                None => {}
            }
        }

        pending.resolve(reply);
    }

    async fn handle_command(&self, command: IncomingMessage) {
        let kind = command.kind();
        let reply = {
            let mut state = self.state.lock().await;

            if let Some(message_id) = command.message_id {
                if let Some(cached) = state.cached_response(&message_id) {
                    debug!("Answering resent {} from cache", kind);
                    let cached = cached.clone();
                    drop(state);
                    self.reply(cached).await;
                    return;
                }
            }

            let game_kind = state.game_kind;
            let result = match commands::executor(&self.registry, game_kind, kind) {
                Some(execute) => execute(&mut state, &command.data),
                None => Err(ProtocolError::UnknownCommand { kind, game_kind }),
            };

            let Some(message_id) = command.message_id else {
                if let Err(e) = result {
                    warn!("{} failed: {}", kind, e);
                }
                return;
            };

            match result {
                Ok(data) => {
                    let reply = OutgoingMessage::response(message_id, data, true)
                        .key(command.key.clone())
                        .build();
                    state.remember_response(message_id, reply.clone());
                    reply
                }
                Err(e) => {
                    warn!("{} failed: {}", kind, e);
                    OutgoingMessage::error(message_id, &e)
                        .key(command.key.clone())
                        .build()
                }
            }
        };

        self.reply(reply).await;
    }

    async fn reply(&self, message: OutgoingMessage) {
        let kind = message.kind();
        if let Err(e) = self.transport.send(self.server_addr, message).await {
            error!("Failed to send {} reply: {}", kind, e);
        }
    }
}
