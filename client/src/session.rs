//! Client-side session: connection status plus what the server told us

use log::{info, warn};
use shared::message::{
    BombDetonation, BombPlacement, ChatMessage, ConnectAccepted, EntityState, PlayerState,
    Projectile,
};
use shared::{
    ConnectionState, GameCredential, GameKind, OutgoingMessage, ResponseCache, UserId,
    CLIENT_HEARTBEAT_INTERVAL, MIN_TIMER_PERIOD, RESPONSE_CACHE_CAPACITY,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Kept chat lines
pub const CHAT_HISTORY: usize = 100;
/// Kept bomb placements and detonations
pub const BOMB_HISTORY: usize = 64;

/// Local mirror of the player's session in one game
///
/// `ready` is the readiness gate: it is set only once the connect response
/// has been processed and cleared again when the server rejects a heartbeat
/// or the credential.
#[derive(Debug)]
pub struct LocalGameUserState {
    credential: GameCredential,
    key: String,
    pub game_kind: GameKind,
    pub connection: ConnectionState,
    ready: bool,
    pub accepted: Option<ConnectAccepted>,
    pub chat_log: Vec<ChatMessage>,
    pub players: HashMap<UserId, PlayerState>,
    pub entities: HashMap<u64, EntityState>,
    pub projectiles: Vec<Projectile>,
    pub bombs: Vec<BombPlacement>,
    pub detonations: Vec<BombDetonation>,
    pub round_trip: Option<Duration>,
    heartbeat_interval: Duration,
    responses: ResponseCache<OutgoingMessage>,
}

impl LocalGameUserState {
    pub fn new(credential: GameCredential, game_kind: GameKind) -> Self {
        Self {
            key: credential.encode(),
            credential,
            game_kind,
            connection: ConnectionState::new(),
            ready: false,
            accepted: None,
            chat_log: Vec::new(),
            players: HashMap::new(),
            entities: HashMap::new(),
            projectiles: Vec::new(),
            bombs: Vec::new(),
            detonations: Vec::new(),
            round_trip: None,
            heartbeat_interval: CLIENT_HEARTBEAT_INTERVAL,
            responses: ResponseCache::new(RESPONSE_CACHE_CAPACITY),
        }
    }

    /// Zero is raised to [`MIN_TIMER_PERIOD`].
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_TIMER_PERIOD);
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn credential(&self) -> &GameCredential {
        &self.credential
    }

    /// Encoded credential sent as `key` on every datagram
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn user_id(&self) -> UserId {
        self.credential.user_id
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Connect response processed: open the gate.
    pub fn mark_connected(&mut self, accepted: ConnectAccepted, now: Instant) {
        info!(
            "Connected to {} as {} with {} other player(s)",
            accepted.game_id,
            accepted.user_id,
            accepted.players.len()
        );
        if accepted.game_kind != self.game_kind {
            warn!(
                "Server reports game kind {}, expected {}",
                accepted.game_kind, self.game_kind
            );
            self.game_kind = accepted.game_kind;
        }
        self.connection.connect(now);
        self.accepted = Some(accepted);
        self.ready = true;
    }

    /// Closes the gate; only a new connect handshake reopens it.
    pub fn mark_not_ready(&mut self, reason: &str, now: Instant) {
        if self.ready {
            warn!("Session no longer ready: {}", reason);
        }
        self.ready = false;
        self.connection.disconnect(now);
    }

    pub fn push_chat(&mut self, message: ChatMessage) {
        push_bounded(&mut self.chat_log, message, CHAT_HISTORY);
    }

    pub fn push_bomb(&mut self, bomb: BombPlacement) {
        push_bounded(&mut self.bombs, bomb, BOMB_HISTORY);
    }

    pub fn push_detonation(&mut self, detonation: BombDetonation) {
        push_bounded(&mut self.detonations, detonation, BOMB_HISTORY);
    }

    pub fn cached_response(&self, message_id: &Uuid) -> Option<&OutgoingMessage> {
        self.responses.get(message_id)
    }

    pub fn remember_response(&mut self, message_id: Uuid, response: OutgoingMessage) {
        self.responses.insert(message_id, response);
    }
}

/// Appends and drops the oldest entries beyond `limit`.
pub(crate) fn push_bounded<T>(log: &mut Vec<T>, item: T, limit: usize) {
    log.push(item);
    if log.len() > limit {
        let excess = log.len() - limit;
        log.drain(..excess);
    }
}
