//! Server-side view of one account in one game

use shared::message::PlayerState;
use shared::{
    ConnectionState, GameCredential, OutgoingMessage, ResponseCache, UserId, CREDENTIAL_TTL,
    RESPONSE_CACHE_CAPACITY,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Session of an account inside a game
///
/// Created unconnected when the first datagram with a valid credential
/// arrives, then driven through the connection state machine by commands.
#[derive(Debug)]
pub struct GameUserState {
    pub user_id: UserId,
    /// Account name as reported by the directory
    pub name: String,
    credential: GameCredential,
    /// Encoded credential, used as `key` on datagrams sent to this session
    key: String,
    /// Where replies go; follows the client if its source address changes
    pub peer: SocketAddr,
    pub connection: ConnectionState,
    /// Play time of earlier sessions of this account in the game
    prior_play_time: Duration,
    credential_valid_until: Instant,
    responses: ResponseCache<OutgoingMessage>,
    /// Last movement update reported by the client
    pub last_state: Option<PlayerState>,
}

impl GameUserState {
    pub fn new(name: String, credential: GameCredential, peer: SocketAddr, now: Instant) -> Self {
        Self {
            user_id: credential.user_id,
            name,
            key: credential.encode(),
            credential,
            peer,
            connection: ConnectionState::new(),
            prior_play_time: Duration::ZERO,
            credential_valid_until: now + CREDENTIAL_TTL,
            responses: ResponseCache::new(RESPONSE_CACHE_CAPACITY),
            last_state: None,
        }
    }

    pub fn with_prior_play_time(mut self, prior: Duration) -> Self {
        self.prior_play_time = prior;
        self
    }

    /// Lifetime play time: earlier sessions plus this one.
    pub fn total_play_time(&self, now: Instant) -> Duration {
        self.prior_play_time + self.connection.play_time(now)
    }

    pub fn credential(&self) -> &GameCredential {
        &self.credential
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The presented credential carries the key this session was admitted with.
    pub fn presents(&self, credential: &GameCredential) -> bool {
        self.credential.key == credential.key
    }

    pub fn credential_stale(&self, now: Instant) -> bool {
        now >= self.credential_valid_until
    }

    pub fn refresh_credential(&mut self, now: Instant) {
        self.credential_valid_until = now + CREDENTIAL_TTL;
    }

    /// Returns the previous peer when it changed.
    pub fn rebind(&mut self, peer: SocketAddr) -> Option<SocketAddr> {
        if self.peer == peer {
            return None;
        }
        Some(std::mem::replace(&mut self.peer, peer))
    }

    pub fn cached_response(&self, message_id: &Uuid) -> Option<&OutgoingMessage> {
        self.responses.get(message_id)
    }

    pub fn remember_response(&mut self, message_id: Uuid, response: OutgoingMessage) {
        self.responses.insert(message_id, response);
    }
}
