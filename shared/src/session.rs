//! Connection state machine shared by server and client sessions
//!
//! [`ConnectionState`] implements `UNCONNECTED → CONNECTED → (TIMED_OUT |
//! DISCONNECTED)` together with the heartbeat deadline, the connect cooldown
//! and play-time accounting. All methods take the current instant explicitly
//! so callers (and tests) control the clock.
//!
//! [`ResponseCache`] remembers the replies to recently executed commands so a
//! retried command is answered again instead of being executed twice.

use crate::error::ProtocolError;
use crate::message::MessageKind;
use crate::{CONNECT_COOLDOWN, HEARTBEAT_TIMEOUT};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unconnected,
    Connected,
    TimedOut,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ConnectionState {
    status: SessionStatus,
    heartbeat_deadline: Option<Instant>,
    connected_at: Option<Instant>,
    accumulated: Duration,
    heartbeat_timeout: Duration,
    cooldown: Duration,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::with_timeouts(HEARTBEAT_TIMEOUT, CONNECT_COOLDOWN)
    }

    pub fn with_timeouts(heartbeat_timeout: Duration, cooldown: Duration) -> Self {
        Self {
            status: SessionStatus::Unconnected,
            heartbeat_deadline: None,
            connected_at: None,
            accumulated: Duration::ZERO,
            heartbeat_timeout,
            cooldown,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at
    }

    pub fn heartbeat_deadline(&self) -> Option<Instant> {
        self.heartbeat_deadline
    }

    /// Enters `CONNECTED`. A connect on an already connected session closes
    /// the running interval first, so play time is never counted twice.
    pub fn connect(&mut self, now: Instant) {
        self.finalize_play_time(now);
        self.status = SessionStatus::Connected;
        self.connected_at = Some(now);
        self.heartbeat_deadline = Some(now + self.heartbeat_timeout);
    }

    pub fn heartbeat(&mut self, now: Instant) -> Result<(), ProtocolError> {
        self.admit(MessageKind::CommandHeartbeat, now)?;
        self.heartbeat_deadline = Some(now + self.heartbeat_timeout);
        Ok(())
    }

    /// Returns whether the session was connected.
    pub fn disconnect(&mut self, now: Instant) -> bool {
        self.leave(now, SessionStatus::Disconnected)
    }

    pub fn time_out(&mut self, now: Instant) -> bool {
        self.leave(now, SessionStatus::TimedOut)
    }

    fn leave(&mut self, now: Instant, status: SessionStatus) -> bool {
        let was_connected = self.is_connected();
        self.finalize_play_time(now);
        self.heartbeat_deadline = None;
        if was_connected || status == SessionStatus::Disconnected {
            self.status = status;
        }
        was_connected
    }

    fn finalize_play_time(&mut self, now: Instant) {
        if let Some(connected_at) = self.connected_at.take() {
            self.accumulated += now.saturating_duration_since(connected_at);
        }
    }

    /// Connected with the heartbeat deadline reached. Never true while
    /// unconnected since no deadline is enforced there.
    pub fn heartbeat_expired(&self, now: Instant) -> bool {
        match (self.status, self.heartbeat_deadline) {
            (SessionStatus::Connected, Some(deadline)) => now >= deadline,
            _ => false,
        }
    }

    /// True on `[connectedAt, connectedAt + cooldown)`.
    pub fn in_cooldown(&self, now: Instant) -> bool {
        match (self.status, self.connected_at) {
            (SessionStatus::Connected, Some(connected_at)) => {
                now >= connected_at && now < connected_at + self.cooldown
            }
            _ => false,
        }
    }

    pub fn play_time(&self, now: Instant) -> Duration {
        match self.connected_at {
            Some(connected_at) if self.is_connected() => {
                self.accumulated + now.saturating_duration_since(connected_at)
            }
            _ => self.accumulated,
        }
    }

    /// Decides whether a command of `kind` may run in the current state.
    ///
    /// Connect is always admitted; everything else needs a live connection.
    pub fn admit(&self, kind: MessageKind, now: Instant) -> Result<(), ProtocolError> {
        if kind == MessageKind::CommandConnect {
            return Ok(());
        }

        match self.status {
            SessionStatus::Connected if self.heartbeat_expired(now) => Err(
                ProtocolError::IllegalState(format!("{} rejected: heartbeat deadline elapsed", kind)),
            ),
            SessionStatus::Connected => Ok(()),
            SessionStatus::Unconnected | SessionStatus::Disconnected | SessionStatus::TimedOut => {
                Err(ProtocolError::IllegalState(format!(
                    "{} rejected: session is not connected",
                    kind
                )))
            }
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded map of `messageId` to the reply that was sent for it
#[derive(Debug, Clone)]
pub struct ResponseCache<T> {
    capacity: usize,
    order: VecDeque<Uuid>,
    entries: HashMap<Uuid, T>,
}

impl<T> ResponseCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn get(&self, message_id: &Uuid) -> Option<&T> {
        self.entries.get(message_id)
    }

    pub fn insert(&mut self, message_id: Uuid, response: T) {
        if self.entries.insert(message_id, response).is_some() {
            return;
        }
        self.order.push_back(message_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
