//! # Shared Session Protocol
//!
//! Types and machinery used by both the game server and the client to turn an
//! unreliable datagram socket into a request/response channel.
//!
//! ## Layers
//!
//! - [`envelope`]: wire envelopes around every datagram (`createdAt`,
//!   `messageId`/`ackMessageId`, `key`, `data`, `success`, `viability`)
//! - [`message`]: the message-kind catalogue and payload types
//! - [`registry`]: declarative (game kind, message kind, role) handler table
//! - [`session`]: connection state machine and response cache
//! - [`transport`]: UDP socket, pending-send tracking and resends
//! - [`credential`]: the base64 per-game credential carried as `key`
//!
//! The protocol constants below are shared so both sides agree on deadlines.

use std::time::Duration;

pub mod credential;
pub mod envelope;
pub mod error;
pub mod message;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

pub use credential::GameCredential;
pub use envelope::{now_millis, IncomingMessage, OutgoingMessage, RawEnvelope};
pub use error::{DeliveryError, ProtocolError};
pub use message::{MessageData, MessageKind, ParseFn};
pub use registry::{
    CommandDefinition, CommandRegistry, RegistryBuilder, RegistryError, Role, RoleHandler, Scope,
};
pub use session::{ConnectionState, ResponseCache, SessionStatus};
pub use transport::{Delivery, PendingSend, RetryQueue, Transport};
pub use types::{GameId, GameKind, UserId};

/// A connected session without a heartbeat for this long is timed out
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
/// Window after connecting during which the session reports cooldown
pub const CONNECT_COOLDOWN: Duration = Duration::from_secs(3);
/// How long a validated credential is trusted before it is checked again
pub const CREDENTIAL_TTL: Duration = Duration::from_secs(10);
pub const RESEND_INTERVAL: Duration = Duration::from_millis(500);

/// Floor for every timer period; `tokio::time::interval` rejects zero
pub const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);
pub const DEFAULT_VIABILITY: Duration = Duration::from_millis(5000);
pub const CLIENT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
pub const MAX_DATAGRAM_SIZE: usize = 8 * 1024;
pub const RESPONSE_CACHE_CAPACITY: usize = 64;
pub const DEFAULT_MAX_PLAYERS: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_outlives_client_interval() {
        assert!(CLIENT_HEARTBEAT_INTERVAL * 3 <= HEARTBEAT_TIMEOUT);
        assert!(CONNECT_COOLDOWN < HEARTBEAT_TIMEOUT);
    }

    #[test]
    fn test_viability_allows_several_resends() {
        assert!(DEFAULT_VIABILITY.as_millis() / RESEND_INTERVAL.as_millis() >= 5);
    }
}
