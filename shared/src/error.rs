//! Error taxonomy for the session protocol
//!
//! Every failure the protocol layer can observe is a [`ProtocolError`]. At the
//! transport boundary each variant collapses onto one of the four wire error
//! kinds so the peer always receives a structured answer.

use crate::message::{ErrorBody, MessageData, MessageKind};
use crate::types::GameKind;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Datagram could not be decoded into an envelope
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown command {kind} for game kind {game_kind}")]
    UnknownCommand {
        kind: MessageKind,
        game_kind: GameKind,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Command is valid but the session is not in a state that accepts it
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A collaborator lookup failed; the caller may retry
    #[error("temporarily unavailable: {0}")]
    Transient(String),

    /// Unexpected failure inside a handler. Never echoed to the peer.
    #[error("internal error: {0}")]
    Internal(String),

    /// Send attempted before the connect handshake completed
    #[error("not ready: connect response has not been processed")]
    NotReady,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Converts the error into the payload sent back to the peer.
    pub fn to_error_data(&self) -> MessageData {
        match self {
            ProtocolError::Malformed(_)
            | ProtocolError::UnknownCommand { .. }
            | ProtocolError::InvalidArgument(_)
            | ProtocolError::Json(_) => MessageData::InvalidArgumentException(ErrorBody {
                reason: self.to_string(),
            }),
            ProtocolError::IllegalState(_) | ProtocolError::NotReady => {
                MessageData::IllegalStateException(ErrorBody {
                    reason: self.to_string(),
                })
            }
            ProtocolError::Authentication(_) => MessageData::AuthenticationFailure(ErrorBody {
                reason: self.to_string(),
            }),
            ProtocolError::Transient(_) => MessageData::InternalServerError(ErrorBody {
                reason: "service temporarily unavailable, retry later".to_string(),
            }),
            ProtocolError::Internal(_) | ProtocolError::Io(_) => {
                MessageData::InternalServerError(ErrorBody {
                    reason: "internal server error".to_string(),
                })
            }
        }
    }

    /// Reads an error payload received from the peer back into an error.
    pub fn from_error_data(data: &MessageData) -> Option<Self> {
        let reason = data.error_reason()?.to_string();
        let error = match data.kind() {
            MessageKind::AuthenticationFailure => ProtocolError::Authentication(reason),
            MessageKind::IllegalStateException => ProtocolError::IllegalState(reason),
            MessageKind::InvalidArgumentException => ProtocolError::InvalidArgument(reason),
            _ => ProtocolError::Internal(reason),
        };
        Some(error)
    }

    /// True for failures a caller may resolve by re-issuing the command.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProtocolError::Transient(_))
    }
}

/// Outcome of a Pending-Send Record that was not acknowledged
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("message {message_id} expired after {attempts} attempt(s) without an ack")]
    Expired { message_id: Uuid, attempts: u32 },

    /// Transport shut down while the record was outstanding
    #[error("message {message_id} abandoned: transport closed")]
    Abandoned { message_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        let cases = vec![
            (
                ProtocolError::Malformed("missing key".into()),
                MessageKind::InvalidArgumentException,
            ),
            (
                ProtocolError::UnknownCommand {
                    kind: MessageKind::CommandBombPlace,
                    game_kind: GameKind::Exploration,
                },
                MessageKind::InvalidArgumentException,
            ),
            (
                ProtocolError::IllegalState("not connected".into()),
                MessageKind::IllegalStateException,
            ),
            (ProtocolError::NotReady, MessageKind::IllegalStateException),
            (
                ProtocolError::Authentication("key mismatch".into()),
                MessageKind::AuthenticationFailure,
            ),
            (
                ProtocolError::Transient("db down".into()),
                MessageKind::InternalServerError,
            ),
            (
                ProtocolError::Internal("boom".into()),
                MessageKind::InternalServerError,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_error_data().kind(), expected, "{}", error);
        }
    }

    #[test]
    fn test_internal_detail_not_echoed() {
        let error = ProtocolError::Internal("index out of bounds at handlers.rs:42".into());
        match error.to_error_data() {
            MessageData::InternalServerError(body) => {
                assert!(!body.reason.contains("handlers.rs"));
            }
            other => panic!("Unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_error_payload_read_back() {
        let data = ProtocolError::Authentication("stale key".into()).to_error_data();
        match ProtocolError::from_error_data(&data) {
            Some(ProtocolError::Authentication(reason)) => assert!(reason.contains("stale key")),
            other => panic!("Unexpected error {:?}", other),
        }
        assert!(ProtocolError::from_error_data(&MessageData::Empty).is_none());
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ProtocolError::Transient("x".into()).is_retryable());
        assert!(!ProtocolError::Internal("x".into()).is_retryable());
        assert!(!ProtocolError::NotReady.is_retryable());
    }
}
