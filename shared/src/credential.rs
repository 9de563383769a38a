// Per-game credential presented as the envelope `key`.
//
// The account API hands each player a base64 blob of `{gameId, userId, key}`
// once per game. The client echoes it verbatim on every datagram; the server
// decodes it to find the game and session the datagram belongs to.

use crate::error::ProtocolError;
use crate::types::{GameId, UserId};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameCredential {
    pub game_id: GameId,
    pub user_id: UserId,
    /// Opaque secret issued by the account API
    pub key: String,
}

impl GameCredential {
    pub fn new(game_id: GameId, user_id: UserId, key: impl Into<String>) -> Self {
        Self {
            game_id,
            user_id,
            key: key.into(),
        }
    }

    /// Wire form: base64 of the JSON object.
    pub fn encode(&self) -> String {
        // Serializing a struct of ids and a string cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }

    pub fn decode(encoded: &str) -> Result<Self, ProtocolError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ProtocolError::Authentication(format!("credential is not base64: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ProtocolError::Authentication(format!("credential is not valid: {}", e)))
    }
}
