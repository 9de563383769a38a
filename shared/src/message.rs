//! Message catalogue: message kinds, payload types and per-kind parsers
//!
//! The `data` field of every envelope is a [`MessageData`], an internally
//! tagged union whose `type` discriminator is the [`MessageKind`]. Decoding is
//! two-step: the envelope layer reads the discriminator, then hands the raw
//! JSON to the parser registered for that kind (see [`parser_definitions`]),
//! so a game kind only understands the commands registered for it.

use crate::error::ProtocolError;
use crate::registry::{CommandDefinition, Role, RoleHandler};
use crate::types::{GameId, GameKind, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Discriminator of every payload that can travel in an envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    CommandPing,
    RespPing,
    CommandConnect,
    RespConnect,
    CommandDisconnect,
    CommandHeartbeat,
    CommandChat,
    CommandPlayerState,
    CommandEntityState,
    CommandItemPickup,
    CommandItemDrop,
    CommandProjectileFire,
    CommandBombPlace,
    CommandBombDetonate,
    Empty,
    AuthenticationFailure,
    InternalServerError,
    InvalidArgumentException,
    IllegalStateException,
}

impl MessageKind {
    pub const ALL: [MessageKind; 19] = [
        MessageKind::CommandPing,
        MessageKind::RespPing,
        MessageKind::CommandConnect,
        MessageKind::RespConnect,
        MessageKind::CommandDisconnect,
        MessageKind::CommandHeartbeat,
        MessageKind::CommandChat,
        MessageKind::CommandPlayerState,
        MessageKind::CommandEntityState,
        MessageKind::CommandItemPickup,
        MessageKind::CommandItemDrop,
        MessageKind::CommandProjectileFire,
        MessageKind::CommandBombPlace,
        MessageKind::CommandBombDetonate,
        MessageKind::Empty,
        MessageKind::AuthenticationFailure,
        MessageKind::InternalServerError,
        MessageKind::InvalidArgumentException,
        MessageKind::IllegalStateException,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::CommandPing => "COMMAND_PING",
            MessageKind::RespPing => "RESP_PING",
            MessageKind::CommandConnect => "COMMAND_CONNECT",
            MessageKind::RespConnect => "RESP_CONNECT",
            MessageKind::CommandDisconnect => "COMMAND_DISCONNECT",
            MessageKind::CommandHeartbeat => "COMMAND_HEARTBEAT",
            MessageKind::CommandChat => "COMMAND_CHAT",
            MessageKind::CommandPlayerState => "COMMAND_PLAYER_STATE",
            MessageKind::CommandEntityState => "COMMAND_ENTITY_STATE",
            MessageKind::CommandItemPickup => "COMMAND_ITEM_PICKUP",
            MessageKind::CommandItemDrop => "COMMAND_ITEM_DROP",
            MessageKind::CommandProjectileFire => "COMMAND_PROJECTILE_FIRE",
            MessageKind::CommandBombPlace => "COMMAND_BOMB_PLACE",
            MessageKind::CommandBombDetonate => "COMMAND_BOMB_DETONATE",
            MessageKind::Empty => "EMPTY",
            MessageKind::AuthenticationFailure => "AUTHENTICATION_FAILURE",
            MessageKind::InternalServerError => "INTERNAL_SERVER_ERROR",
            MessageKind::InvalidArgumentException => "INVALID_ARGUMENT_EXCEPTION",
            MessageKind::IllegalStateException => "ILLEGAL_STATE_EXCEPTION",
        }
    }

    /// One of the four universal error kinds
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            MessageKind::AuthenticationFailure
                | MessageKind::InternalServerError
                | MessageKind::InvalidArgumentException
                | MessageKind::IllegalStateException
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::Malformed(format!("unknown message kind `{}`", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    pub sent_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingReply {
    /// Echo of the ping's `sentAt`
    pub sent_at: u64,
    pub server_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(default)]
    pub client_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAccepted {
    pub game_id: GameId,
    pub user_id: UserId,
    pub game_kind: GameKind,
    /// Play time accumulated before this connection
    pub play_time_ms: u64,
    /// Other accounts currently connected to the game
    pub players: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub text: String,
    /// Filled in by the server when relaying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub vel_x: f32,
    #[serde(default)]
    pub vel_y: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityState {
    pub entity_id: u64,
    pub entity_kind: String,
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemInteraction {
    pub item_id: u64,
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Projectile {
    /// Assigned by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projectile_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<UserId>,
    pub x: f32,
    pub y: f32,
    pub dir_x: f32,
    pub dir_y: f32,
    pub speed: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BombPlacement {
    pub tile_x: i32,
    pub tile_y: i32,
    pub fuse_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BombDetonation {
    pub tile_x: i32,
    pub tile_y: i32,
    pub radius: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub reason: String,
}

/// Payload of an envelope, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageData {
    CommandPing(Ping),
    RespPing(PingReply),
    CommandConnect(ConnectRequest),
    RespConnect(ConnectAccepted),
    CommandDisconnect,
    CommandHeartbeat,
    CommandChat(ChatMessage),
    CommandPlayerState(PlayerState),
    CommandEntityState(EntityState),
    CommandItemPickup(ItemInteraction),
    CommandItemDrop(ItemInteraction),
    CommandProjectileFire(Projectile),
    CommandBombPlace(BombPlacement),
    CommandBombDetonate(BombDetonation),
    Empty,
    AuthenticationFailure(ErrorBody),
    InternalServerError(ErrorBody),
    InvalidArgumentException(ErrorBody),
    IllegalStateException(ErrorBody),
}

impl MessageData {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageData::CommandPing(_) => MessageKind::CommandPing,
            MessageData::RespPing(_) => MessageKind::RespPing,
            MessageData::CommandConnect(_) => MessageKind::CommandConnect,
            MessageData::RespConnect(_) => MessageKind::RespConnect,
            MessageData::CommandDisconnect => MessageKind::CommandDisconnect,
            MessageData::CommandHeartbeat => MessageKind::CommandHeartbeat,
            MessageData::CommandChat(_) => MessageKind::CommandChat,
            MessageData::CommandPlayerState(_) => MessageKind::CommandPlayerState,
            MessageData::CommandEntityState(_) => MessageKind::CommandEntityState,
            MessageData::CommandItemPickup(_) => MessageKind::CommandItemPickup,
            MessageData::CommandItemDrop(_) => MessageKind::CommandItemDrop,
            MessageData::CommandProjectileFire(_) => MessageKind::CommandProjectileFire,
            MessageData::CommandBombPlace(_) => MessageKind::CommandBombPlace,
            MessageData::CommandBombDetonate(_) => MessageKind::CommandBombDetonate,
            MessageData::Empty => MessageKind::Empty,
            MessageData::AuthenticationFailure(_) => MessageKind::AuthenticationFailure,
            MessageData::InternalServerError(_) => MessageKind::InternalServerError,
            MessageData::InvalidArgumentException(_) => MessageKind::InvalidArgumentException,
            MessageData::IllegalStateException(_) => MessageKind::IllegalStateException,
        }
    }

    /// Reason carried by an error payload
    pub fn error_reason(&self) -> Option<&str> {
        match self {
            MessageData::AuthenticationFailure(body)
            | MessageData::InternalServerError(body)
            | MessageData::InvalidArgumentException(body)
            | MessageData::IllegalStateException(body) => Some(&body.reason),
            _ => None,
        }
    }
}

/// Decodes the raw `data` object of one message kind
pub type ParseFn = fn(Value) -> Result<MessageData, ProtocolError>;

impl RoleHandler for ParseFn {
    fn role(&self) -> Role {
        Role::Parser
    }
}

macro_rules! payload_parser {
    ($name:ident, $variant:ident) => {
        fn $name(value: Value) -> Result<MessageData, ProtocolError> {
            serde_json::from_value(value)
                .map(MessageData::$variant)
                .map_err(|e| {
                    ProtocolError::InvalidArgument(format!(
                        "bad {} payload: {}",
                        MessageKind::$variant,
                        e
                    ))
                })
        }
    };
    ($name:ident, $variant:ident, unit) => {
        fn $name(_value: Value) -> Result<MessageData, ProtocolError> {
            Ok(MessageData::$variant)
        }
    };
}

payload_parser!(parse_ping, CommandPing);
payload_parser!(parse_ping_reply, RespPing);
payload_parser!(parse_connect, CommandConnect);
payload_parser!(parse_connect_accepted, RespConnect);
payload_parser!(parse_disconnect, CommandDisconnect, unit);
payload_parser!(parse_heartbeat, CommandHeartbeat, unit);
payload_parser!(parse_chat, CommandChat);
payload_parser!(parse_player_state, CommandPlayerState);
payload_parser!(parse_entity_state, CommandEntityState);
payload_parser!(parse_item_pickup, CommandItemPickup);
payload_parser!(parse_item_drop, CommandItemDrop);
payload_parser!(parse_projectile, CommandProjectileFire);
payload_parser!(parse_bomb_place, CommandBombPlace);
payload_parser!(parse_bomb_detonate, CommandBombDetonate);
payload_parser!(parse_empty, Empty, unit);
payload_parser!(parse_auth_failure, AuthenticationFailure);
payload_parser!(parse_internal_error, InternalServerError);
payload_parser!(parse_invalid_argument, InvalidArgumentException);
payload_parser!(parse_illegal_state, IllegalStateException);

/// Parser role for every kind in the catalogue.
///
/// Both sides register these; the server and client tables wrap them in their
/// own handler enums with [`CommandDefinition::map`].
pub fn parser_definitions() -> Vec<CommandDefinition<ParseFn>> {
    fn define(name: &'static str, kind: MessageKind, parse: ParseFn) -> CommandDefinition<ParseFn> {
        CommandDefinition::new(name, &[kind]).with(parse)
    }

    vec![
        define("ping", MessageKind::CommandPing, parse_ping),
        define("ping-reply", MessageKind::RespPing, parse_ping_reply),
        define("connect", MessageKind::CommandConnect, parse_connect),
        define("connect-reply", MessageKind::RespConnect, parse_connect_accepted),
        define("disconnect", MessageKind::CommandDisconnect, parse_disconnect),
        define("heartbeat", MessageKind::CommandHeartbeat, parse_heartbeat),
        define("chat", MessageKind::CommandChat, parse_chat),
        define("player-state", MessageKind::CommandPlayerState, parse_player_state),
        define("entity-state", MessageKind::CommandEntityState, parse_entity_state),
        define("item-pickup", MessageKind::CommandItemPickup, parse_item_pickup)
            .for_games(&[GameKind::Exploration]),
        define("item-drop", MessageKind::CommandItemDrop, parse_item_drop)
            .for_games(&[GameKind::Exploration]),
        define("projectile", MessageKind::CommandProjectileFire, parse_projectile)
            .for_games(&[GameKind::Exploration]),
        define("bomb-place", MessageKind::CommandBombPlace, parse_bomb_place)
            .for_games(&[GameKind::Bomber]),
        define("bomb-detonate", MessageKind::CommandBombDetonate, parse_bomb_detonate)
            .for_games(&[GameKind::Bomber]),
        define("empty", MessageKind::Empty, parse_empty),
        define("auth-failure", MessageKind::AuthenticationFailure, parse_auth_failure),
        define("internal-error", MessageKind::InternalServerError, parse_internal_error),
        define(
            "invalid-argument",
            MessageKind::InvalidArgumentException,
            parse_invalid_argument,
        ),
        define("illegal-state", MessageKind::IllegalStateException, parse_illegal_state),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_names_match_serde_tags() {
        let samples = vec![
            MessageData::CommandPing(Ping { sent_at: 1 }),
            MessageData::CommandConnect(ConnectRequest::default()),
            MessageData::CommandDisconnect,
            MessageData::CommandHeartbeat,
            MessageData::CommandBombDetonate(BombDetonation {
                tile_x: 1,
                tile_y: 2,
                radius: 3,
            }),
            MessageData::Empty,
            MessageData::IllegalStateException(ErrorBody {
                reason: "x".into(),
            }),
        ];

        for data in samples {
            let value = serde_json::to_value(&data).unwrap();
            assert_eq!(value["type"], data.kind().as_str());
        }
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!(
            "RESP_CONNECT".parse::<MessageKind>().unwrap(),
            MessageKind::RespConnect
        );
        assert!("COMMAND_TELEPORT".parse::<MessageKind>().is_err());
        for kind in MessageKind::ALL {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_payload_fields_are_camel_case() {
        let data = MessageData::CommandPlayerState(PlayerState {
            user_id: Some(UserId(3)),
            x: 1.0,
            y: 2.0,
            vel_x: 0.5,
            vel_y: 0.0,
        });
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["userId"], 3);
        assert_eq!(value["velX"], 0.5);
    }

    #[test]
    fn test_parser_rejects_wrong_shape() {
        let result = parse_chat(json!({ "type": "COMMAND_CHAT", "text": 12 }));
        assert!(matches!(result, Err(ProtocolError::InvalidArgument(_))));
    }

    #[test]
    fn test_parser_ignores_discriminator_field() {
        let data = parse_chat(json!({ "type": "COMMAND_CHAT", "text": "hi" })).unwrap();
        assert_eq!(
            data,
            MessageData::CommandChat(ChatMessage {
                text: "hi".into(),
                from: None
            })
        );
    }

    #[test]
    fn test_every_kind_has_a_parser() {
        let definitions = parser_definitions();
        for kind in MessageKind::ALL {
            assert!(
                definitions.iter().any(|d| d.kinds().contains(&kind)),
                "no parser for {}",
                kind
            );
        }
    }

    #[test]
    fn test_error_reason() {
        let data = MessageData::AuthenticationFailure(ErrorBody {
            reason: "expired".into(),
        });
        assert_eq!(data.error_reason(), Some("expired"));
        assert_eq!(MessageData::Empty.error_reason(), None);
        assert!(data.kind().is_error());
    }
}
