//! Wire envelopes wrapping every datagram
//!
//! Inbound datagrams are first decoded into a [`RawEnvelope`], which validates
//! the envelope fields but keeps `data` as raw JSON. Once the receiver knows
//! which game kind the datagram belongs to, [`RawEnvelope::decode_payload`]
//! reads the `type` discriminator and delegates to the parser resolved from the
//! command registry, producing an [`IncomingMessage`].
//!
//! Outbound messages are built with [`EnvelopeBuilder`], which always stamps a
//! `createdAt` and omits ids that do not apply.

use crate::error::ProtocolError;
use crate::message::{MessageData, MessageKind, ParseFn};
use crate::types::GameKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Envelope fields of an inbound datagram with the payload still undecoded
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEnvelope {
    pub created_at: u64,
    pub message_id: Option<Uuid>,
    pub ack_message_id: Option<Uuid>,
    pub key: String,
    pub data: Value,
    pub success: Option<bool>,
    pub viability: Option<u64>,
}

impl RawEnvelope {
    /// Rejects datagrams that are not JSON or lack `createdAt`, `key` or `data`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Malformed(format!("bad envelope: {}", e)))?;

        if !raw.data.is_object() {
            return Err(ProtocolError::Malformed("data must be an object".into()));
        }

        Ok(raw)
    }

    /// Best-effort recovery of `messageId` from a datagram that failed to
    /// decode, so the error can still be acked.
    pub fn salvage_message_id(bytes: &[u8]) -> Option<Uuid> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        value
            .get("messageId")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok())
    }

    /// Same as [`salvage_message_id`](Self::salvage_message_id) for `key`.
    pub fn salvage_key(bytes: &[u8]) -> Option<String> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        value.get("key").and_then(Value::as_str).map(str::to_string)
    }

    /// Reads the `type` discriminator of `data`.
    pub fn kind(&self) -> Result<MessageKind, ProtocolError> {
        let tag = self
            .data
            .get("type")
            .ok_or_else(|| ProtocolError::Malformed("data has no type discriminator".into()))?;
        let tag = tag
            .as_str()
            .ok_or_else(|| ProtocolError::Malformed("data type must be a string".into()))?;
        tag.parse()
    }

    /// True when this datagram answers one of our own sends.
    pub fn is_ack(&self) -> bool {
        self.ack_message_id.is_some()
    }

    /// Decodes `data` with the parser `lookup` resolves for its kind.
    pub fn decode_payload(
        &self,
        game_kind: GameKind,
        lookup: impl Fn(GameKind, MessageKind) -> Option<ParseFn>,
    ) -> Result<MessageData, ProtocolError> {
        let kind = self.kind()?;
        let parse = lookup(game_kind, kind)
            .ok_or(ProtocolError::UnknownCommand { kind, game_kind })?;
        parse(self.data.clone())
    }

    pub fn into_incoming(self, data: MessageData) -> IncomingMessage {
        IncomingMessage {
            created_at: self.created_at,
            message_id: self.message_id,
            ack_message_id: self.ack_message_id,
            key: self.key,
            data,
            success: self.success,
            viability: self.viability,
        }
    }
}

/// Fully decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub created_at: u64,
    pub message_id: Option<Uuid>,
    pub ack_message_id: Option<Uuid>,
    pub key: String,
    pub data: MessageData,
    pub success: Option<bool>,
    pub viability: Option<u64>,
}

impl IncomingMessage {
    pub fn kind(&self) -> MessageKind {
        self.data.kind()
    }

    /// A response counts as successful unless it says otherwise.
    pub fn is_success(&self) -> bool {
        self.success.unwrap_or(true) && !self.data.kind().is_error()
    }
}

/// Outbound envelope as it goes on the wire
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_message_id: Option<Uuid>,
    pub key: String,
    pub data: MessageData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viability: Option<u64>,
    /// Whether the transport should track this send until acked
    #[serde(skip)]
    pub expects_ack: bool,
}

impl OutgoingMessage {
    /// Starts a command that may ask for an ack.
    pub fn command(data: MessageData) -> EnvelopeBuilder {
        EnvelopeBuilder::new(data)
    }

    /// Starts a reply to the command carrying `ack_message_id`.
    pub fn response(ack_message_id: Uuid, data: MessageData, success: bool) -> EnvelopeBuilder {
        let mut builder = EnvelopeBuilder::new(data);
        builder.ack_message_id = Some(ack_message_id);
        builder.success = Some(success);
        builder
    }

    /// Error reply for a failed command.
    pub fn error(ack_message_id: Uuid, error: &ProtocolError) -> EnvelopeBuilder {
        Self::response(ack_message_id, error.to_error_data(), false)
    }

    pub fn kind(&self) -> MessageKind {
        self.data.kind()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

pub struct EnvelopeBuilder {
    data: MessageData,
    key: String,
    created_at: Option<u64>,
    message_id: Option<Uuid>,
    ack_message_id: Option<Uuid>,
    success: Option<bool>,
    viability: Option<u64>,
    expects_ack: bool,
}

impl EnvelopeBuilder {
    fn new(data: MessageData) -> Self {
        Self {
            data,
            key: String::new(),
            created_at: None,
            message_id: None,
            ack_message_id: None,
            success: None,
            viability: None,
            expects_ack: false,
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Overrides the build-time clock.
    pub fn created_at(mut self, millis: u64) -> Self {
        self.created_at = Some(millis);
        self
    }

    pub fn message_id(mut self, id: Uuid) -> Self {
        self.message_id = Some(id);
        self
    }

    /// Requests an ack and bounds how long the sender keeps resending.
    pub fn expect_ack(mut self, viability: Duration) -> Self {
        self.expects_ack = true;
        self.viability = Some(viability.as_millis() as u64);
        self
    }

    pub fn build(self) -> OutgoingMessage {
        // Replies never carry their own messageId
        let message_id = if self.ack_message_id.is_some() {
            None
        } else {
            self.message_id
        };

        OutgoingMessage {
            created_at: self.created_at.unwrap_or_else(now_millis),
            message_id,
            ack_message_id: self.ack_message_id,
            key: self.key,
            data: self.data,
            success: self.success,
            viability: self.viability,
            expects_ack: self.expects_ack && self.ack_message_id.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{parser_definitions, ChatMessage, ConnectRequest};
    use crate::registry::{RegistryBuilder, Role};
    use serde_json::json;

    fn lookup(game_kind: GameKind, kind: MessageKind) -> Option<ParseFn> {
        let mut builder = RegistryBuilder::<ParseFn>::new();
        builder.define_all(parser_definitions()).unwrap();
        builder.build().resolve(game_kind, kind, Role::Parser).copied()
    }

    fn bytes(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_decode_valid_command() {
        let id = Uuid::new_v4();
        let datagram = bytes(json!({
            "createdAt": 1_700_000_000_000u64,
            "messageId": id.to_string(),
            "key": "abc",
            "data": { "type": "COMMAND_CHAT", "text": "hello" }
        }));

        let raw = RawEnvelope::decode(&datagram).unwrap();
        assert_eq!(raw.kind().unwrap(), MessageKind::CommandChat);
        assert!(!raw.is_ack());

        let data = raw.decode_payload(GameKind::Bomber, lookup).unwrap();
        let message = raw.into_incoming(data);
        assert_eq!(message.message_id, Some(id));
        assert_eq!(
            message.data,
            MessageData::CommandChat(ChatMessage {
                text: "hello".into(),
                from: None
            })
        );
    }

    #[test]
    fn test_decode_rejects_missing_required_fields() {
        let without_created_at = bytes(json!({ "key": "k", "data": { "type": "EMPTY" } }));
        let without_key = bytes(json!({ "createdAt": 1, "data": { "type": "EMPTY" } }));
        let without_data = bytes(json!({ "createdAt": 1, "key": "k" }));

        for datagram in [without_created_at, without_key, without_data] {
            assert!(matches!(
                RawEnvelope::decode(&datagram),
                Err(ProtocolError::Malformed(_))
            ));
        }
    }

    #[test]
    fn test_created_at_must_be_epoch_millis() {
        let as_string = bytes(json!({ "createdAt": "yesterday", "key": "k", "data": { "type": "EMPTY" } }));
        let negative = bytes(json!({ "createdAt": -5, "key": "k", "data": { "type": "EMPTY" } }));
        assert!(RawEnvelope::decode(&as_string).is_err());
        assert!(RawEnvelope::decode(&negative).is_err());
    }

    #[test]
    fn test_data_without_type_is_rejected_before_lookup() {
        let datagram = bytes(json!({ "createdAt": 1, "key": "k", "data": { "text": "hi" } }));
        let raw = RawEnvelope::decode(&datagram).unwrap();

        let result = raw.decode_payload(GameKind::Exploration, |_, _| {
            panic!("lookup must not run without a discriminator")
        });
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_kind_not_registered_for_game_kind() {
        let datagram = bytes(json!({
            "createdAt": 1,
            "key": "k",
            "data": { "type": "COMMAND_BOMB_PLACE", "tileX": 1, "tileY": 1, "fuseMs": 100 }
        }));
        let raw = RawEnvelope::decode(&datagram).unwrap();

        assert!(matches!(
            raw.decode_payload(GameKind::Exploration, lookup),
            Err(ProtocolError::UnknownCommand { .. })
        ));
        assert!(raw.decode_payload(GameKind::Bomber, lookup).is_ok());
    }

    #[test]
    fn test_salvage_message_id_from_broken_envelope() {
        let id = Uuid::new_v4();
        let datagram = bytes(json!({ "messageId": id.to_string(), "data": 5 }));
        assert!(RawEnvelope::decode(&datagram).is_err());
        assert_eq!(RawEnvelope::salvage_message_id(&datagram), Some(id));
        assert_eq!(RawEnvelope::salvage_message_id(b"\x00\x01garbage"), None);
    }

    #[test]
    fn test_outgoing_omits_inapplicable_fields() {
        let message = OutgoingMessage::command(MessageData::CommandHeartbeat)
            .key("k")
            .build();
        let value = serde_json::to_value(&message).unwrap();

        assert!(value.get("messageId").is_none());
        assert!(value.get("ackMessageId").is_none());
        assert!(value.get("success").is_none());
        assert!(value.get("viability").is_none());
        assert!(value.get("expectsAck").is_none());
        assert!(value["createdAt"].as_u64().unwrap() > 0);
        assert_eq!(value["data"]["type"], "COMMAND_HEARTBEAT");
    }

    #[test]
    fn test_created_at_override() {
        let message = OutgoingMessage::command(MessageData::Empty)
            .created_at(1234)
            .build();
        assert_eq!(message.created_at, 1234);
    }

    #[test]
    fn test_response_envelope() {
        let ack = Uuid::new_v4();
        let message = OutgoingMessage::response(ack, MessageData::Empty, true)
            .message_id(Uuid::new_v4())
            .expect_ack(Duration::from_secs(1))
            .build();

        assert_eq!(message.ack_message_id, Some(ack));
        assert_eq!(message.message_id, None);
        assert_eq!(message.success, Some(true));
        assert!(!message.expects_ack);
    }

    #[test]
    fn test_error_envelope_carries_kind_and_reason() {
        let ack = Uuid::new_v4();
        let error = ProtocolError::IllegalState("session is not connected".into());
        let message = OutgoingMessage::error(ack, &error).key("k").build();
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["success"], false);
        assert_eq!(value["data"]["type"], "ILLEGAL_STATE_EXCEPTION");
        assert!(value["data"]["reason"]
            .as_str()
            .unwrap()
            .contains("not connected"));
    }

    #[test]
    fn test_outgoing_is_readable_as_incoming() {
        let message = OutgoingMessage::command(MessageData::CommandConnect(ConnectRequest {
            client_version: 2,
        }))
        .key("cred")
        .message_id(Uuid::new_v4())
        .expect_ack(Duration::from_millis(2500))
        .build();

        let raw = RawEnvelope::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(raw.viability, Some(2500));
        assert_eq!(raw.message_id, message.message_id);
        let data = raw.decode_payload(GameKind::Exploration, lookup).unwrap();
        assert_eq!(data, message.data);
    }

    #[test]
    fn test_incoming_success_semantics() {
        let raw = RawEnvelope::decode(&bytes(json!({
            "createdAt": 1,
            "key": "k",
            "ackMessageId": Uuid::new_v4().to_string(),
            "data": { "type": "EMPTY" }
        })))
        .unwrap();
        assert!(raw.is_ack());
        let message = raw.into_incoming(MessageData::Empty);
        assert!(message.is_success());

        let mut failed = message.clone();
        failed.success = Some(false);
        assert!(!failed.is_success());
    }
}
