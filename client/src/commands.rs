//! Client command table
//!
//! The client populates all four roles. Invokers decide how a local send goes
//! out, response handlers react to the server's replies, and executors apply
//! commands the server pushes.

use crate::session::{push_bounded, LocalGameUserState};
use log::debug;
use shared::message::parser_definitions;
use shared::{
    now_millis, CommandDefinition, CommandRegistry, GameKind, IncomingMessage, MessageData,
    MessageKind, ParseFn, ProtocolError, RegistryBuilder, RegistryError, Role, RoleHandler,
    DEFAULT_VIABILITY,
};
use std::time::{Duration, Instant};

/// Server-pushed projectiles kept for display
pub const PROJECTILE_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPolicy {
    /// Track until acked, resending for at most the given viability
    Acked(Duration),
    FireAndForget,
}

pub type ExecuteFn = fn(&mut LocalGameUserState, &MessageData) -> Result<MessageData, ProtocolError>;
pub type InvokeFn = fn(&LocalGameUserState, &MessageData) -> Result<SendPolicy, ProtocolError>;
pub type RespondFn =
    fn(&mut LocalGameUserState, &IncomingMessage, Instant) -> Result<(), ProtocolError>;

#[derive(Clone, Copy)]
pub enum ClientHandler {
    Parse(ParseFn),
    Execute(ExecuteFn),
    Invoke(InvokeFn),
    Respond(RespondFn),
}

impl RoleHandler for ClientHandler {
    fn role(&self) -> Role {
        match self {
            ClientHandler::Parse(_) => Role::Parser,
            ClientHandler::Execute(_) => Role::Executor,
            ClientHandler::Invoke(_) => Role::Invoker,
            ClientHandler::Respond(_) => Role::ResponseHandler,
        }
    }
}

pub type ClientRegistry = CommandRegistry<ClientHandler>;

pub fn parser(registry: &ClientRegistry, game_kind: GameKind, kind: MessageKind) -> Option<ParseFn> {
    match registry.resolve(game_kind, kind, Role::Parser) {
        Some(ClientHandler::Parse(parse)) => Some(*parse),
        _ => None,
    }
}

pub fn executor(registry: &ClientRegistry, game_kind: GameKind, kind: MessageKind) -> Option<ExecuteFn> {
    match registry.resolve(game_kind, kind, Role::Executor) {
        Some(ClientHandler::Execute(execute)) => Some(*execute),
        _ => None,
    }
}

pub fn invoker(registry: &ClientRegistry, game_kind: GameKind, kind: MessageKind) -> Option<InvokeFn> {
    match registry.resolve(game_kind, kind, Role::Invoker) {
        Some(ClientHandler::Invoke(invoke)) => Some(*invoke),
        _ => None,
    }
}

pub fn responder(registry: &ClientRegistry, game_kind: GameKind, kind: MessageKind) -> Option<RespondFn> {
    match registry.resolve(game_kind, kind, Role::ResponseHandler) {
        Some(ClientHandler::Respond(respond)) => Some(*respond),
        _ => None,
    }
}

fn unexpected(data: &MessageData) -> ProtocolError {
    ProtocolError::Internal(format!("handler called with {}", data.kind()))
}

fn reply_error(reply: &IncomingMessage) -> ProtocolError {
    ProtocolError::from_error_data(&reply.data).unwrap_or_else(|| {
        ProtocolError::IllegalState(format!("{} reply marked unsuccessful", reply.kind()))
    })
}

// Invokers

fn acked(_state: &LocalGameUserState, _data: &MessageData) -> Result<SendPolicy, ProtocolError> {
    Ok(SendPolicy::Acked(DEFAULT_VIABILITY))
}

fn fire_and_forget(
    _state: &LocalGameUserState,
    _data: &MessageData,
) -> Result<SendPolicy, ProtocolError> {
    Ok(SendPolicy::FireAndForget)
}

/// A heartbeat is worthless once the next one is due
fn invoke_heartbeat(
    state: &LocalGameUserState,
    _data: &MessageData,
) -> Result<SendPolicy, ProtocolError> {
    Ok(SendPolicy::Acked(state.heartbeat_interval()))
}

fn invoke_chat(_state: &LocalGameUserState, data: &MessageData) -> Result<SendPolicy, ProtocolError> {
    let MessageData::CommandChat(message) = data else {
        return Err(unexpected(data));
    };
    if message.text.trim().is_empty() {
        return Err(ProtocolError::InvalidArgument("chat text is empty".into()));
    }
    Ok(SendPolicy::Acked(DEFAULT_VIABILITY))
}

// Response handlers

fn on_connect(
    state: &mut LocalGameUserState,
    reply: &IncomingMessage,
    now: Instant,
) -> Result<(), ProtocolError> {
    match &reply.data {
        MessageData::RespConnect(accepted) if reply.is_success() => {
            state.mark_connected(accepted.clone(), now);
            Ok(())
        }
        _ => Err(reply_error(reply)),
    }
}

fn on_ping(
    state: &mut LocalGameUserState,
    reply: &IncomingMessage,
    _now: Instant,
) -> Result<(), ProtocolError> {
    match &reply.data {
        MessageData::RespPing(pong) => {
            let rtt = Duration::from_millis(now_millis().saturating_sub(pong.sent_at));
            debug!("Round trip {}ms", rtt.as_millis());
            state.round_trip = Some(rtt);
            Ok(())
        }
        _ => Err(reply_error(reply)),
    }
}

fn on_heartbeat(
    state: &mut LocalGameUserState,
    reply: &IncomingMessage,
    now: Instant,
) -> Result<(), ProtocolError> {
    if reply.is_success() {
        return Ok(());
    }
    let error = reply_error(reply);
    state.mark_not_ready(&error.to_string(), now);
    Err(error)
}

fn on_disconnect(
    state: &mut LocalGameUserState,
    reply: &IncomingMessage,
    now: Instant,
) -> Result<(), ProtocolError> {
    state.mark_not_ready("disconnected", now);
    if reply.is_success() {
        Ok(())
    } else {
        Err(reply_error(reply))
    }
}

// Executors for server pushes

fn apply_chat(state: &mut LocalGameUserState, data: &MessageData) -> Result<MessageData, ProtocolError> {
    let MessageData::CommandChat(message) = data else {
        return Err(unexpected(data));
    };
    state.push_chat(message.clone());
    Ok(MessageData::Empty)
}

fn apply_player_state(
    state: &mut LocalGameUserState,
    data: &MessageData,
) -> Result<MessageData, ProtocolError> {
    let MessageData::CommandPlayerState(player) = data else {
        return Err(unexpected(data));
    };
    let user_id = player
        .user_id
        .ok_or_else(|| ProtocolError::InvalidArgument("player state without userId".into()))?;
    state.players.insert(user_id, player.clone());
    Ok(MessageData::Empty)
}

fn apply_entity_state(
    state: &mut LocalGameUserState,
    data: &MessageData,
) -> Result<MessageData, ProtocolError> {
    let MessageData::CommandEntityState(entity) = data else {
        return Err(unexpected(data));
    };
    if entity.removed {
        state.entities.remove(&entity.entity_id);
    } else {
        state.entities.insert(entity.entity_id, entity.clone());
    }
    Ok(MessageData::Empty)
}

fn apply_projectile(
    state: &mut LocalGameUserState,
    data: &MessageData,
) -> Result<MessageData, ProtocolError> {
    let MessageData::CommandProjectileFire(projectile) = data else {
        return Err(unexpected(data));
    };
    push_bounded(&mut state.projectiles, projectile.clone(), PROJECTILE_HISTORY);
    Ok(MessageData::Empty)
}

fn apply_bomb_place(
    state: &mut LocalGameUserState,
    data: &MessageData,
) -> Result<MessageData, ProtocolError> {
    let MessageData::CommandBombPlace(bomb) = data else {
        return Err(unexpected(data));
    };
    state.push_bomb(bomb.clone());
    Ok(MessageData::Empty)
}

fn apply_bomb_detonate(
    state: &mut LocalGameUserState,
    data: &MessageData,
) -> Result<MessageData, ProtocolError> {
    let MessageData::CommandBombDetonate(blast) = data else {
        return Err(unexpected(data));
    };
    state
        .bombs
        .retain(|bomb| !(bomb.tile_x == blast.tile_x && bomb.tile_y == blast.tile_y));
    state.push_detonation(blast.clone());
    Ok(MessageData::Empty)
}

fn command_definitions() -> Vec<CommandDefinition<ClientHandler>> {
    use ClientHandler::{Execute, Invoke, Respond};
    use MessageKind::*;

    vec![
        CommandDefinition::new("ping", &[CommandPing])
            .with(Invoke(acked))
            .with(Respond(on_ping)),
        CommandDefinition::new("connect", &[CommandConnect])
            .with(Invoke(acked))
            .with(Respond(on_connect)),
        CommandDefinition::new("disconnect", &[CommandDisconnect])
            .with(Invoke(acked))
            .with(Respond(on_disconnect)),
        CommandDefinition::new("heartbeat", &[CommandHeartbeat])
            .with(Invoke(invoke_heartbeat))
            .with(Respond(on_heartbeat)),
        CommandDefinition::new("chat", &[CommandChat])
            .with(Invoke(invoke_chat))
            .with(Execute(apply_chat)),
        CommandDefinition::new("player-state", &[CommandPlayerState])
            .with(Invoke(fire_and_forget))
            .with(Execute(apply_player_state)),
        CommandDefinition::new("entity-state", &[CommandEntityState]).with(Execute(apply_entity_state)),
        CommandDefinition::new("items", &[CommandItemPickup, CommandItemDrop])
            .for_games(&[GameKind::Exploration])
            .with(Invoke(acked)),
        CommandDefinition::new("projectile", &[CommandProjectileFire])
            .for_games(&[GameKind::Exploration])
            .with(Invoke(acked))
            .with(Execute(apply_projectile)),
        CommandDefinition::new("bomb-place", &[CommandBombPlace])
            .for_games(&[GameKind::Bomber])
            .with(Invoke(acked))
            .with(Execute(apply_bomb_place)),
        CommandDefinition::new("bomb-detonate", &[CommandBombDetonate])
            .for_games(&[GameKind::Bomber])
            .with(Execute(apply_bomb_detonate)),
    ]
}

pub fn build_registry() -> Result<ClientRegistry, RegistryError> {
    let mut builder = RegistryBuilder::new();
    builder
        .define_all(
            parser_definitions()
                .into_iter()
                .map(|definition| definition.map(ClientHandler::Parse)),
        )?
        .define_all(command_definitions())?;
    Ok(builder.build())
}
