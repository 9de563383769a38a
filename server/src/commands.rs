//! Server command table
//!
//! The server fills two roles of the shared registry: the parser for every
//! kind in the catalogue, and an executor for each command a client may send.
//! Executors receive a [`CommandContext`] holding the game, the calling
//! account and an outbox, and return the payload to ack the command with.

use crate::game::{Broadcaster, Game};
use crate::session::GameUserState;
use log::{debug, info};
use shared::message::{
    parser_definitions, BombPlacement, ChatMessage, ConnectAccepted, EntityState, ItemInteraction,
    PingReply, PlayerState, Projectile,
};
use shared::{
    now_millis, CommandDefinition, CommandRegistry, GameKind, MessageData, MessageKind, ParseFn,
    ProtocolError, RegistryBuilder, RegistryError, Role, RoleHandler, UserId,
};
use std::time::Instant;

pub const MAX_CHAT_LENGTH: usize = 256;
pub const MIN_FUSE_MS: u64 = 500;
pub const MAX_FUSE_MS: u64 = 10_000;

/// Everything an executor may touch while handling one command
pub struct CommandContext<'a> {
    pub game: &'a mut Game,
    pub user_id: UserId,
    pub now: Instant,
    pub out: &'a mut Broadcaster,
}

impl<'a> CommandContext<'a> {
    pub fn session(&mut self) -> Result<&mut GameUserState, ProtocolError> {
        let user_id = self.user_id;
        self.game
            .session_mut(&user_id)
            .ok_or_else(|| ProtocolError::Internal(format!("{} has no session", user_id)))
    }

    /// Relays `data` to the other connected players.
    pub fn relay(&mut self, data: MessageData, acked: bool) {
        self.out.to_game(self.game, data, Some(self.user_id), acked);
    }
}

pub type ExecuteFn = fn(&mut CommandContext<'_>, &MessageData) -> Result<MessageData, ProtocolError>;

#[derive(Clone, Copy)]
pub enum ServerHandler {
    Parse(ParseFn),
    Execute(ExecuteFn),
}

impl RoleHandler for ServerHandler {
    fn role(&self) -> Role {
        match self {
            ServerHandler::Parse(_) => Role::Parser,
            ServerHandler::Execute(_) => Role::Executor,
        }
    }
}

pub type ServerRegistry = CommandRegistry<ServerHandler>;

pub fn parser(registry: &ServerRegistry, game_kind: GameKind, kind: MessageKind) -> Option<ParseFn> {
    match registry.resolve(game_kind, kind, Role::Parser) {
        Some(ServerHandler::Parse(parse)) => Some(*parse),
        _ => None,
    }
}

pub fn executor(
    registry: &ServerRegistry,
    game_kind: GameKind,
    kind: MessageKind,
) -> Option<ExecuteFn> {
    match registry.resolve(game_kind, kind, Role::Executor) {
        Some(ServerHandler::Execute(execute)) => Some(*execute),
        _ => None,
    }
}

fn unexpected(data: &MessageData) -> ProtocolError {
    ProtocolError::Internal(format!("executor called with {}", data.kind()))
}

fn ping(_ctx: &mut CommandContext<'_>, data: &MessageData) -> Result<MessageData, ProtocolError> {
    let MessageData::CommandPing(ping) = data else {
        return Err(unexpected(data));
    };
    Ok(MessageData::RespPing(PingReply {
        sent_at: ping.sent_at,
        server_time: now_millis(),
    }))
}

fn connect(ctx: &mut CommandContext<'_>, data: &MessageData) -> Result<MessageData, ProtocolError> {
    let MessageData::CommandConnect(request) = data else {
        return Err(unexpected(data));
    };
    let now = ctx.now;
    let game_id = ctx.game.id();
    let game_kind = ctx.game.kind();
    let players = ctx.game.connected_users(Some(ctx.user_id));

    let session = ctx.session()?;
    // A repeated connect inside the cooldown window is answered without
    // restarting the connection
    if session.connection.in_cooldown(now) {
        debug!("{} repeated connect during cooldown", session.user_id);
    } else {
        session.connection.connect(now);
        info!(
            "{} connected to {} (client version {})",
            session.user_id, game_id, request.client_version
        );
    }

    Ok(MessageData::RespConnect(ConnectAccepted {
        game_id,
        user_id: session.user_id,
        game_kind,
        play_time_ms: session.total_play_time(now).as_millis() as u64,
        players,
    }))
}

fn disconnect(ctx: &mut CommandContext<'_>, _data: &MessageData) -> Result<MessageData, ProtocolError> {
    let now = ctx.now;
    let session = ctx.session()?;
    session.connection.disconnect(now);
    info!(
        "{} disconnected after {:.1}s of play",
        session.user_id,
        session.connection.play_time(now).as_secs_f32()
    );
    Ok(MessageData::Empty)
}

fn heartbeat(ctx: &mut CommandContext<'_>, _data: &MessageData) -> Result<MessageData, ProtocolError> {
    let now = ctx.now;
    ctx.session()?.connection.heartbeat(now)?;
    Ok(MessageData::Empty)
}

fn chat(ctx: &mut CommandContext<'_>, data: &MessageData) -> Result<MessageData, ProtocolError> {
    let MessageData::CommandChat(message) = data else {
        return Err(unexpected(data));
    };

    let text = message.text.trim();
    if text.is_empty() {
        return Err(ProtocolError::InvalidArgument("chat text is empty".into()));
    }
    if text.chars().count() > MAX_CHAT_LENGTH {
        return Err(ProtocolError::InvalidArgument(format!(
            "chat text exceeds {} characters",
            MAX_CHAT_LENGTH
        )));
    }

    let relayed = MessageData::CommandChat(ChatMessage {
        text: text.to_string(),
        from: Some(ctx.user_id),
    });
    ctx.relay(relayed, true);
    Ok(MessageData::Empty)
}

fn store_player_state(
    ctx: &mut CommandContext<'_>,
    mut state: PlayerState,
) -> Result<MessageData, ProtocolError> {
    if !(state.x.is_finite() && state.y.is_finite()) {
        return Err(ProtocolError::InvalidArgument("position must be finite".into()));
    }

    state.user_id = Some(ctx.user_id);
    ctx.session()?.last_state = Some(state.clone());
    ctx.relay(MessageData::CommandPlayerState(state), false);
    Ok(MessageData::Empty)
}

fn player_state(ctx: &mut CommandContext<'_>, data: &MessageData) -> Result<MessageData, ProtocolError> {
    let MessageData::CommandPlayerState(state) = data else {
        return Err(unexpected(data));
    };
    store_player_state(ctx, state.clone())
}

/// Bomber movement is tile-locked: positions snap to the grid and carry no
/// velocity.
fn bomber_player_state(
    ctx: &mut CommandContext<'_>,
    data: &MessageData,
) -> Result<MessageData, ProtocolError> {
    let MessageData::CommandPlayerState(state) = data else {
        return Err(unexpected(data));
    };
    let snapped = PlayerState {
        user_id: None,
        x: state.x.round(),
        y: state.y.round(),
        vel_x: 0.0,
        vel_y: 0.0,
    };
    store_player_state(ctx, snapped)
}

fn item_entity(item: &ItemInteraction, removed: bool) -> MessageData {
    MessageData::CommandEntityState(EntityState {
        entity_id: item.item_id,
        entity_kind: "item".to_string(),
        x: item.x,
        y: item.y,
        removed,
    })
}

fn item_pickup(ctx: &mut CommandContext<'_>, data: &MessageData) -> Result<MessageData, ProtocolError> {
    let MessageData::CommandItemPickup(item) = data else {
        return Err(unexpected(data));
    };
    ctx.game.pick_up_item(item.item_id, ctx.user_id)?;
    ctx.relay(item_entity(item, true), true);
    Ok(MessageData::Empty)
}

fn item_drop(ctx: &mut CommandContext<'_>, data: &MessageData) -> Result<MessageData, ProtocolError> {
    let MessageData::CommandItemDrop(item) = data else {
        return Err(unexpected(data));
    };
    ctx.game.drop_item(item.item_id, ctx.user_id)?;
    ctx.relay(item_entity(item, false), true);
    Ok(MessageData::Empty)
}

fn projectile_fire(
    ctx: &mut CommandContext<'_>,
    data: &MessageData,
) -> Result<MessageData, ProtocolError> {
    let MessageData::CommandProjectileFire(projectile) = data else {
        return Err(unexpected(data));
    };

    let length = (projectile.dir_x * projectile.dir_x + projectile.dir_y * projectile.dir_y).sqrt();
    if !length.is_finite() || length == 0.0 {
        return Err(ProtocolError::InvalidArgument(
            "projectile direction must be non-zero".into(),
        ));
    }
    if !projectile.speed.is_finite() || projectile.speed <= 0.0 {
        return Err(ProtocolError::InvalidArgument(
            "projectile speed must be positive".into(),
        ));
    }

    let fired = Projectile {
        projectile_id: Some(ctx.game.next_projectile_id()),
        owner: Some(ctx.user_id),
        dir_x: projectile.dir_x / length,
        dir_y: projectile.dir_y / length,
        ..projectile.clone()
    };
    ctx.relay(MessageData::CommandProjectileFire(fired), true);
    Ok(MessageData::Empty)
}

fn bomb_place(ctx: &mut CommandContext<'_>, data: &MessageData) -> Result<MessageData, ProtocolError> {
    let MessageData::CommandBombPlace(bomb) = data else {
        return Err(unexpected(data));
    };
    if !(MIN_FUSE_MS..=MAX_FUSE_MS).contains(&bomb.fuse_ms) {
        return Err(ProtocolError::InvalidArgument(format!(
            "fuse must be between {} and {} ms",
            MIN_FUSE_MS, MAX_FUSE_MS
        )));
    }

    let placement = BombPlacement {
        owner: Some(ctx.user_id),
        ..bomb.clone()
    };
    ctx.game.place_bomb(placement.clone(), ctx.now)?;
    ctx.relay(MessageData::CommandBombPlace(placement), true);
    Ok(MessageData::Empty)
}

fn executor_definitions() -> Vec<CommandDefinition<ServerHandler>> {
    fn define(name: &'static str, kinds: &[MessageKind], execute: ExecuteFn) -> CommandDefinition<ServerHandler> {
        CommandDefinition::new(name, kinds).with(ServerHandler::Execute(execute))
    }

    vec![
        define("ping", &[MessageKind::CommandPing], ping),
        define("connect", &[MessageKind::CommandConnect], connect),
        define("disconnect", &[MessageKind::CommandDisconnect], disconnect),
        define("heartbeat", &[MessageKind::CommandHeartbeat], heartbeat),
        define("chat", &[MessageKind::CommandChat], chat),
        define("player-state", &[MessageKind::CommandPlayerState], player_state),
        define("bomber-player-state", &[MessageKind::CommandPlayerState], bomber_player_state)
            .for_games(&[GameKind::Bomber]),
        define(
            "item-pickup",
            &[MessageKind::CommandItemPickup],
            item_pickup,
        )
        .for_games(&[GameKind::Exploration]),
        define("item-drop", &[MessageKind::CommandItemDrop], item_drop)
            .for_games(&[GameKind::Exploration]),
        define(
            "projectile-fire",
            &[MessageKind::CommandProjectileFire],
            projectile_fire,
        )
        .for_games(&[GameKind::Exploration]),
        define("bomb-place", &[MessageKind::CommandBombPlace], bomb_place)
            .for_games(&[GameKind::Bomber]),
    ]
}

/// Builds the server's registry. Fails on conflicting registrations.
pub fn build_registry() -> Result<ServerRegistry, RegistryError> {
    let mut builder = RegistryBuilder::new();
    builder
        .define_all(
            parser_definitions()
                .into_iter()
                .map(|definition| definition.map(ServerHandler::Parse)),
        )?
        .define_all(executor_definitions())?;
    Ok(builder.build())
}
