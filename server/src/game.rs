//! Active games, their sessions and per-kind simulation
//!
//! A [`Game`] is created from its database record the first time one of its
//! players shows up and lives until the record is deleted, independently of
//! its sessions. The [`GameRegistry`] owns all games and runs the per-tick
//! work: the game-kind [`Simulation`] followed by the heartbeat sweep.

use crate::accounts::GameRecord;
use crate::session::GameUserState;
use log::{debug, info};
use shared::message::{BombDetonation, BombPlacement};
use shared::{GameId, GameKind, MessageData, OutgoingMessage, ProtocolError, UserId, DEFAULT_VIABILITY};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Blast radius, in tiles, of a detonated bomb
pub const BOMB_RADIUS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    TimedOut,
    CredentialRejected,
    Left,
}

/// A session removed from a game, with its final play time
#[derive(Debug, Clone, PartialEq)]
pub struct Eviction {
    pub game_id: GameId,
    pub user_id: UserId,
    pub play_time: Duration,
    pub reason: EvictionReason,
}

#[derive(Debug, Clone)]
pub struct PlacedBomb {
    pub placement: BombPlacement,
    pub detonate_at: Instant,
}

pub struct Game {
    record: GameRecord,
    sessions: HashMap<UserId, GameUserState>,
    /// Item id to the account carrying it
    carried_items: HashMap<u64, UserId>,
    bombs: Vec<PlacedBomb>,
    next_projectile_id: u64,
}

impl Game {
    pub fn new(record: GameRecord) -> Self {
        Self {
            record,
            sessions: HashMap::new(),
            carried_items: HashMap::new(),
            bombs: Vec::new(),
            next_projectile_id: 1,
        }
    }

    pub fn id(&self) -> GameId {
        self.record.id
    }

    pub fn kind(&self) -> GameKind {
        self.record.kind
    }

    pub fn record(&self) -> &GameRecord {
        &self.record
    }

    pub fn session(&self, user_id: &UserId) -> Option<&GameUserState> {
        self.sessions.get(user_id)
    }

    pub fn session_mut(&mut self, user_id: &UserId) -> Option<&mut GameUserState> {
        self.sessions.get_mut(user_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &GameUserState> {
        self.sessions.values()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Adds a session unless the game is at capacity.
    pub fn add_session(&mut self, session: GameUserState) -> Result<(), ProtocolError> {
        if !self.sessions.contains_key(&session.user_id)
            && self.sessions.len() >= self.record.max_players()
        {
            return Err(ProtocolError::IllegalState(format!(
                "{} is full ({} players)",
                self.record.id,
                self.record.max_players()
            )));
        }

        info!("{} joined {} from {}", session.user_id, self.record.id, session.peer);
        self.sessions.insert(session.user_id, session);
        Ok(())
    }

    /// Removes a session, finalizing its play time.
    pub fn remove_session(
        &mut self,
        user_id: &UserId,
        now: Instant,
        reason: EvictionReason,
    ) -> Option<Eviction> {
        let mut session = self.sessions.remove(user_id)?;
        session.connection.disconnect(now);
        self.carried_items.retain(|_, holder| holder != user_id);

        Some(Eviction {
            game_id: self.record.id,
            user_id: *user_id,
            play_time: session.connection.play_time(now),
            reason,
        })
    }

    /// Connected accounts other than `except`
    pub fn connected_users(&self, except: Option<UserId>) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .sessions
            .values()
            .filter(|s| s.connection.is_connected() && Some(s.user_id) != except)
            .map(|s| s.user_id)
            .collect();
        users.sort();
        users
    }

    /// Forces sessions whose heartbeat deadline passed out of the game.
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<Eviction> {
        let expired: Vec<UserId> = self
            .sessions
            .values()
            .filter(|s| s.connection.heartbeat_expired(now))
            .map(|s| s.user_id)
            .collect();

        let mut evictions = Vec::with_capacity(expired.len());
        for user_id in expired {
            if let Some(mut session) = self.sessions.remove(&user_id) {
                session.connection.time_out(now);
                let play_time = session.connection.play_time(now);
                info!(
                    "{} timed out of {} after {:.1}s of play",
                    user_id,
                    self.record.id,
                    play_time.as_secs_f32()
                );
                self.carried_items.retain(|_, holder| *holder != user_id);
                evictions.push(Eviction {
                    game_id: self.record.id,
                    user_id,
                    play_time,
                    reason: EvictionReason::TimedOut,
                });
            }
        }
        evictions
    }

    pub fn pick_up_item(&mut self, item_id: u64, user_id: UserId) -> Result<(), ProtocolError> {
        match self.carried_items.get(&item_id) {
            Some(holder) if *holder != user_id => Err(ProtocolError::IllegalState(format!(
                "item {} is carried by {}",
                item_id, holder
            ))),
            _ => {
                self.carried_items.insert(item_id, user_id);
                Ok(())
            }
        }
    }

    pub fn drop_item(&mut self, item_id: u64, user_id: UserId) -> Result<(), ProtocolError> {
        match self.carried_items.get(&item_id) {
            Some(holder) if *holder == user_id => {
                self.carried_items.remove(&item_id);
                Ok(())
            }
            _ => Err(ProtocolError::IllegalState(format!(
                "{} does not carry item {}",
                user_id, item_id
            ))),
        }
    }

    pub fn next_projectile_id(&mut self) -> u64 {
        let id = self.next_projectile_id;
        self.next_projectile_id += 1;
        id
    }

    pub fn place_bomb(&mut self, placement: BombPlacement, now: Instant) -> Result<(), ProtocolError> {
        let occupied = self.bombs.iter().any(|b| {
            b.placement.tile_x == placement.tile_x && b.placement.tile_y == placement.tile_y
        });
        if occupied {
            return Err(ProtocolError::IllegalState(format!(
                "tile ({}, {}) already holds a bomb",
                placement.tile_x, placement.tile_y
            )));
        }

        let detonate_at = now + Duration::from_millis(placement.fuse_ms);
        self.bombs.push(PlacedBomb {
            placement,
            detonate_at,
        });
        Ok(())
    }

    pub fn bombs(&self) -> &[PlacedBomb] {
        &self.bombs
    }

    /// Removes and returns bombs whose fuse has run out.
    pub fn take_due_bombs(&mut self, now: Instant) -> Vec<PlacedBomb> {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.bombs.drain(..).partition(|b| now >= b.detonate_at);
        self.bombs = pending;
        due
    }
}

/// Collects datagrams addressed to connected sessions during a tick or a
/// command, to be sent by the network loop afterwards.
pub struct Broadcaster {
    outbox: Vec<(SocketAddr, OutgoingMessage)>,
    viability: Duration,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_viability(DEFAULT_VIABILITY)
    }

    pub fn with_viability(viability: Duration) -> Self {
        Self {
            outbox: Vec::new(),
            viability,
        }
    }

    /// Sends `data` to every connected session of `game` except `except`.
    pub fn to_game(&mut self, game: &Game, data: MessageData, except: Option<UserId>, acked: bool) {
        for session in game.sessions() {
            if !session.connection.is_connected() || Some(session.user_id) == except {
                continue;
            }
            self.to_session(session, data.clone(), acked);
        }
    }

    pub fn to_session(&mut self, session: &GameUserState, data: MessageData, acked: bool) {
        let mut builder = OutgoingMessage::command(data).key(session.key());
        if acked {
            builder = builder.expect_ack(self.viability);
        }
        self.outbox.push((session.peer, builder.build()));
    }

    pub fn len(&self) -> usize {
        self.outbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbox.is_empty()
    }

    pub fn drain(&mut self) -> Vec<(SocketAddr, OutgoingMessage)> {
        std::mem::take(&mut self.outbox)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Game-kind rules run once per tick
pub trait Simulation: Send + Sync {
    fn tick(&mut self, game: &mut Game, now: Instant, out: &mut Broadcaster);
}

/// Exploration has no timed server-side rules
pub struct Idle;

impl Simulation for Idle {
    fn tick(&mut self, _game: &mut Game, _now: Instant, _out: &mut Broadcaster) {}
}

/// Detonates bombs whose fuse has run out
pub struct BomberFuses;

impl Simulation for BomberFuses {
    fn tick(&mut self, game: &mut Game, now: Instant, out: &mut Broadcaster) {
        for bomb in game.take_due_bombs(now) {
            debug!(
                "Bomb at ({}, {}) detonated in {}",
                bomb.placement.tile_x,
                bomb.placement.tile_y,
                game.id()
            );
            let detonation = MessageData::CommandBombDetonate(BombDetonation {
                tile_x: bomb.placement.tile_x,
                tile_y: bomb.placement.tile_y,
                radius: BOMB_RADIUS,
            });
            out.to_game(game, detonation, None, true);
        }
    }
}

pub fn simulation_for(kind: GameKind) -> Box<dyn Simulation> {
    match kind {
        GameKind::Exploration => Box::new(Idle),
        GameKind::Bomber => Box::new(BomberFuses),
    }
}

/// All games hosted by this process
pub struct GameRegistry {
    games: HashMap<GameId, Game>,
    simulations: HashMap<GameKind, Box<dyn Simulation>>,
}

impl GameRegistry {
    pub fn new() -> Self {
        let simulations = GameKind::ALL
            .iter()
            .map(|kind| (*kind, simulation_for(*kind)))
            .collect();

        Self {
            games: HashMap::new(),
            simulations,
        }
    }

    /// Registers a game, or refreshes the record of one already hosted while
    /// keeping its sessions.
    pub fn register(&mut self, record: GameRecord) -> &mut Game {
        let id = record.id;
        let game = self
            .games
            .entry(id)
            .and_modify(|game| {
                debug!("Refreshed record of {}", id);
                game.record = record.clone();
            })
            .or_insert_with(|| {
                info!("Hosting {} \"{}\" ({})", id, record.name, record.kind);
                Game::new(record.clone())
            });
        game
    }

    pub fn get(&self, id: &GameId) -> Option<&Game> {
        self.games.get(id)
    }

    pub fn get_mut(&mut self, id: &GameId) -> Option<&mut Game> {
        self.games.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Game> {
        self.games.values()
    }

    /// Drops the in-memory game. Its sessions go with it.
    pub fn destroy(&mut self, id: &GameId) -> Option<Game> {
        let game = self.games.remove(id);
        if game.is_some() {
            info!("Stopped hosting {}", id);
        }
        game
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    /// Runs every game's simulation, then its timeout sweep.
    pub fn tick(&mut self, now: Instant, out: &mut Broadcaster) -> Vec<Eviction> {
        let mut evictions = Vec::new();
        for game in self.games.values_mut() {
            if let Some(simulation) = self.simulations.get_mut(&game.kind()) {
                simulation.tick(game, now, out);
            }
            evictions.extend(game.sweep_timeouts(now));
        }
        evictions
    }
}

impl Default for GameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::GameCredential;
    use std::net::{IpAddr, Ipv4Addr};

    fn record(kind: GameKind, max_players: u64) -> GameRecord {
        GameRecord {
            id: GameId(3),
            name: "Arena".into(),
            host: UserId(1),
            map: "arena.tmx".into(),
            kind,
            config: json!({ "maxPlayers": max_players }),
        }
    }

    fn session(user: u64, now: Instant) -> GameUserState {
        let credential = GameCredential::new(GameId(3), UserId(user), "k");
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000 + user as u16);
        GameUserState::new(format!("player{}", user), credential, peer, now)
    }

    fn connected(user: u64, now: Instant) -> GameUserState {
        let mut session = session(user, now);
        session.connection.connect(now);
        session
    }

    #[test]
    fn test_capacity_enforced() {
        let now = Instant::now();
        let mut game = Game::new(record(GameKind::Exploration, 2));

        assert!(game.add_session(session(1, now)).is_ok());
        assert!(game.add_session(session(2, now)).is_ok());
        assert!(matches!(
            game.add_session(session(3, now)),
            Err(ProtocolError::IllegalState(_))
        ));
        // Replacing an existing session does not count against capacity
        assert!(game.add_session(session(2, now)).is_ok());
        assert_eq!(game.session_count(), 2);
    }

    #[test]
    fn test_sweep_evicts_only_expired() {
        let t0 = Instant::now();
        let mut game = Game::new(record(GameKind::Exploration, 8));
        game.add_session(connected(1, t0)).unwrap();
        game.add_session(connected(2, t0 + Duration::from_secs(5))).unwrap();
        game.add_session(session(3, t0)).unwrap();

        assert!(game.sweep_timeouts(t0 + Duration::from_millis(9999)).is_empty());

        let evictions = game.sweep_timeouts(t0 + Duration::from_secs(10));
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].user_id, UserId(1));
        assert_eq!(evictions[0].reason, EvictionReason::TimedOut);
        assert_eq!(evictions[0].play_time, Duration::from_secs(10));

        // Unconnected sessions have no deadline
        assert!(game.session(&UserId(3)).is_some());
        assert_eq!(game.session_count(), 2);
    }

    #[test]
    fn test_remove_session_reports_play_time() {
        let t0 = Instant::now();
        let mut game = Game::new(record(GameKind::Exploration, 8));
        game.add_session(connected(1, t0)).unwrap();

        let eviction = game
            .remove_session(&UserId(1), t0 + Duration::from_secs(4), EvictionReason::Left)
            .unwrap();
        assert_eq!(eviction.play_time, Duration::from_secs(4));
        assert!(game
            .remove_session(&UserId(1), t0, EvictionReason::Left)
            .is_none());
    }

    #[test]
    fn test_items_have_one_holder() {
        let mut game = Game::new(record(GameKind::Exploration, 8));

        assert!(game.pick_up_item(9, UserId(1)).is_ok());
        assert!(game.pick_up_item(9, UserId(2)).is_err());
        assert!(game.drop_item(9, UserId(2)).is_err());
        assert!(game.drop_item(9, UserId(1)).is_ok());
        assert!(game.pick_up_item(9, UserId(2)).is_ok());
    }

    #[test]
    fn test_bomb_tile_occupancy() {
        let now = Instant::now();
        let mut game = Game::new(record(GameKind::Bomber, 8));
        let bomb = BombPlacement {
            tile_x: 2,
            tile_y: 3,
            fuse_ms: 1000,
            owner: Some(UserId(1)),
        };

        assert!(game.place_bomb(bomb.clone(), now).is_ok());
        assert!(game.place_bomb(bomb, now).is_err());
        assert_eq!(game.bombs().len(), 1);
    }

    #[test]
    fn test_bomber_fuses_detonate_when_due() {
        let t0 = Instant::now();
        let mut game = Game::new(record(GameKind::Bomber, 8));
        game.add_session(connected(1, t0)).unwrap();
        game.add_session(connected(2, t0)).unwrap();
        game.add_session(session(3, t0)).unwrap();
        game.place_bomb(
            BombPlacement {
                tile_x: 4,
                tile_y: 4,
                fuse_ms: 1500,
                owner: Some(UserId(1)),
            },
            t0,
        )
        .unwrap();

        let mut fuses = BomberFuses;
        let mut out = Broadcaster::new();

        fuses.tick(&mut game, t0 + Duration::from_millis(1499), &mut out);
        assert!(out.is_empty());

        fuses.tick(&mut game, t0 + Duration::from_millis(1500), &mut out);
        let sent = out.drain();
        // Only the two connected sessions hear the blast
        assert_eq!(sent.len(), 2);
        for (_, message) in &sent {
            assert!(message.expects_ack);
            assert_eq!(
                message.data,
                MessageData::CommandBombDetonate(BombDetonation {
                    tile_x: 4,
                    tile_y: 4,
                    radius: BOMB_RADIUS
                })
            );
        }
        assert!(game.bombs().is_empty());
    }

    #[test]
    fn test_broadcaster_excludes_sender() {
        let now = Instant::now();
        let mut game = Game::new(record(GameKind::Exploration, 8));
        game.add_session(connected(1, now)).unwrap();
        game.add_session(connected(2, now)).unwrap();

        let mut out = Broadcaster::new();
        out.to_game(&game, MessageData::Empty, Some(UserId(1)), false);
        let sent = out.drain();

        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, game.session(&UserId(2)).unwrap().peer);
        assert!(!sent[0].1.expects_ack);
    }

    #[test]
    fn test_registry_register_is_idempotent() {
        let now = Instant::now();
        let mut registry = GameRegistry::new();
        registry
            .register(record(GameKind::Exploration, 8))
            .add_session(session(1, now))
            .unwrap();

        let mut renamed = record(GameKind::Exploration, 8);
        renamed.name = "Arena II".into();
        registry.register(renamed);

        assert_eq!(registry.len(), 1);
        let game = registry.get(&GameId(3)).unwrap();
        assert_eq!(game.record().name, "Arena II");
        assert_eq!(game.session_count(), 1);

        assert!(registry.destroy(&GameId(3)).is_some());
        assert!(registry.destroy(&GameId(3)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_tick_runs_simulation_then_sweep() {
        let t0 = Instant::now();
        let mut registry = GameRegistry::new();
        let game = registry.register(record(GameKind::Bomber, 8));
        game.add_session(connected(1, t0)).unwrap();
        game.place_bomb(
            BombPlacement {
                tile_x: 0,
                tile_y: 0,
                fuse_ms: 100,
                owner: None,
            },
            t0,
        )
        .unwrap();

        let mut out = Broadcaster::new();
        let evictions = registry.tick(t0 + Duration::from_secs(10), &mut out);

        // The detonation is addressed before the sweep removes the session
        assert_eq!(out.len(), 1);
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].user_id, UserId(1));
    }
}
