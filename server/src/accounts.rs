//! Collaborators the server consults but does not own
//!
//! Account authentication and game records live behind the HTTP account API
//! and its database. The server only needs three questions answered, modelled
//! as [`AccountDirectory`] and [`GameStore`]. Both are synchronous and may fail
//! transiently with [`LookupError`].
//!
//! [`MemoryDirectory`] implements both in memory for the demo binary and tests.

use log::{debug, info};
use serde_json::Value;
use shared::{GameCredential, GameId, GameKind, UserId, DEFAULT_MAX_PLAYERS};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("{0} is unavailable")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub user_id: UserId,
    pub name: String,
}

/// Database description of a game
#[derive(Debug, Clone, PartialEq)]
pub struct GameRecord {
    pub id: GameId,
    pub name: String,
    pub host: UserId,
    pub map: String,
    pub kind: GameKind,
    /// Game-kind specific settings as stored by the account API
    pub config: Value,
}

impl GameRecord {
    pub fn max_players(&self) -> usize {
        self.config
            .get("maxPlayers")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_PLAYERS)
    }
}

pub trait AccountDirectory: Send + Sync {
    /// Returns the account the credential belongs to, or `None` when the key
    /// is not (or no longer) valid for that game.
    fn authenticate(&self, credential: &GameCredential) -> Result<Option<Account>, LookupError>;
}

pub trait GameStore: Send + Sync {
    fn load_game(&self, game_id: GameId) -> Result<Option<GameRecord>, LookupError>;

    fn is_member(&self, game_id: GameId, user_id: UserId) -> Result<bool, LookupError>;

    /// Total play time recorded so far, zero for a user never recorded.
    fn recorded_play_time(&self, game_id: GameId, user_id: UserId) -> Result<Duration, LookupError>;

    /// Adds one finished session's play time to the stored total.
    fn record_play_time(
        &self,
        game_id: GameId,
        user_id: UserId,
        play_time: Duration,
    ) -> Result<(), LookupError>;
}

#[derive(Default)]
struct Tables {
    games: HashMap<GameId, GameRecord>,
    members: HashSet<(GameId, UserId)>,
    keys: HashMap<(GameId, UserId), String>,
    names: HashMap<UserId, String>,
    play_time: HashMap<(GameId, UserId), Duration>,
}

/// In-memory account directory and game store
#[derive(Default)]
pub struct MemoryDirectory {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, LookupError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LookupError::Unavailable("account database".into()));
        }
        self.tables
            .lock()
            .map_err(|_| LookupError::Unavailable("account tables".into()))
    }

    /// Makes every lookup fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn add_game(&self, record: GameRecord) -> Result<(), LookupError> {
        let mut tables = self.tables()?;
        info!("Stored game {} ({}, {})", record.id, record.name, record.kind);
        tables.members.insert((record.id, record.host));
        tables.games.insert(record.id, record);
        Ok(())
    }

    pub fn delete_game(&self, game_id: GameId) -> Result<Option<GameRecord>, LookupError> {
        let mut tables = self.tables()?;
        tables.members.retain(|(game, _)| *game != game_id);
        tables.keys.retain(|(game, _), _| *game != game_id);
        Ok(tables.games.remove(&game_id))
    }

    /// Adds the user to the game and issues the credential the account API
    /// would hand out for it.
    pub fn issue_credential(
        &self,
        game_id: GameId,
        user_id: UserId,
        name: &str,
        key: &str,
    ) -> Result<GameCredential, LookupError> {
        let mut tables = self.tables()?;
        tables.members.insert((game_id, user_id));
        tables.keys.insert((game_id, user_id), key.to_string());
        tables.names.insert(user_id, name.to_string());
        debug!("Issued credential for {} in {}", user_id, game_id);
        Ok(GameCredential::new(game_id, user_id, key))
    }

    /// Invalidates the user's credential and membership.
    pub fn revoke(&self, game_id: GameId, user_id: UserId) -> Result<(), LookupError> {
        let mut tables = self.tables()?;
        tables.keys.remove(&(game_id, user_id));
        tables.members.remove(&(game_id, user_id));
        Ok(())
    }

    pub fn play_time(&self, game_id: GameId, user_id: UserId) -> Option<Duration> {
        self.tables
            .lock()
            .ok()
            .and_then(|tables| tables.play_time.get(&(game_id, user_id)).copied())
    }
}

impl AccountDirectory for MemoryDirectory {
    fn authenticate(&self, credential: &GameCredential) -> Result<Option<Account>, LookupError> {
        let tables = self.tables()?;
        let issued = tables.keys.get(&(credential.game_id, credential.user_id));

        Ok(match issued {
            Some(key) if *key == credential.key => Some(Account {
                user_id: credential.user_id,
                name: tables
                    .names
                    .get(&credential.user_id)
                    .cloned()
                    .unwrap_or_else(|| credential.user_id.to_string()),
            }),
            _ => None,
        })
    }
}

impl GameStore for MemoryDirectory {
    fn load_game(&self, game_id: GameId) -> Result<Option<GameRecord>, LookupError> {
        Ok(self.tables()?.games.get(&game_id).cloned())
    }

    fn is_member(&self, game_id: GameId, user_id: UserId) -> Result<bool, LookupError> {
        Ok(self.tables()?.members.contains(&(game_id, user_id)))
    }

    fn recorded_play_time(&self, game_id: GameId, user_id: UserId) -> Result<Duration, LookupError> {
        Ok(self
            .tables()?
            .play_time
            .get(&(game_id, user_id))
            .copied()
            .unwrap_or_default())
    }

    fn record_play_time(
        &self,
        game_id: GameId,
        user_id: UserId,
        play_time: Duration,
    ) -> Result<(), LookupError> {
        *self
            .tables()?
            .play_time
            .entry((game_id, user_id))
            .or_default() += play_time;
        Ok(())
    }
}
