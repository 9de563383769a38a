//! Inbound datagram processing
//!
//! [`Dispatcher`] owns the game registry, the command table and the
//! collaborators. It is driven by the network loop through two calls that
//! take the current instant explicitly:
//!
//! - [`Dispatcher::handle`] decodes one datagram, admits its session, runs
//!   the command and returns the datagrams to send back
//! - [`Dispatcher::tick`] revalidates stale credentials, runs the game
//!   simulations and sweeps timed-out sessions
//!
//! Every failure is converted to an error reply here when the datagram
//! carried a `messageId`; nothing below this point can end the receive loop.

use crate::accounts::{AccountDirectory, GameRecord, GameStore, LookupError};
use crate::commands::{build_registry, executor, parser, CommandContext, ServerRegistry};
use crate::game::{Broadcaster, Eviction, EvictionReason, GameRegistry};
use crate::session::GameUserState;
use log::{debug, error, info, warn};
use shared::{
    GameCredential, GameId, GameKind, IncomingMessage, OutgoingMessage, ProtocolError,
    RawEnvelope, RegistryError, UserId, DEFAULT_VIABILITY,
};
use std::any::Any;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What the network loop has to do after one datagram
#[derive(Debug, Default)]
pub struct Outcome {
    /// Replies and relayed commands, in send order
    pub sends: Vec<(SocketAddr, OutgoingMessage)>,
    /// An ack for one of our own sends, to be matched against pending sends
    pub ack: Option<IncomingMessage>,
}

enum Processed {
    Ack(IncomingMessage),
    Cached(OutgoingMessage),
    Executed {
        game_id: GameId,
        user_id: UserId,
        data: shared::MessageData,
    },
}

fn transient(error: LookupError) -> ProtocolError {
    ProtocolError::Transient(error.to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

pub struct Dispatcher {
    registry: ServerRegistry,
    games: GameRegistry,
    accounts: Arc<dyn AccountDirectory>,
    store: Arc<dyn GameStore>,
    viability: Duration,
}

impl Dispatcher {
    pub fn new(
        accounts: Arc<dyn AccountDirectory>,
        store: Arc<dyn GameStore>,
    ) -> Result<Self, RegistryError> {
        Ok(Self::with_registry(accounts, store, build_registry()?))
    }

    /// Dispatcher over a custom command table.
    pub fn with_registry(
        accounts: Arc<dyn AccountDirectory>,
        store: Arc<dyn GameStore>,
        registry: ServerRegistry,
    ) -> Self {
        Self {
            registry,
            games: GameRegistry::new(),
            accounts,
            store,
            viability: DEFAULT_VIABILITY,
        }
    }

    /// Viability given to commands the server pushes to clients.
    pub fn with_viability(mut self, viability: Duration) -> Self {
        self.viability = viability;
        self
    }

    pub fn games(&self) -> &GameRegistry {
        &self.games
    }

    pub fn register_game(&mut self, record: GameRecord) {
        self.games.register(record);
    }

    /// Forgets a game whose record was deleted.
    pub fn destroy_game(&mut self, game_id: &GameId) -> bool {
        self.games.destroy(game_id).is_some()
    }

    /// Removes the session of an account that left the game.
    pub fn remove_member(&mut self, game_id: GameId, user_id: UserId, now: Instant) -> Option<Eviction> {
        let eviction = self
            .games
            .get_mut(&game_id)?
            .remove_session(&user_id, now, EvictionReason::Left)?;
        self.report(&eviction);
        Some(eviction)
    }

    pub fn handle(&mut self, bytes: &[u8], addr: SocketAddr, now: Instant) -> Outcome {
        let mut outcome = Outcome::default();

        let raw = match RawEnvelope::decode(bytes) {
            Ok(raw) => raw,
            Err(e) => {
                self.answer_undecodable(bytes, addr, &e, &mut outcome);
                return outcome;
            }
        };

        let mut out = Broadcaster::with_viability(self.viability);
        match self.process(&raw, addr, now, &mut out) {
            Ok(Processed::Ack(message)) => outcome.ack = Some(message),
            Ok(Processed::Cached(reply)) => {
                debug!("Answering retried {:?} from cache", raw.message_id);
                outcome.sends.push((addr, reply));
            }
            Ok(Processed::Executed {
                game_id,
                user_id,
                data,
            }) => {
                if let Some(message_id) = raw.message_id {
                    let reply = OutgoingMessage::response(message_id, data, true)
                        .key(raw.key.clone())
                        .build();
                    if let Some(session) = self
                        .games
                        .get_mut(&game_id)
                        .and_then(|game| game.session_mut(&user_id))
                    {
                        session.remember_response(message_id, reply.clone());
                    }
                    outcome.sends.push((addr, reply));
                }
            }
            Err(e) => {
                match &e {
                    ProtocolError::Internal(_) | ProtocolError::Io(_) => {
                        error!("Command from {} failed: {}", addr, e)
                    }
                    ProtocolError::Authentication(_) | ProtocolError::Transient(_) => {
                        warn!("Rejected datagram from {}: {}", addr, e)
                    }
                    _ => debug!("Rejected datagram from {}: {}", addr, e),
                }

                match raw.message_id {
                    Some(message_id) => outcome.sends.push((
                        addr,
                        OutgoingMessage::error(message_id, &e).key(raw.key.clone()).build(),
                    )),
                    None => debug!("No messageId to ack, dropping"),
                }
            }
        }

        outcome.sends.extend(out.drain());
        outcome
    }

    fn answer_undecodable(
        &self,
        bytes: &[u8],
        addr: SocketAddr,
        error: &ProtocolError,
        outcome: &mut Outcome,
    ) {
        match RawEnvelope::salvage_message_id(bytes) {
            Some(message_id) => {
                debug!("Malformed datagram {} from {}: {}", message_id, addr, error);
                let key = RawEnvelope::salvage_key(bytes).unwrap_or_default();
                outcome
                    .sends
                    .push((addr, OutgoingMessage::error(message_id, error).key(key).build()));
            }
            None => warn!("Dropped undecodable datagram from {}: {}", addr, error),
        }
    }

    fn process(
        &mut self,
        raw: &RawEnvelope,
        addr: SocketAddr,
        now: Instant,
        out: &mut Broadcaster,
    ) -> Result<Processed, ProtocolError> {
        let kind = raw.kind()?;
        let credential = GameCredential::decode(&raw.key)?;
        let game_kind = self.admit(&credential, addr, now)?;
        let (game_id, user_id) = (credential.game_id, credential.user_id);

        let registry = &self.registry;
        if raw.is_ack() {
            let data = raw.decode_payload(game_kind, |g, k| parser(registry, g, k))?;
            return Ok(Processed::Ack(raw.clone().into_incoming(data)));
        }

        let game = self
            .games
            .get_mut(&game_id)
            .ok_or_else(|| ProtocolError::Internal(format!("{} vanished during admission", game_id)))?;
        let session = game
            .session_mut(&user_id)
            .ok_or_else(|| ProtocolError::Internal(format!("{} vanished during admission", user_id)))?;

        if let Some(cached) = raw.message_id.and_then(|id| session.cached_response(&id)) {
            return Ok(Processed::Cached(cached.clone()));
        }

        let data = raw.decode_payload(game_kind, |g, k| parser(registry, g, k))?;
        let execute = executor(registry, game_kind, kind)
            .ok_or(ProtocolError::UnknownCommand { kind, game_kind })?;
        session.connection.admit(kind, now)?;

        let mut ctx = CommandContext {
            game,
            user_id,
            now,
            out,
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| execute(&mut ctx, &data)))
            .unwrap_or_else(|payload| {
                Err(ProtocolError::Internal(format!(
                    "{} handler panicked: {}",
                    kind,
                    panic_message(payload.as_ref())
                )))
            });

        result.map(|data| Processed::Executed {
            game_id,
            user_id,
            data,
        })
    }

    /// Makes sure the game is hosted and the credential's session exists and
    /// may act. Returns the game kind.
    fn admit(
        &mut self,
        credential: &GameCredential,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<GameKind, ProtocolError> {
        let (game_id, user_id) = (credential.game_id, credential.user_id);

        if self.games.get(&game_id).is_none() {
            let record = self
                .store
                .load_game(game_id)
                .map_err(transient)?
                .ok_or_else(|| ProtocolError::Authentication(format!("{} does not exist", game_id)))?;
            self.games.register(record);
        }

        let existing = self
            .games
            .get(&game_id)
            .and_then(|game| game.session(&user_id))
            .map(|session| (session.presents(credential), session.credential_stale(now)));

        match existing {
            Some((false, _)) => {
                return Err(ProtocolError::Authentication(
                    "credential does not match the session".into(),
                ));
            }
            Some((true, true)) => self.revalidate(game_id, user_id, now)?,
            Some((true, false)) => {}
            None => self.open_session(credential, addr, now)?,
        }

        let game = self
            .games
            .get_mut(&game_id)
            .ok_or_else(|| ProtocolError::Internal(format!("{} is not hosted", game_id)))?;
        let game_kind = game.kind();
        if let Some(session) = game.session_mut(&user_id) {
            if let Some(previous) = session.rebind(addr) {
                info!("{} moved from {} to {}", user_id, previous, addr);
            }
        }
        Ok(game_kind)
    }

    fn open_session(
        &mut self,
        credential: &GameCredential,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<(), ProtocolError> {
        let (game_id, user_id) = (credential.game_id, credential.user_id);

        let account = self
            .accounts
            .authenticate(credential)
            .map_err(transient)?
            .ok_or_else(|| ProtocolError::Authentication("credential rejected".into()))?;

        if !self.store.is_member(game_id, user_id).map_err(transient)? {
            return Err(ProtocolError::Authentication(format!(
                "{} is not a member of {}",
                user_id, game_id
            )));
        }

        let prior = self
            .store
            .recorded_play_time(game_id, user_id)
            .map_err(transient)?;
        let session = GameUserState::new(account.name, credential.clone(), addr, now)
            .with_prior_play_time(prior);
        self.games
            .get_mut(&game_id)
            .ok_or_else(|| ProtocolError::Internal(format!("{} is not hosted", game_id)))?
            .add_session(session)
    }

    /// Checks a stale credential with the directory again. A rejected
    /// credential evicts the session.
    fn revalidate(&mut self, game_id: GameId, user_id: UserId, now: Instant) -> Result<(), ProtocolError> {
        let credential = match self.games.get(&game_id).and_then(|g| g.session(&user_id)) {
            Some(session) => session.credential().clone(),
            None => return Ok(()),
        };

        match self.accounts.authenticate(&credential).map_err(transient)? {
            Some(_) => {
                if let Some(session) = self
                    .games
                    .get_mut(&game_id)
                    .and_then(|game| game.session_mut(&user_id))
                {
                    session.refresh_credential(now);
                }
                Ok(())
            }
            None => {
                warn!("Credential of {} in {} is no longer valid", user_id, game_id);
                if let Some(eviction) = self
                    .games
                    .get_mut(&game_id)
                    .and_then(|game| game.remove_session(&user_id, now, EvictionReason::CredentialRejected))
                {
                    self.report(&eviction);
                }
                Err(ProtocolError::Authentication(
                    "credential is no longer valid".into(),
                ))
            }
        }
    }

    fn report(&self, eviction: &Eviction) {
        if let Err(e) =
            self.store
                .record_play_time(eviction.game_id, eviction.user_id, eviction.play_time)
        {
            warn!(
                "Could not record play time of {} in {}: {}",
                eviction.user_id, eviction.game_id, e
            );
        }
    }

    /// One server tick. Returns the datagrams produced by the simulations.
    pub fn tick(&mut self, now: Instant) -> Vec<(SocketAddr, OutgoingMessage)> {
        let stale: Vec<(GameId, UserId)> = self
            .games
            .iter()
            .flat_map(|game| {
                game.sessions()
                    .filter(move |session| session.credential_stale(now))
                    .map(move |session| (game.id(), session.user_id))
            })
            .collect();

        for (game_id, user_id) in stale {
            match self.revalidate(game_id, user_id, now) {
                Err(e) if e.is_retryable() => {
                    debug!("Revalidation of {} in {} retried next tick: {}", user_id, game_id, e)
                }
                Err(e) => debug!("Revalidation of {} in {}: {}", user_id, game_id, e),
                Ok(()) => {}
            }
        }

        let mut out = Broadcaster::with_viability(self.viability);
        let evictions = self.games.tick(now, &mut out);
        for eviction in &evictions {
            self.report(eviction);
        }
        out.drain()
    }
}
