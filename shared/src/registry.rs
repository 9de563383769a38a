//! Command registry mapping (game kind, message kind, role) to handlers
//!
//! Handlers are declared as [`CommandDefinition`]s: a set of message kinds,
//! an optional set of game kinds they are restricted to, and one handler per
//! role. A [`RegistryBuilder`] folds the definitions into a table once at
//! start-up and refuses duplicates; the resulting [`CommandRegistry`] is
//! immutable and can be shared between tasks behind an `Arc` without locking.
//!
//! The handler type is chosen by each side. The server fills the parser and
//! executor roles, the client fills parser, executor (server pushes), invoker
//! and response roles. Both use the same message-kind space.

use crate::message::MessageKind;
use crate::types::GameKind;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Turns the raw `data` object into a typed payload
    Parser,
    /// Executes an inbound command and produces the response payload
    Executor,
    /// Prepares a locally initiated send
    Invoker,
    /// Reacts to the peer's reply to a command we sent
    ResponseHandler,
}

/// Implemented by handler values so the builder can file them under a role.
pub trait RoleHandler {
    fn role(&self) -> Role;
}

/// Which game kinds an entry applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    AllGames,
    Game(GameKind),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::AllGames => f.write_str("all games"),
            Scope::Game(kind) => write!(f, "{} games", kind),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate {role:?} handler for {kind} in {scope}: `{existing}` and `{incoming}`")]
    Duplicate {
        scope: Scope,
        kind: MessageKind,
        role: Role,
        existing: &'static str,
        incoming: &'static str,
    },

    #[error("definition `{0}` declares no message kinds")]
    NoKinds(&'static str),
}

/// Declarative description of the handlers for one or more message kinds
#[derive(Debug, Clone)]
pub struct CommandDefinition<H> {
    name: &'static str,
    kinds: Vec<MessageKind>,
    game_kinds: Vec<GameKind>,
    handlers: Vec<H>,
}

impl<H> CommandDefinition<H> {
    pub fn new(name: &'static str, kinds: &[MessageKind]) -> Self {
        Self {
            name,
            kinds: kinds.to_vec(),
            game_kinds: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Restricts the definition to the given game kinds. Without this call it
    /// applies to every game kind.
    pub fn for_games(mut self, game_kinds: &[GameKind]) -> Self {
        self.game_kinds = game_kinds.to_vec();
        self
    }

    pub fn with(mut self, handler: H) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Re-wraps every handler, e.g. to lift shared parsers into a side's
    /// own handler enum.
    pub fn map<T>(self, f: impl Fn(H) -> T) -> CommandDefinition<T> {
        CommandDefinition {
            name: self.name,
            kinds: self.kinds,
            game_kinds: self.game_kinds,
            handlers: self.handlers.into_iter().map(f).collect(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kinds(&self) -> &[MessageKind] {
        &self.kinds
    }

    fn scopes(&self) -> Vec<Scope> {
        if self.game_kinds.is_empty() {
            vec![Scope::AllGames]
        } else {
            self.game_kinds.iter().copied().map(Scope::Game).collect()
        }
    }
}

pub struct RegistryBuilder<H> {
    entries: HashMap<(Scope, MessageKind, Role), (&'static str, H)>,
}

impl<H: RoleHandler + Clone> RegistryBuilder<H> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Files every handler of `definition` under each of its kinds and scopes.
    pub fn define(&mut self, definition: CommandDefinition<H>) -> Result<&mut Self, RegistryError> {
        if definition.kinds.is_empty() {
            return Err(RegistryError::NoKinds(definition.name));
        }

        let mut staged = HashMap::new();
        for scope in definition.scopes() {
            for &kind in &definition.kinds {
                for handler in &definition.handlers {
                    let key = (scope, kind, handler.role());
                    let existing = self
                        .entries
                        .get(&key)
                        .map(|(name, _)| *name)
                        .or_else(|| staged.contains_key(&key).then_some(definition.name));
                    if let Some(existing) = existing {
                        return Err(RegistryError::Duplicate {
                            scope,
                            kind,
                            role: key.2,
                            existing,
                            incoming: definition.name,
                        });
                    }
                    staged.insert(key, (definition.name, handler.clone()));
                }
            }
        }

        // Nothing is filed unless the whole definition fits
        self.entries.extend(staged);
        Ok(self)
    }

    pub fn define_all(
        &mut self,
        definitions: impl IntoIterator<Item = CommandDefinition<H>>,
    ) -> Result<&mut Self, RegistryError> {
        for definition in definitions {
            self.define(definition)?;
        }
        Ok(self)
    }

    pub fn build(self) -> CommandRegistry<H> {
        CommandRegistry {
            entries: self
                .entries
                .into_iter()
                .map(|(key, (_, handler))| (key, handler))
                .collect(),
        }
    }
}

impl<H: RoleHandler + Clone> Default for RegistryBuilder<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable lookup table produced by [`RegistryBuilder::build`]
pub struct CommandRegistry<H> {
    entries: HashMap<(Scope, MessageKind, Role), H>,
}

impl<H> CommandRegistry<H> {
    /// Game-kind scoped entries win over wildcard entries.
    pub fn resolve(&self, game_kind: GameKind, kind: MessageKind, role: Role) -> Option<&H> {
        self.entries
            .get(&(Scope::Game(game_kind), kind, role))
            .or_else(|| self.entries.get(&(Scope::AllGames, kind, role)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
