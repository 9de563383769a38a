//! # Game Server Library
//!
//! Authoritative server side of the session protocol. It hosts games, admits
//! players presenting a per-game credential, executes their commands and
//! keeps every session's connection state honest with heartbeats.
//!
//! ## Core Responsibilities
//!
//! ### Session Admission
//! The first datagram carrying a credential for a game that is not hosted yet
//! loads the game record from the [`accounts::GameStore`]. A credential without
//! a session is authenticated with the [`accounts::AccountDirectory`] and
//! checked for membership and capacity before a session is opened. Admitted
//! credentials are re-checked every ten seconds; a rejected one evicts its
//! session.
//!
//! ### Command Execution
//! Commands are resolved through the shared command registry by game kind and
//! message kind. Each executed command with a `messageId` is acknowledged with
//! the executor's payload, or with one of the four error kinds. Successful
//! replies are cached per session so a resent command is answered again
//! instead of running twice.
//!
//! ### Timeouts and Play Time
//! Every tick runs the game-kind simulation and then sweeps sessions whose
//! heartbeat deadline passed. Evicted sessions report their final play time
//! to the game store.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! A receiver task forwards datagrams over a channel; the main loop owns the
//! [`dispatch::Dispatcher`] and interleaves datagrams with ticks using
//! `tokio::select!`. All game and session state is mutated from that loop only.
//!
//! ### Explicit Clock
//! The dispatcher never reads the clock itself. The loop passes the current
//! instant in, which lets tests replay whole scenarios deterministically.
//!
//! ## Module Organization
//!
//! - `accounts`: collaborator traits and the in-memory directory
//! - `session`: per-account state inside a game
//! - `game`: games, the game registry, simulations and the broadcaster
//! - `commands`: the server command table
//! - `dispatch`: datagram processing and the tick
//! - `network`: socket tasks and the main loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::accounts::MemoryDirectory;
//! use server::network::{Server, ServerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let directory = Arc::new(MemoryDirectory::new());
//!     let config = ServerConfig::default();
//!
//!     let mut server = Server::new(&config, directory.clone(), directory).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod accounts;
pub mod commands;
pub mod dispatch;
pub mod game;
pub mod network;
pub mod session;
