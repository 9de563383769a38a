//! # Game Client Library
//!
//! Client side of the session protocol: one [`network::Client`] represents one
//! player's connection to one hosted game, identified by the credential the
//! server issued for it.
//!
//! ## Connection Lifecycle
//!
//! ### Readiness Gate
//! A fresh client is not ready. Only the connect command may be sent; every
//! other send fails locally with `NotReady` and puts nothing on the wire. The
//! gate opens once the connect response has been processed and closes again
//! when the server rejects a heartbeat or the credential.
//!
//! ### Heartbeats
//! While ready, a background task sends a heartbeat every three seconds,
//! comfortably inside the server's ten second timeout.
//!
//! ### Reliable Sends
//! Acked commands stay in the transport's pending table and are resent until
//! the reply arrives or their viability runs out. Server pushes carrying a
//! `messageId` are acked, and repeated pushes are answered from a response
//! cache instead of being applied twice.
//!
//! ## Module Organization
//!
//! - `session`: the local mirror of the player's session
//! - `commands`: invokers, response handlers and executors per message kind
//! - `network`: socket tasks and the request API
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Client, ClientConfig};
//! use shared::{GameCredential, GameKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let credential = GameCredential::decode("...")?;
//!     let client = Client::new(&ClientConfig::default(), credential, GameKind::Exploration).await?;
//!     let _tasks = client.start();
//!
//!     client.connect().await?;
//!     client.say("hello").await?;
//!     client.disconnect().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod commands;
pub mod network;
pub mod session;
