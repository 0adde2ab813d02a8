//! Realtime chat relay.
//!
//! A single process keeps the last few messages in memory and fans every new
//! one out to the connected browsers. Each module covers one concern:
//!
//! - [`record`] defines message records and what clients submit.
//! - [`relay`] is the bounded log: append, evict the oldest, snapshot.
//! - [`gateway`] runs the hub task that owns the relay and drives one
//!   WebSocket session per connection over a Tokio `broadcast` channel.
//! - [`protocol`] is the `{"event", "data"}` JSON frame format.
//! - [`server`] wires the gateway, the HTTP polling fallback and the
//!   embedded [`web`] client into an axum router.
//! - [`client`] and [`history`] make up the terminal client, which
//!   reconnects on its own and keeps a trailing window of history on disk.
//! - [`cli`] parses the command line for both modes.

pub mod cli;
pub mod client;
pub mod error;
pub mod gateway;
pub mod history;
pub mod protocol;
pub mod record;
pub mod relay;
pub mod server;
pub mod web;
