//! Live Server Library
//!
//! This library provides the core functionality of the venueless live
//! server, a WebSocket control plane for virtual event worlds:
//!
//! - One [`consumer::Consumer`] per client socket speaking the JSON array
//!   protocol (`[action, id, body]` in, `[id, "success", body]` out)
//! - A [`modules::ModuleRegistry`] built once at startup that maps
//!   `module.verb` actions to guarded command handlers and event handlers
//! - Trait-based permission checks against world and room grants
//! - BBB, Janus and TURN server selection with a cost model
//! - A sharded channel layer with group fan-out over Redis
//! - A connection registry counting live sockets per deployment label
//!
//! # Architecture
//!
//! ```text
//! routes (axum WebSocket upgrade)
//! └── Consumer (one per socket)
//!     ├── ModuleRegistry ── room / chat / poll / question / bbb / januscall
//!     ├── auth (tokens, traits, capabilities)
//!     ├── ChannelLayer (sharded groups + per-process inbox)
//!     └── ConnectionRegistry (label counters, per-user sets)
//! tasks
//! ├── BBB cost refresher
//! └── room view cleanup
//! ```
//!
//! # Modules
//!
//! - [`admin`] - Operations behind the `live-connections` command
//! - [`auth`] - Token login and permission evaluation
//! - [`channels`] - Sharded channel layer and group naming
//! - [`conferencing`] - BBB, Janus and TURN clients and server selection
//! - [`config`] - Service configuration from environment
//! - [`consumer`] - Per-socket protocol state machine
//! - [`errors`] - Error types with client-facing error codes
//! - [`modules`] - Command and event registry plus the feature modules
//! - [`registry`] - Live connection accounting
//! - [`routes`] - HTTP and WebSocket routes

pub mod admin;
pub mod auth;
pub mod channels;
pub mod conferencing;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod models;
pub mod modules;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod repositories;
pub mod routes;
pub mod state;
pub mod store;
pub mod tasks;
