//! reactorcore: an async event log and claim-based dispatch engine.
//!
//! A [`Message`] is appended to a stream; registered [`Reactor`]s (actors,
//! projectors, reactions) claim batches of unseen messages one stream at a
//! time and return [`ActionPair`]s describing what should happen next. A
//! [`Router`] drives the claim/handle/apply/ack cycle, a pool of [`Worker`]s
//! drive the router concurrently off a [`WorkQueue`], and a [`Supervisor`]
//! owns the whole runtime: workers, a [`Notifier`], a [`CatchUpPoller`] and
//! a [`HouseKeeper`].
//!
//! # Architecture
//!
//! ```text
//! Backend (append-only log + claims) ── claim_next_batch ──> Router
//!                                                               │
//!                               handle_batch                   │
//!                      Reactor <─────────────────────────────┘
//!                         │
//!                      ActionPair(s) ── apply_all ──> Backend (ack)
//! ```
//!
//! `reactorcore` itself defines the contract and an in-process
//! [`backend::memory::MemoryBackend`] for tests. `reactorcore-postgres` and
//! `reactorcore-sqlite` are the production `Backend` implementations.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use reactorcore::{Config, Supervisor};
//! use reactorcore::backend::memory::MemoryBackend;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend: Arc<dyn reactorcore::Backend> = Arc::new(MemoryBackend::new());
//!     backend.install().await.unwrap();
//!
//!     let supervisor = Supervisor::new(Config::default(), backend);
//!     let handle = supervisor.start().await;
//!     // ... register_reactor before start(), run until signalled ...
//!     handle.shutdown().await;
//! }
//! ```
//!
//! # Modules
//!
//! - [`message`] - the log envelope and registry
//! - [`errors`] - the error taxonomy
//! - [`backend`] - the `Backend` contract and entities it persists
//! - [`actions`] - deferred side effects returned by a handler
//! - [`reactor`] - the `Reactor` contract
//! - [`work_queue`] - bounded per-reactor signal queue
//! - [`notifier`] - LISTEN/NOTIFY-style fan-out abstraction
//! - [`catch_up_poller`] - periodic safety-net re-push
//! - [`error_strategy`] - retry/stop decision policy
//! - [`config`] - runtime configuration
//! - [`router`] - the claim/dispatch core
//! - [`worker`] - the pop-and-drain loop
//! - [`housekeeper`] - schedule promotion, heartbeats, stale claim reaping
//! - [`supervisor`] - runtime lifecycle owner

pub mod actions;
pub mod backend;
pub mod catch_up_poller;
pub mod config;
pub mod error_strategy;
pub mod errors;
pub mod housekeeper;
pub mod message;
pub mod notifier;
pub mod reactor;
pub mod router;
pub mod supervisor;
pub mod work_queue;
pub mod worker;

pub use actions::{Action, ActionPair};
pub use backend::Backend;
pub use config::{Config, Executor};
pub use error_strategy::{DefaultErrorStrategy, ErrorStrategy, GroupAction};
pub use errors::{CoreError, CoreResult};
pub use message::{BatchEntry, Message, MessageRegistry};
pub use reactor::{ConsumerInfo, Reactor, ReactorFamily};
pub use router::Router;
pub use supervisor::{Supervisor, SupervisorHandle};
pub use worker::Worker;

/// Crate version, exposed for diagnostics/telemetry the way services
/// commonly stamp their own build into logs and health endpoints.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
