//! The session daemon.
//!
//! One daemon per machine launches agent sessions on request and tracks them
//! until they exit, whoever started them.
//!
//! ## Architecture
//!
//! - **Lock (`lock.rs`)** and **State (`state_store.rs`)**: single-instance
//!   enforcement and the heartbeat snapshot other processes discover us by.
//! - **Registry (`registry.rs`)**: tracked sessions plus the pending spawn
//!   correlations waiting for a report-back.
//! - **Spawn (`spawn.rs`)**: directory check, environment layering, tmux or
//!   plain launch, then the wait for the child's session id.
//! - **Control (`control.rs`)**: tarpc surface on `127.0.0.1`.
//! - **Health (`health.rs`)** and **Lifecycle (`lifecycle.rs`)**: periodic
//!   upkeep and the shutdown state machine.
//! - **Run (`run.rs`)**: startup wiring.

pub mod control;
pub mod credentials;
pub mod directory;
pub mod env;
pub mod health;
pub mod lifecycle;
pub mod lock;
pub mod process;
pub mod profiles;
pub mod registry;
pub mod run;
pub mod spawn;
pub mod state_store;
pub mod tmux;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;

pub use run::run_daemon;
