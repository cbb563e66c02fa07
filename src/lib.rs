//! Core of an SSH remote-monitoring client.
//!
//! Connects to a server (directly or through one jump host), samples system
//! metrics over exec channels, runs an interactive terminal and discovers
//! SSH hosts on the local /24. UI-facing output is pushed as [`CoreEvent`]s
//! through an [`EventSink`].

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod monitor;
pub mod scan;
pub mod ssh;
pub mod state;
pub mod terminal;

#[cfg(test)]
mod testing;

pub use error::{AppError, AppResult};
pub use events::{CoreEvent, DisconnectReason, EventSink, StatusNotice};
pub use state::AppState;
