//! Command handlers for CLI operations
//!
//! This module contains handlers for different CLI commands,
//! separating command execution logic from parsing and validation.

pub mod migrate;
pub mod run;
pub mod signals;
pub mod workers;

pub use migrate::MigrateCommandHandler;
pub use run::{RegistryBuilder, RunCommandHandler};
pub use signals::SignalCommandHandler;
pub use workers::WorkersCommandHandler;
