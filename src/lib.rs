//! cronlease
//!
//! Distributed cron scheduling over a shared Postgres database. Rows of
//! application tables carry their own cron state; worker processes lease due
//! rows with row locks, execute them, and coordinate through heartbeat and
//! signal tables.
//!
//! Embedding applications implement [`jobs::Schedulable`] for each table,
//! register a [`jobs::JobExecutor`] per type in a [`jobs::JobRegistry`], and
//! run a [`worker::Worker`] (or the `run` command through
//! [`cli::RegistryBuilder`]).

use shadow_rs::shadow;
shadow!(build);

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod logger;
pub mod models;
pub mod repositories;
pub mod schema;
pub mod worker;

pub fn pkg_version() -> &'static str {
    build::PKG_VERSION
}

pub fn clap_long_version() -> &'static str {
    build::CLAP_LONG_VERSION
}
