//! Sessionizer CLI library.
//!
//! This crate provides the `sz` command-line interface: intake, finalization
//! ticks, the periodic scheduler, recovery and status.

pub mod app;
mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands};
pub use config::Config;
