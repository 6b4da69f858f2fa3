//! CLI subcommand implementations.

pub mod ingest;
pub mod recover;
pub mod run;
pub mod sample;
pub mod status;
pub mod tick;
