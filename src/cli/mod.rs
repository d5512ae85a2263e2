//! Command-line interface for storee.
//!
//! Provides commands to run the scheduler, submit stories, and inspect
//! queues and dead-letter lists.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
