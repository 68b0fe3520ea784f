//! Command-line interface for agent-harbor.
//!
//! Provides the `serve` and `proxy` commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, ProxyArgs, ServeArgs};
