//! Command-line interface for aurelia.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
