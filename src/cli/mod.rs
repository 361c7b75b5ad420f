//! Command-line handlers

mod commands;

pub use commands::{build_config, cmd_config, cmd_start, CliResult, StartOptions};
