//! Command-line interface: `rollout <job-config-path>` runs one job and
//! prints a summary.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
