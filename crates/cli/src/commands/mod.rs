// CLI subcommands

pub mod check;
pub mod config;
pub mod run;
