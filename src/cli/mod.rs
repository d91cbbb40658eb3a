//! CLI module for streamscope - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
