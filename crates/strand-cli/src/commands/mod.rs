//! Subcommand implementations

pub mod echo;
pub mod fanout;
