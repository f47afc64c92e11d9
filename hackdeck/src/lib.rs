//! hackdeck: command-line and HTTP front ends for [`hackdeck_core`].

pub mod cli;
pub mod load_config;
pub mod server;

pub use cli::{run, Cli, Commands};
