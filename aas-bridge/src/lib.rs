pub mod cli;
pub mod load_config;
pub mod management;

pub use cli::{run, Cli, Commands};
