pub mod autonomous;
pub mod classifier;
pub mod cli;
pub mod collect;
pub mod config;
pub mod error;
pub mod frame;
pub mod http;
pub mod motor;
pub mod preprocess;
pub mod router;
pub mod state;
pub mod stream;
pub mod teleop;

pub use cli::{execute, run_cli, Cli, Commands, ConfigSubcommand, ModelSubcommand};
