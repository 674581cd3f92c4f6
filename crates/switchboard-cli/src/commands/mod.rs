//! CLI command implementations.

pub mod config;
pub mod serve;

pub use config::{run_check, run_init};
pub use serve::run_serve;
