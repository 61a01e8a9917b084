// ABOUTME: Command line interface for taskweave
// ABOUTME: Exports argument parsing, configuration loading and the application entry point

pub mod app;
pub mod args;
pub mod commands;
pub mod config;

pub use app::App;
pub use args::{Args, Commands};
pub use config::{Config, LoggingConfig};
