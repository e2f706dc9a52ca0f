//! nightrun common library
//!
//! Shared types, errors and configuration resolution for the nightrun
//! compile → serve → drive → test pipeline.

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{
    CompilerConfig, DriverCyclePolicy, RunnerConfig, Settings, DEFAULT_DRIVER_PORT,
};
pub use error::{Error, KillError, Result};
pub use types::*;

/// nightrun version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default settings file name
pub const DEFAULT_SETTINGS_FILE: &str = "nightrun.toml";

/// Default dev-server workspace file name
pub const DEFAULT_WORKSPACE_FILE: &str = "nightrun.workspace.json";
