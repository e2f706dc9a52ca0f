//! Error types for nightrun

use std::path::PathBuf;
use thiserror::Error;

use crate::types::StageName;

/// Result type alias using the nightrun Error
pub type Result<T> = std::result::Result<T, Error>;

/// nightrun error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to parse {path}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    #[error("Failed to spawn {program}: {source}")]
    ProcessSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} process exited with {}", describe_code(.code))]
    ProcessExit { stage: StageName, code: Option<i32> },

    #[error("{stage} stage failed: {diagnostic}")]
    StageFailed { stage: StageName, diagnostic: String },

    #[error("Invalid target '{0}': expected project:task[:configuration]")]
    InvalidTarget(String),

    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("Invalid serve options for {target}: {reason}")]
    InvalidServeOptions { target: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} stage ended without producing a result")]
    StageEnded(StageName),
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

impl Error {
    /// Shorthand for a config parse error on `path`
    pub fn config_parse(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::ConfigParse {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Raised when a subtree kill could not be issued or confirmed.
///
/// Never propagated past the supervisor; callers log it and move on.
#[derive(Error, Debug)]
#[error("Failed to terminate pid {pid}: {reason}")]
pub struct KillError {
    pub pid: u32,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_exit_message() {
        let err = Error::ProcessExit {
            stage: StageName::Compile,
            code: Some(2),
        };
        assert_eq!(err.to_string(), "compile process exited with code 2");

        let err = Error::ProcessExit {
            stage: StageName::Driver,
            code: None,
        };
        assert_eq!(err.to_string(), "driver process exited with a signal");
    }

    #[test]
    fn test_config_parse_message() {
        let err = Error::config_parse("tsconfig.e2e.json", "missing outDir");
        assert!(err.to_string().contains("tsconfig.e2e.json"));
        assert!(err.to_string().contains("missing outDir"));
    }
}
