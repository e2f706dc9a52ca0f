//! Core types shared by the pipeline and the CLI

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Stages
// ============================================================================

/// Identity of a pipeline stage, also used as the process slot index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageName {
    Compile,
    DevServer,
    Driver,
    TestRun,
}

impl StageName {
    pub const ALL: [StageName; 4] = [
        StageName::Compile,
        StageName::DevServer,
        StageName::Driver,
        StageName::TestRun,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Compile => "compile",
            StageName::DevServer => "dev-server",
            StageName::Driver => "driver",
            StageName::TestRun => "test-run",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome emitted by a stage.
///
/// One-shot stages emit exactly one; watch-mode stages emit one per cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,
    pub success: bool,
    pub diagnostic: Option<String>,
}

impl StageResult {
    pub fn ok(stage: StageName) -> Self {
        Self {
            stage,
            success: true,
            diagnostic: None,
        }
    }

    pub fn failed(stage: StageName, diagnostic: impl Into<String>) -> Self {
        Self {
            stage,
            success: false,
            diagnostic: Some(diagnostic.into()),
        }
    }

    /// Result mirroring a process exit code (`None` means killed by a signal)
    pub fn from_exit(stage: StageName, code: Option<i32>) -> Self {
        match code {
            Some(0) => Self::ok(stage),
            Some(code) => Self::failed(stage, format!("{} exited with code {}", stage, code)),
            None => Self::failed(stage, format!("{} was terminated by a signal", stage)),
        }
    }
}

/// Event yielded to the host on the pipeline's result stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BuildEvent {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

impl From<StageResult> for BuildEvent {
    fn from(result: StageResult) -> Self {
        Self {
            success: result.success,
            error: result.diagnostic,
        }
    }
}

// ============================================================================
// Pipeline input
// ============================================================================

/// Immutable input of one pipeline invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Compiler config (tsconfig-style JSON)
    pub compiler_config: PathBuf,

    /// Test-runner config (JSON)
    pub runner_config: PathBuf,

    /// Dev-server target in `project:task[:configuration]` form
    pub dev_server_target: Option<String>,

    /// Workspace file the dev-server target is resolved from
    pub workspace: PathBuf,

    /// Watch-and-rerun mode
    pub watch: bool,
}

impl PipelineOptions {
    pub fn new(compiler_config: impl Into<PathBuf>, runner_config: impl Into<PathBuf>) -> Self {
        Self {
            compiler_config: compiler_config.into(),
            runner_config: runner_config.into(),
            dev_server_target: None,
            workspace: PathBuf::from(crate::DEFAULT_WORKSPACE_FILE),
            watch: false,
        }
    }

    pub fn with_dev_server(mut self, target: impl Into<String>) -> Self {
        self.dev_server_target = Some(target.into());
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }
}

// ============================================================================
// Serving
// ============================================================================

/// Resolved serving options of a dev-server target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServeOptions {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub serve_path: Option<String>,

    #[serde(default)]
    pub ssl: bool,

    #[serde(default)]
    pub public_host: Option<String>,

    #[serde(default)]
    pub watch: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    4200
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            serve_path: None,
            ssl: false,
            public_host: None,
            watch: false,
        }
    }
}

/// Externally reachable base URL of the served application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedBaseUrl(String);

impl ResolvedBaseUrl {
    /// Derive the base URL from serving options.
    ///
    /// A public host wins over host/port/path. It gets a scheme prefix when it
    /// has none.
    pub fn from_serve_options(options: &ServeOptions) -> Self {
        let protocol = if options.ssl { "https" } else { "http" };

        if let Some(public_host) = options.public_host.as_deref().filter(|h| !h.is_empty()) {
            let url = if public_host.contains("://") {
                public_host.to_string()
            } else {
                format!("{}://{}", protocol, public_host)
            };
            return Self(url.trim_end_matches('/').to_string());
        }

        let path = match options.serve_path.as_deref().map(|p| p.trim_end_matches('/')) {
            None | Some("") => String::new(),
            Some(p) if p.starts_with('/') => p.to_string(),
            Some(p) => format!("/{}", p),
        };

        Self(format!("{}://{}:{}{}", protocol, options.host, options.port, path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResolvedBaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn serve(host: &str, port: u16, path: Option<&str>, ssl: bool, public: Option<&str>) -> ServeOptions {
        ServeOptions {
            host: host.to_string(),
            port,
            serve_path: path.map(String::from),
            ssl,
            public_host: public.map(String::from),
            watch: false,
        }
    }

    #[test_case(serve("0.0.0.0", 4200, None, true, Some("example.com")), "https://example.com" ; "public host with tls")]
    #[test_case(serve("localhost", 4200, Some("/app"), false, None), "http://localhost:4200/app" ; "host port and path")]
    #[test_case(serve("localhost", 4200, Some("/"), false, None), "http://localhost:4200" ; "root serve path")]
    #[test_case(serve("localhost", 8080, Some("app/"), true, None), "https://localhost:8080/app" ; "path without leading slash")]
    #[test_case(serve("localhost", 4200, None, false, Some("http://proxy.test/")), "http://proxy.test" ; "public host with scheme")]
    #[test_case(serve("127.0.0.1", 4200, None, false, Some("")), "http://127.0.0.1:4200" ; "empty public host ignored")]
    fn test_resolved_base_url(options: ServeOptions, expected: &str) {
        assert_eq!(ResolvedBaseUrl::from_serve_options(&options).as_str(), expected);
    }

    #[test]
    fn test_stage_result_from_exit() {
        assert!(StageResult::from_exit(StageName::Compile, Some(0)).success);

        let failed = StageResult::from_exit(StageName::Compile, Some(1));
        assert!(!failed.success);
        assert_eq!(failed.diagnostic.as_deref(), Some("compile exited with code 1"));

        let killed = StageResult::from_exit(StageName::Driver, None);
        assert!(!killed.success);
    }

    #[test]
    fn test_build_event_from_stage_result() {
        let event: BuildEvent = StageResult::failed(StageName::TestRun, "2 tests failed").into();
        assert!(!event.success);
        assert_eq!(event.error.as_deref(), Some("2 tests failed"));

        let json = serde_json::to_string(&BuildEvent::success()).unwrap();
        assert_eq!(json, r#"{"success":true}"#);
    }

    #[test]
    fn test_stage_name_display() {
        assert_eq!(StageName::DevServer.to_string(), "dev-server");
        assert_eq!(StageName::ALL.len(), 4);
    }
}
