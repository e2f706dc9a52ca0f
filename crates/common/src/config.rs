//! Configuration resolution
//!
//! Three files feed a pipeline run:
//! - the compiler config (tsconfig-style JSON, comments allowed)
//! - the test-runner config (JSON, handed downstream with driver auto-start off)
//! - nightrun's own settings (`nightrun.toml`, optional)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Default driver port when the runner config does not name one
pub const DEFAULT_DRIVER_PORT: u16 = 4444;

/// Upper bound on `extends` chains in compiler configs
const MAX_EXTENDS_DEPTH: usize = 16;

// ============================================================================
// Compiler config
// ============================================================================

/// The parts of a compiler config the pipeline needs
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Path of the config file as given
    pub path: PathBuf,

    /// Output directory, resolved against the declaring config's directory
    pub out_dir: PathBuf,
}

impl CompilerConfig {
    /// Load a compiler config and resolve its output directory.
    ///
    /// `compilerOptions.outDir` is looked up along the `extends` chain;
    /// the nearest declaration wins.
    pub fn load(path: &Path) -> Result<Self> {
        let mut current = path.to_path_buf();

        for _ in 0..MAX_EXTENDS_DEPTH {
            let value = read_jsonc(&current)?;
            let base_dir = current.parent().map(Path::to_path_buf).unwrap_or_default();

            if let Some(out_dir) = value
                .pointer("/compilerOptions/outDir")
                .and_then(Value::as_str)
            {
                let out_dir = base_dir.join(out_dir);
                debug!("Resolved compiler outDir {:?} from {:?}", out_dir, current);
                return Ok(Self {
                    path: path.to_path_buf(),
                    out_dir,
                });
            }

            match value.get("extends").and_then(Value::as_str) {
                Some(parent) => {
                    current = if parent.ends_with(".json") {
                        base_dir.join(parent)
                    } else {
                        base_dir.join(format!("{}.json", parent))
                    };
                }
                None => break,
            }
        }

        Err(Error::config_parse(path, "compilerOptions.outDir is not set"))
    }
}

// ============================================================================
// Test-runner config
// ============================================================================

/// Test-runner configuration.
///
/// Only the fields the pipeline reads are typed; everything else is kept
/// verbatim so the config can be handed on unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub src_folders: Vec<String>,

    #[serde(default)]
    pub webdriver: WebdriverConfig,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebdriverConfig {
    #[serde(default = "default_driver_port")]
    pub port: u16,

    #[serde(default)]
    pub start_process: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_driver_port() -> u16 {
    DEFAULT_DRIVER_PORT
}

impl Default for WebdriverConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DRIVER_PORT,
            start_process: false,
            extra: Map::new(),
        }
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let value = read_jsonc(path)?;
        serde_json::from_value(value).map_err(|e| Error::config_parse(path, e))
    }

    /// Port the browser driver must listen on
    pub fn driver_port(&self) -> u16 {
        self.webdriver.port
    }

    /// Copy of this config with driver auto-start turned off.
    ///
    /// The pipeline owns the driver process, so the test runner must not
    /// start a second one.
    pub fn with_driver_autostart_disabled(&self) -> Self {
        let mut config = self.clone();
        config.webdriver.start_process = false;
        config
    }
}

// ============================================================================
// JSON with comments
// ============================================================================

/// Read a JSON file that may carry `//` and `/* */` comments and trailing commas
pub fn read_jsonc(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::config_parse(path, e))?;
    serde_json::from_str(&strip_jsonc(&content)).map_err(|e| Error::config_parse(path, e))
}

/// Strip comments and trailing commas, leaving string literals intact
pub fn strip_jsonc(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    let mut in_string = false;

    while let Some((i, c)) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if matches!(chars.peek(), Some((_, '/'))) => {
                for (_, next) in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                let mut prev = '\0';
                for (_, next) in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            ',' => {
                // Drop the comma if only whitespace/comments precede a closer
                let trimmed = strip_leading_trivia(&input[i + c.len_utf8()..]);
                if !(trimmed.starts_with('}') || trimmed.starts_with(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    out
}

fn strip_leading_trivia(mut s: &str) -> &str {
    loop {
        s = s.trim_start();
        if let Some(rest) = s.strip_prefix("//") {
            s = rest.find('\n').map_or("", |i| &rest[i..]);
        } else if let Some(rest) = s.strip_prefix("/*") {
            s = rest.find("*/").map_or("", |i| &rest[i + 2..]);
        } else {
            return s;
        }
    }
}

// ============================================================================
// nightrun settings
// ============================================================================

/// Tool-level settings loaded from `nightrun.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub compiler: CompilerSettings,
    pub driver: DriverSettings,
    pub test_runner: TestRunnerSettings,
    pub supervisor: SupervisorSettings,
}

/// How the compiler is invoked
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerSettings {
    /// Compiler executable
    pub program: String,

    /// Extra arguments placed before the project argument
    pub args: Vec<String>,

    /// Flag naming the config file
    pub project_arg: String,

    /// Flag enabling continuous compilation
    pub watch_arg: String,

    /// Output line that marks a finished watch-mode cycle
    pub cycle_marker: Option<String>,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            program: "tsc".to_string(),
            args: Vec::new(),
            project_arg: "-p".to_string(),
            watch_arg: "--watch".to_string(),
            cycle_marker: Some("Watching for file changes".to_string()),
        }
    }
}

/// What a watch-mode compile cycle does with a live driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverCyclePolicy {
    /// Supersede the live driver with a fresh one
    #[default]
    Restart,
    /// Keep a live driver; only respawn a dead one
    Reuse,
}

/// How the browser driver is invoked
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    pub program: String,
    pub args: Vec<String>,
    pub cycle_policy: DriverCyclePolicy,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            program: "chromedriver".to_string(),
            args: Vec::new(),
            cycle_policy: DriverCyclePolicy::default(),
        }
    }
}

/// How the test runner is invoked
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestRunnerSettings {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for TestRunnerSettings {
    fn default() -> Self {
        Self {
            program: "nightwatch".to_string(),
            args: Vec::new(),
        }
    }
}

/// Process supervision tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Time between SIGTERM and SIGKILL when terminating a process group
    pub grace_period_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: 2000,
        }
    }
}

impl Settings {
    /// Load settings from file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let settings: Self =
                toml::from_str(&content).map_err(|e| Error::config_parse(path, e))?;
            Ok(settings)
        } else {
            debug!("No settings file at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }
}
