//! Compile stage
//!
//! One-shot: run the compiler once and report its exit code.
//! Watch: run the compiler continuously and report every finished cycle as a
//! success. Diagnostics are printed by the compiler itself and not parsed, so a
//! cycle with type errors still counts as complete.

use nightrun_common::config::CompilerSettings;
use nightrun_common::{CompilerConfig, Error, Result, StageName, StageResult};
use regex::Regex;
use std::path::Path;
use tracing::{debug, info};

use crate::slots::ProcessSlots;
use crate::supervisor::{CommandSpec, IoMode, LineMarker, ProcessEvent, ProcessEvents, ProcessMessage};

/// Runs the compiler against one config
pub struct CompileStage {
    settings: CompilerSettings,
    config: CompilerConfig,
    watch: bool,
}

impl CompileStage {
    pub fn new(settings: CompilerSettings, config: CompilerConfig, watch: bool) -> Self {
        Self {
            settings,
            config,
            watch,
        }
    }

    /// Compiler invocation for the current mode
    pub fn command(&self) -> Result<CommandSpec> {
        let mut spec = CommandSpec::new(&self.settings.program)
            .args(self.settings.args.iter().cloned())
            .arg(&self.settings.project_arg)
            .arg(self.config.path.to_string_lossy());

        if self.watch {
            let markers = match &self.settings.cycle_marker {
                Some(pattern) => {
                    let pattern = Regex::new(pattern).map_err(|e| {
                        Error::InvalidConfig(format!("compiler cycle_marker: {}", e))
                    })?;
                    vec![LineMarker::new(pattern, ProcessMessage::BuildComplete)]
                }
                None => Vec::new(),
            };
            spec = spec.arg(&self.settings.watch_arg).io(IoMode::Messages { markers });
        }

        Ok(spec)
    }

    /// Clear the output directory, then start the compiler.
    ///
    /// A compiler still running from an earlier start is terminated first.
    pub async fn start(&self, slots: &ProcessSlots) -> Result<CompileRun> {
        let spec = self.command()?;
        clear_output_dir(&self.config.out_dir).await?;

        info!(watch = self.watch, "Compiling {}", self.config.path.display());
        let events = slots.supersede(StageName::Compile, &spec)?;

        Ok(CompileRun {
            watch: self.watch,
            events,
            finished: false,
        })
    }
}

/// A running compiler's stream of results
pub struct CompileRun {
    watch: bool,
    events: ProcessEvents,
    finished: bool,
}

impl CompileRun {
    /// Next result; `None` once the stage is terminal
    pub async fn next_result(&mut self) -> Option<StageResult> {
        if self.finished {
            return None;
        }

        while let Some(event) = self.events.next().await {
            match event {
                ProcessEvent::Message(ProcessMessage::BuildComplete) if self.watch => {
                    debug!("Compile cycle complete");
                    return Some(StageResult::ok(StageName::Compile));
                }
                ProcessEvent::Message(message) => {
                    debug!(?message, "Ignoring compiler message");
                }
                ProcessEvent::Exit(exit) => {
                    self.finished = true;
                    return Some(StageResult::from_exit(StageName::Compile, exit.code));
                }
            }
        }

        self.finished = true;
        None
    }

    /// Whether no further results will come
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Remove stale build output and recreate the directory
pub async fn clear_output_dir(dir: &Path) -> Result<()> {
    if tokio::fs::try_exists(dir).await? {
        debug!("Removing {}", dir.display());
        tokio::fs::remove_dir_all(dir).await?;
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::OsLauncher;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn stage(program: &str, args: &[&str], out_dir: PathBuf, watch: bool) -> CompileStage {
        let settings = CompilerSettings {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..CompilerSettings::default()
        };
        let config = CompilerConfig {
            path: PathBuf::from("tsconfig.e2e.json"),
            out_dir,
        };
        CompileStage::new(settings, config, watch)
    }

    fn slots() -> ProcessSlots {
        ProcessSlots::new(Arc::new(OsLauncher::default()))
    }

    #[test]
    fn test_command_one_shot_and_watch() {
        let one_shot = stage("tsc", &[], PathBuf::from("out"), false).command().unwrap();
        assert_eq!(one_shot.display(), "tsc -p tsconfig.e2e.json");
        assert!(matches!(one_shot.io, IoMode::Inherit));

        let watch = stage("tsc", &[], PathBuf::from("out"), true).command().unwrap();
        assert_eq!(watch.display(), "tsc -p tsconfig.e2e.json --watch");
        assert!(matches!(watch.io, IoMode::Messages { ref markers } if markers.len() == 1));
    }

    #[tokio::test]
    async fn test_clear_output_dir() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out-tsc");
        std::fs::create_dir_all(out.join("nested")).unwrap();
        std::fs::write(out.join("nested/stale.js"), "old").unwrap();

        clear_output_dir(&out).await.unwrap();
        assert!(out.exists());
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);

        let fresh = dir.path().join("fresh");
        clear_output_dir(&fresh).await.unwrap();
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_one_shot_failure_is_terminal() {
        let dir = TempDir::new().unwrap();
        // `sh -c 'exit 1' -p tsconfig.e2e.json`: extra args land in $0/$1
        let stage = stage("sh", &["-c", "exit 1"], dir.path().join("out"), false);
        let slots = slots();

        let mut run = stage.start(&slots).await.unwrap();
        let result = run.next_result().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.stage, StageName::Compile);
        assert!(run.is_finished());
        assert!(run.next_result().await.is_none());
    }

    #[tokio::test]
    async fn test_one_shot_success() {
        let dir = TempDir::new().unwrap();
        let stage = stage("sh", &["-c", "exit 0"], dir.path().join("out"), false);

        let mut run = stage.start(&slots()).await.unwrap();
        assert!(run.next_result().await.unwrap().success);
    }

    #[tokio::test]
    async fn test_watch_emits_per_cycle() {
        let dir = TempDir::new().unwrap();
        let script = r#"echo '{"type":"build-complete"}'; echo 'error TS2304'; echo 'Found 1 error. Watching for file changes.'; exit 0"#;
        let stage = stage("sh", &["-c", script], dir.path().join("out"), true);

        let mut run = stage.start(&slots()).await.unwrap();
        assert!(run.next_result().await.unwrap().success);
        // A cycle with errors still counts as complete
        assert!(run.next_result().await.unwrap().success);
        assert!(!run.is_finished());
        // Compiler exit ends the stage
        assert!(run.next_result().await.unwrap().success);
        assert!(run.is_finished());
    }
}
