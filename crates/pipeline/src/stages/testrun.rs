//! Test-run stage

use async_trait::async_trait;
use nightrun_common::config::TestRunnerSettings;
use nightrun_common::{ResolvedBaseUrl, Result, RunnerConfig, StageName, StageResult};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info};

use crate::slots::ProcessSlots;
use crate::supervisor::CommandSpec;

/// What the test engine is asked to run
#[derive(Debug, Clone)]
pub struct TestRunRequest {
    /// Runner config with driver auto-start already disabled
    pub config: RunnerConfig,
    pub base_url: Option<ResolvedBaseUrl>,
}

/// The test runner's execution engine
#[async_trait]
pub trait TestEngine: Send + Sync {
    async fn run(&self, request: TestRunRequest) -> Result<StageResult>;
}

/// Hands the resolved config and base URL to the test engine
pub struct TestRunStage {
    engine: Arc<dyn TestEngine>,
}

impl TestRunStage {
    pub fn new(engine: Arc<dyn TestEngine>) -> Self {
        Self { engine }
    }

    pub async fn run(
        &self,
        config: &RunnerConfig,
        base_url: Option<&ResolvedBaseUrl>,
    ) -> Result<StageResult> {
        let request = TestRunRequest {
            config: config.with_driver_autostart_disabled(),
            base_url: base_url.cloned(),
        };

        match &request.base_url {
            Some(url) => info!("Running tests against {}", url),
            None => info!("Running tests"),
        }

        self.engine.run(request).await
    }
}

/// Engine adapter that drives the test runner's CLI.
///
/// The effective config is written to a temporary file that lives until the
/// runner exits.
pub struct CommandTestEngine {
    settings: TestRunnerSettings,
    slots: ProcessSlots,
}

impl CommandTestEngine {
    pub fn new(settings: TestRunnerSettings, slots: ProcessSlots) -> Self {
        Self { settings, slots }
    }

    pub fn command(&self, config_path: &std::path::Path, base_url: Option<&ResolvedBaseUrl>) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.settings.program)
            .args(self.settings.args.iter().cloned())
            .arg("--config")
            .arg(config_path.to_string_lossy());

        if let Some(url) = base_url {
            spec = spec.arg("--launch-url").arg(url.as_str());
        }

        spec
    }
}

#[async_trait]
impl TestEngine for CommandTestEngine {
    async fn run(&self, request: TestRunRequest) -> Result<StageResult> {
        let mut config_file = tempfile::Builder::new()
            .prefix("nightrun-")
            .suffix(".json")
            .tempfile()?;
        serde_json::to_writer_pretty(&mut config_file, &request.config)?;
        config_file.flush()?;
        debug!("Effective runner config at {}", config_file.path().display());

        let spec = self.command(config_file.path(), request.base_url.as_ref());
        let mut events = self.slots.supersede(StageName::TestRun, &spec)?;

        let result = match events.wait_exit().await {
            Some(exit) => StageResult::from_exit(StageName::TestRun, exit.code),
            None => StageResult::failed(StageName::TestRun, "test runner vanished without an exit status"),
        };

        drop(config_file);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::OsLauncher;
    use nightrun_common::ServeOptions;
    use parking_lot::Mutex;
    use std::path::Path;

    struct RecordingEngine {
        requests: Mutex<Vec<TestRunRequest>>,
    }

    #[async_trait]
    impl TestEngine for RecordingEngine {
        async fn run(&self, request: TestRunRequest) -> Result<StageResult> {
            self.requests.lock().push(request);
            Ok(StageResult::ok(StageName::TestRun))
        }
    }

    fn runner_config(start_process: bool) -> RunnerConfig {
        serde_json::from_value(serde_json::json!({
            "src_folders": ["out-tsc/e2e"],
            "webdriver": { "start_process": start_process, "port": 9515 }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_stage_forces_autostart_off() {
        let engine = Arc::new(RecordingEngine {
            requests: Mutex::new(Vec::new()),
        });
        let stage = TestRunStage::new(engine.clone());
        let url = ResolvedBaseUrl::from_serve_options(&ServeOptions::default());

        let result = stage.run(&runner_config(true), Some(&url)).await.unwrap();
        assert!(result.success);

        let requests = engine.requests.lock();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].config.webdriver.start_process);
        assert_eq!(requests[0].base_url.as_ref().unwrap().as_str(), "http://localhost:4200");
    }

    #[test]
    fn test_command_engine_args() {
        let slots = ProcessSlots::new(Arc::new(OsLauncher::default()));
        let engine = CommandTestEngine::new(TestRunnerSettings::default(), slots);
        let url = ResolvedBaseUrl::from_serve_options(&ServeOptions::default());

        assert_eq!(
            engine.command(Path::new("/tmp/n.json"), Some(&url)).display(),
            "nightwatch --config /tmp/n.json --launch-url http://localhost:4200"
        );
        assert_eq!(
            engine.command(Path::new("/tmp/n.json"), None).display(),
            "nightwatch --config /tmp/n.json"
        );
    }

    #[tokio::test]
    async fn test_command_engine_reports_exit_and_writes_config() {
        let slots = ProcessSlots::new(Arc::new(OsLauncher::default()));
        // `sh -c <script> --config <file>`: the file path lands in $1
        let settings = TestRunnerSettings {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"grep -q '"start_process": false' "$1""#.to_string(),
            ],
        };
        let engine = CommandTestEngine::new(settings, slots);

        let request = TestRunRequest {
            config: runner_config(true).with_driver_autostart_disabled(),
            base_url: None,
        };
        assert!(engine.run(request).await.unwrap().success);

        let request = TestRunRequest {
            config: runner_config(true),
            base_url: None,
        };
        assert!(!engine.run(request).await.unwrap().success);
    }
}
