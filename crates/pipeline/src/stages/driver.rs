//! Browser driver stage

use nightrun_common::config::DriverSettings;
use nightrun_common::{Result, StageName, StageResult};
use tracing::info;

use crate::slots::ProcessSlots;
use crate::supervisor::{CommandSpec, ExitInfo, ProcessEvents};

/// Starts the browser-automation driver on the runner's configured port
pub struct DriverStage {
    settings: DriverSettings,
    port: u16,
}

impl DriverStage {
    pub fn new(settings: DriverSettings, port: u16) -> Self {
        Self { settings, port }
    }

    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.settings.program)
            .args(self.settings.args.iter().cloned())
            .arg("--port")
            .arg(self.port.to_string())
    }

    /// Spawn the driver, superseding any driver still running
    pub fn start(&self, slots: &ProcessSlots) -> Result<DriverRun> {
        info!(port = self.port, "Starting {}", self.settings.program);
        let events = slots.supersede(StageName::Driver, &self.command())?;

        Ok(DriverRun {
            events,
            announced: false,
            finished: false,
        })
    }
}

/// A running driver's results: an immediate success, then its exit
pub struct DriverRun {
    events: ProcessEvents,
    announced: bool,
    finished: bool,
}

impl DriverRun {
    /// The driver runs until killed, so the first result is optimistic and
    /// arrives right after spawn; the second mirrors its exit code.
    pub async fn next_result(&mut self) -> Option<StageResult> {
        if !self.announced {
            self.announced = true;
            return Some(StageResult::ok(StageName::Driver));
        }
        self.wait_exit()
            .await
            .map(|exit| StageResult::from_exit(StageName::Driver, exit.code))
    }

    /// Wait for the driver to exit; `None` if its exit was already consumed
    pub async fn wait_exit(&mut self) -> Option<ExitInfo> {
        if self.finished {
            return None;
        }

        let exit = self.events.wait_exit().await;
        self.finished = true;
        exit
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}
