//! `nightrun run`: the compile → serve → drive → test pipeline

use anyhow::{Context, Result};
use clap::Args;
use futures::StreamExt;
use nightrun_common::{
    BuildEvent, DriverCyclePolicy, PipelineOptions, Settings, DEFAULT_SETTINGS_FILE,
    DEFAULT_WORKSPACE_FILE,
};
use nightrun_pipeline::{OsLauncher, PipelineCoordinator, ProcessSlots};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::output::{print_error, print_success};

/// Exit code after an interrupt
const INTERRUPTED: i32 = 130;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Compiler config for the e2e sources
    #[arg(long, env = "NIGHTRUN_COMPILER_CONFIG")]
    pub compiler_config: PathBuf,

    /// Test-runner config
    #[arg(long, env = "NIGHTRUN_RUNNER_CONFIG")]
    pub runner_config: PathBuf,

    /// Dev-server target (project:task[:configuration])
    #[arg(long, env = "NIGHTRUN_DEV_SERVER")]
    pub dev_server: Option<String>,

    /// Re-run on every compile cycle
    #[arg(short, long)]
    pub watch: bool,

    /// Workspace file declaring dev-server targets
    #[arg(long, env = "NIGHTRUN_WORKSPACE", default_value = DEFAULT_WORKSPACE_FILE)]
    pub workspace: PathBuf,

    /// Settings file
    #[arg(long, env = "NIGHTRUN_SETTINGS", default_value = DEFAULT_SETTINGS_FILE)]
    pub settings: PathBuf,

    /// Compiler executable (overrides settings)
    #[arg(long)]
    pub compiler: Option<String>,

    /// Browser driver executable (overrides settings)
    #[arg(long)]
    pub driver: Option<String>,

    /// Test-runner executable (overrides settings)
    #[arg(long)]
    pub test_runner: Option<String>,

    /// Keep a live driver across watch cycles
    #[arg(long)]
    pub reuse_driver: bool,

    /// Milliseconds between SIGTERM and SIGKILL (overrides settings)
    #[arg(long)]
    pub grace_period_ms: Option<u64>,
}

impl RunArgs {
    /// Settings file with the command-line overrides applied
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::load(&self.settings)
            .with_context(|| format!("loading {}", self.settings.display()))?;

        if let Some(program) = &self.compiler {
            settings.compiler.program = program.clone();
        }
        if let Some(program) = &self.driver {
            settings.driver.program = program.clone();
        }
        if let Some(program) = &self.test_runner {
            settings.test_runner.program = program.clone();
        }
        if self.reuse_driver {
            settings.driver.cycle_policy = DriverCyclePolicy::Reuse;
        }
        if let Some(ms) = self.grace_period_ms {
            settings.supervisor.grace_period_ms = ms;
        }

        Ok(settings)
    }

    pub fn options(&self) -> PipelineOptions {
        let options = PipelineOptions::new(&self.compiler_config, &self.runner_config)
            .with_workspace(&self.workspace)
            .with_watch(self.watch);

        match &self.dev_server {
            Some(target) => options.with_dev_server(target),
            None => options,
        }
    }
}

/// Run the pipeline; returns whether the last result was a success.
///
/// One-shot runs exit the process from inside the result stream once the
/// result has been printed.
pub async fn execute(args: RunArgs) -> Result<bool> {
    let settings = args.settings()?;
    debug!(?settings, "Effective settings");

    let grace_period = Duration::from_millis(settings.supervisor.grace_period_ms);
    let slots = ProcessSlots::new(Arc::new(OsLauncher::new(grace_period)));

    let mut events = PipelineCoordinator::new(args.options(), settings, slots.clone())
        .terminate_host_on_completion(!args.watch)
        .run();

    let mut last_success = false;
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    report(&event);
                    last_success = event.success;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping child processes");
                slots.shutdown().await;
                std::process::exit(INTERRUPTED);
            }
        }
    }

    Ok(last_success)
}

fn report(event: &BuildEvent) {
    if event.success {
        print_success("e2e run passed");
    } else {
        print_error(&format!(
            "e2e run failed: {}",
            event.error.as_deref().unwrap_or("unknown error")
        ));
    }
}
