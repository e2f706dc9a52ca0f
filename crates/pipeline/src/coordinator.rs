//! Pipeline coordinator
//!
//! Sequences compile → (dev server) → driver → test run, each step waiting on
//! the previous stage's first result. One-shot runs produce exactly one
//! [`BuildEvent`]; watch runs produce one per compile cycle until the compiler
//! exits.

use futures::stream::BoxStream;
use futures::StreamExt;
use nightrun_common::{
    BuildEvent, CompilerConfig, DriverCyclePolicy, Error, PipelineOptions, ResolvedBaseUrl,
    Result, RunnerConfig, Settings, StageName, StageResult,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::slots::ProcessSlots;
use crate::stages::{
    CommandTestEngine, CompileStage, DevServerRun, DevServerStage, DriverRun, DriverStage,
    SubBuilder, TargetRef, TestEngine, TestRunStage,
};
use crate::supervisor::ExitInfo;
use crate::workspace::WorkspaceSubBuilder;

/// Drives one pipeline invocation
pub struct PipelineCoordinator {
    options: PipelineOptions,
    settings: Settings,
    slots: ProcessSlots,
    sub_builder: Option<Arc<dyn SubBuilder>>,
    test_engine: Option<Arc<dyn TestEngine>>,
    terminate_host: bool,
}

/// Stages resolved from the configs, before anything is spawned
struct Plan {
    compile: CompileStage,
    dev_server: Option<DevServerStage>,
    driver: DriverStage,
    test_run: TestRunStage,
    runner_config: RunnerConfig,
}

enum RunState {
    Idle(Box<PipelineCoordinator>),
    Running {
        rx: mpsc::UnboundedReceiver<BuildEvent>,
        exit_host: bool,
        last_success: bool,
    },
}

impl PipelineCoordinator {
    pub fn new(options: PipelineOptions, settings: Settings, slots: ProcessSlots) -> Self {
        Self {
            options,
            settings,
            slots,
            sub_builder: None,
            test_engine: None,
            terminate_host: false,
        }
    }

    /// Serve the dev-server target through `builder` instead of the workspace file
    pub fn with_sub_builder(mut self, builder: Arc<dyn SubBuilder>) -> Self {
        self.sub_builder = Some(builder);
        self
    }

    /// Run tests through `engine` instead of the test runner's CLI
    pub fn with_test_engine(mut self, engine: Arc<dyn TestEngine>) -> Self {
        self.test_engine = Some(engine);
        self
    }

    /// Exit the host process with 0/1 once a one-shot result has been consumed
    pub fn terminate_host_on_completion(mut self, enabled: bool) -> Self {
        self.terminate_host = enabled;
        self
    }

    /// Lazy stream of results. Nothing is spawned until the first poll.
    pub fn run(self) -> BoxStream<'static, BuildEvent> {
        futures::stream::unfold(RunState::Idle(Box::new(self)), |state| async move {
            let (mut rx, exit_host, last_success) = match state {
                RunState::Idle(coordinator) => {
                    let exit_host = coordinator.terminate_host && !coordinator.options.watch;
                    let (tx, rx) = mpsc::unbounded_channel();
                    tokio::spawn(coordinator.drive(tx));
                    (rx, exit_host, false)
                }
                RunState::Running {
                    rx,
                    exit_host,
                    last_success,
                } => (rx, exit_host, last_success),
            };

            let next = rx.recv().await;
            match next {
                Some(event) => {
                    let last_success = event.success;
                    Some((
                        event,
                        RunState::Running {
                            rx,
                            exit_host,
                            last_success,
                        },
                    ))
                }
                None if exit_host => {
                    let code = if last_success { 0 } else { 1 };
                    info!(code, "Pipeline complete, exiting");
                    std::process::exit(code)
                }
                None => None,
            }
        })
        .boxed()
    }

    async fn drive(self: Box<Self>, tx: mpsc::UnboundedSender<BuildEvent>) {
        info!(watch = self.options.watch, "Pipeline starting");

        if self.options.watch {
            if let Err(e) = self.watch(&tx).await {
                error!("Pipeline failed: {}", e);
                let _ = tx.send(BuildEvent::failure(e.to_string()));
            }
        } else {
            let event = match self.once().await {
                Ok(result) => {
                    if result.success {
                        info!("Pipeline succeeded");
                    } else {
                        warn!(
                            "Pipeline failed: {}",
                            result.diagnostic.as_deref().unwrap_or("tests failed")
                        );
                    }
                    BuildEvent::from(result)
                }
                Err(e) => {
                    error!("Pipeline failed: {}", e);
                    BuildEvent::failure(e.to_string())
                }
            };
            let _ = tx.send(event);
        }

        // The stream ends (and the host may exit) only after every subtree
        // has been stopped
        self.slots.shutdown().await;
        drop(tx);
    }

    /// Load every config and resolve every stage. Runs before any spawn, so a
    /// malformed file fails the pipeline with nothing started.
    fn plan(&self) -> Result<Plan> {
        let compiler_config = CompilerConfig::load(&self.options.compiler_config)?;
        let runner_config = RunnerConfig::load(&self.options.runner_config)?;
        debug!(
            out_dir = %compiler_config.out_dir.display(),
            driver_port = runner_config.driver_port(),
            "Configs loaded"
        );

        let dev_server = match &self.options.dev_server_target {
            Some(target) => {
                let target: TargetRef = target.parse()?;
                let builder: Arc<dyn SubBuilder> = match &self.sub_builder {
                    Some(builder) => builder.clone(),
                    None => Arc::new(WorkspaceSubBuilder::load(
                        &self.options.workspace,
                        self.slots.clone(),
                    )?),
                };
                Some(DevServerStage::new(builder, target, self.options.watch))
            }
            None => None,
        };

        let engine: Arc<dyn TestEngine> = match &self.test_engine {
            Some(engine) => engine.clone(),
            None => Arc::new(CommandTestEngine::new(
                self.settings.test_runner.clone(),
                self.slots.clone(),
            )),
        };

        Ok(Plan {
            compile: CompileStage::new(
                self.settings.compiler.clone(),
                compiler_config,
                self.options.watch,
            ),
            dev_server,
            driver: DriverStage::new(self.settings.driver.clone(), runner_config.driver_port()),
            test_run: TestRunStage::new(engine),
            runner_config,
        })
    }

    async fn once(&self) -> Result<StageResult> {
        let plan = self.plan()?;

        let mut compile = plan.compile.start(&self.slots).await?;
        ensure_success(StageName::Compile, compile.next_result().await)?;

        let dev_server = match &plan.dev_server {
            Some(stage) => Some(start_dev_server(stage).await?),
            None => None,
        };

        let mut driver = None;
        self.cycle(&plan, &mut driver, dev_server.as_ref().map(|run| &run.base_url))
            .await
    }

    async fn watch(&self, tx: &mpsc::UnboundedSender<BuildEvent>) -> Result<()> {
        let plan = self.plan()?;

        let mut compile = plan.compile.start(&self.slots).await?;
        let mut dev_server: Option<DevServerRun> = None;
        let mut dev_server_ended = false;
        let mut driver: Option<DriverRun> = None;

        loop {
            tokio::select! {
                result = compile.next_result() => {
                    let Some(result) = result else { break };
                    if compile.is_finished() {
                        if !result.success {
                            let _ = tx.send(BuildEvent::from(result));
                        }
                        info!("Compiler exited, stopping watch");
                        break;
                    }

                    // The dev server is started once, after the first compile
                    if dev_server.is_none() {
                        if let Some(stage) = &plan.dev_server {
                            dev_server = Some(start_dev_server(stage).await?);
                        }
                    }

                    let base_url = dev_server.as_ref().map(|run| &run.base_url);
                    let event = match self.cycle(&plan, &mut driver, base_url).await {
                        Ok(result) => {
                            if !result.success {
                                warn!(
                                    "Cycle failed: {}",
                                    result.diagnostic.as_deref().unwrap_or("tests failed")
                                );
                            }
                            BuildEvent::from(result)
                        }
                        Err(e) => {
                            warn!("Cycle failed: {}", e);
                            BuildEvent::failure(e.to_string())
                        }
                    };
                    if tx.send(event).is_err() {
                        debug!("Result stream dropped, stopping watch");
                        break;
                    }
                }
                Some(exit) = driver_exit(&mut driver),
                    if driver.as_ref().map_or(false, |run| !run.is_finished()) =>
                {
                    let err = Error::ProcessExit {
                        stage: StageName::Driver,
                        code: exit.code,
                    };
                    warn!("Driver exited between cycles: {}", err);
                    let _ = tx.send(BuildEvent::failure(err.to_string()));
                }
                result = dev_server_result(&mut dev_server),
                    if dev_server.is_some() && !dev_server_ended =>
                {
                    match result {
                        Some(result) if result.success => debug!("Dev server rebuilt"),
                        Some(result) => {
                            let _ = tx.send(BuildEvent::from(result));
                        }
                        None => dev_server_ended = true,
                    }
                }
            }
        }

        Ok(())
    }

    /// Driver (per cycle policy) then test run
    async fn cycle(
        &self,
        plan: &Plan,
        driver: &mut Option<DriverRun>,
        base_url: Option<&ResolvedBaseUrl>,
    ) -> Result<StageResult> {
        let reuse = self.settings.driver.cycle_policy == DriverCyclePolicy::Reuse
            && driver.is_some()
            && self.slots.is_live(StageName::Driver);

        if reuse {
            debug!("Reusing live driver");
        } else {
            let mut run = plan.driver.start(&self.slots)?;
            ensure_success(StageName::Driver, run.next_result().await)?;
            *driver = Some(run);
        }

        plan.test_run.run(&plan.runner_config, base_url).await
    }
}

async fn start_dev_server(stage: &DevServerStage) -> Result<DevServerRun> {
    let mut run = stage.start().await?;
    ensure_success(StageName::DevServer, run.next_result().await)?;
    Ok(run)
}

async fn driver_exit(driver: &mut Option<DriverRun>) -> Option<ExitInfo> {
    match driver {
        Some(run) => run.wait_exit().await,
        None => None,
    }
}

async fn dev_server_result(dev_server: &mut Option<DevServerRun>) -> Option<StageResult> {
    match dev_server {
        Some(run) => run.next_result().await,
        None => None,
    }
}

/// A stage's first result gates the next stage
fn ensure_success(stage: StageName, result: Option<StageResult>) -> Result<StageResult> {
    match result {
        Some(result) if result.success => Ok(result),
        Some(result) => Err(Error::StageFailed {
            stage,
            diagnostic: result
                .diagnostic
                .unwrap_or_else(|| "no diagnostic".to_string()),
        }),
        None => Err(Error::StageEnded(stage)),
    }
}
