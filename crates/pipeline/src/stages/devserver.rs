//! Dev-server stage
//!
//! Serving is delegated to a [`SubBuilder`]. The base URL is derived from the
//! validated serve options before the sub-build runs, because a serving
//! sub-build does not hand control back.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use nightrun_common::{Error, ResolvedBaseUrl, Result, ServeOptions, StageResult};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::supervisor::CommandSpec;

/// Stream of results from a running sub-build
pub type BuildEvents = BoxStream<'static, StageResult>;

/// Sub-build target in `project:task[:configuration]` form
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetRef {
    pub project: String,
    pub task: String,
    pub configuration: Option<String>,
}

impl FromStr for TargetRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let valid = |p: &&str| !p.trim().is_empty();

        match parts.as_slice() {
            [project, task] if valid(project) && valid(task) => Ok(Self {
                project: project.to_string(),
                task: task.to_string(),
                configuration: None,
            }),
            [project, task, configuration]
                if valid(project) && valid(task) && valid(configuration) =>
            {
                Ok(Self {
                    project: project.to_string(),
                    task: task.to_string(),
                    configuration: Some(configuration.to_string()),
                })
            }
            _ => Err(Error::InvalidTarget(s.to_string())),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project, self.task)?;
        if let Some(configuration) = &self.configuration {
            write!(f, ":{}", configuration)?;
        }
        Ok(())
    }
}

/// Options the pipeline forces onto the sub-build
#[derive(Debug, Clone, Copy, Default)]
pub struct ServeOverrides {
    pub watch: bool,
}

/// A resolved and validated sub-build configuration
#[derive(Debug, Clone)]
pub struct ServeTarget {
    pub target: TargetRef,
    pub options: ServeOptions,
    pub command: CommandSpec,
}

impl ServeTarget {
    pub fn base_url(&self) -> ResolvedBaseUrl {
        ResolvedBaseUrl::from_serve_options(&self.options)
    }
}

/// External build system that knows how to serve a target
#[async_trait]
pub trait SubBuilder: Send + Sync {
    /// Resolve the builder configuration for `target` and validate it
    async fn resolve(&self, target: &TargetRef, overrides: &ServeOverrides) -> Result<ServeTarget>;

    /// Run the sub-build; the stream yields one result per build
    async fn run(&self, target: &ServeTarget) -> Result<BuildEvents>;
}

/// Serves the application under test through a sub-builder
pub struct DevServerStage {
    builder: Arc<dyn SubBuilder>,
    target: TargetRef,
    watch: bool,
}

impl DevServerStage {
    pub fn new(builder: Arc<dyn SubBuilder>, target: TargetRef, watch: bool) -> Self {
        Self {
            builder,
            target,
            watch,
        }
    }

    /// Resolve the target, capture its base URL, then run it
    pub async fn start(&self) -> Result<DevServerRun> {
        let overrides = ServeOverrides { watch: self.watch };
        let resolved = self.builder.resolve(&self.target, &overrides).await?;
        let base_url = resolved.base_url();
        info!(dev_server = %self.target, "Serving at {}", base_url);

        let events = self.builder.run(&resolved).await?;
        Ok(DevServerRun { base_url, events })
    }
}

/// A running dev server
pub struct DevServerRun {
    pub base_url: ResolvedBaseUrl,
    events: BuildEvents,
}

impl DevServerRun {
    /// Next result; `None` once the sub-build ended
    pub async fn next_result(&mut self) -> Option<StageResult> {
        let result = self.events.next().await;
        if let Some(result) = &result {
            if !result.success {
                warn!(
                    "Dev server build failed: {}",
                    result.diagnostic.as_deref().unwrap_or("no diagnostic")
                );
            }
        }
        result
    }
}
