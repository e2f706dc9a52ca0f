//! Workspace-file sub-builder
//!
//! Dev-server targets are declared in a JSON workspace file:
//!
//! ```json
//! { "projects": { "app": { "targets": { "serve": {
//!     "command": ["npm", "run", "start", "--"],
//!     "readyPattern": "compiled successfully",
//!     "watchArg": "--watch",
//!     "options": { "host": "localhost", "port": 4200 },
//!     "configurations": { "production": { "port": 8080 } } } } } } }
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use nightrun_common::config::read_jsonc;
use nightrun_common::{Error, Result, ServeOptions, StageName, StageResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::slots::ProcessSlots;
use crate::stages::devserver::{BuildEvents, ServeOverrides, ServeTarget, SubBuilder, TargetRef};
use crate::supervisor::{CommandSpec, IoMode, LineMarker, ProcessEvent, ProcessMessage};

#[derive(Debug, Clone, Default, Deserialize)]
struct WorkspaceFile {
    #[serde(default)]
    projects: BTreeMap<String, ProjectDef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ProjectDef {
    /// Working directory of the project's commands, relative to the workspace file
    #[serde(default)]
    root: Option<PathBuf>,

    #[serde(default)]
    targets: BTreeMap<String, TargetDef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetDef {
    #[serde(default)]
    command: Vec<String>,

    #[serde(default)]
    ready_pattern: Option<String>,

    #[serde(default)]
    watch_arg: Option<String>,

    #[serde(default)]
    options: Map<String, Value>,

    #[serde(default)]
    configurations: BTreeMap<String, Map<String, Value>>,
}

/// One declared target, for listings
#[derive(Debug, Clone, Serialize)]
pub struct TargetSummary {
    pub target: String,
    pub configurations: Vec<String>,
    pub command: String,
}

/// Sub-builder that serves targets declared in a workspace file
pub struct WorkspaceSubBuilder {
    base_dir: PathBuf,
    workspace: WorkspaceFile,
    slots: ProcessSlots,
}

impl WorkspaceSubBuilder {
    /// Load the workspace file at `path`
    pub fn load(path: &Path, slots: ProcessSlots) -> Result<Self> {
        let value = read_jsonc(path)?;
        let workspace: WorkspaceFile =
            serde_json::from_value(value).map_err(|e| Error::config_parse(path, e))?;
        debug!("Loaded {} project(s) from {}", workspace.projects.len(), path.display());

        Ok(Self {
            base_dir: path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
            workspace,
            slots,
        })
    }

    /// Every `project:task` the workspace declares
    pub fn list_targets(&self) -> Vec<TargetSummary> {
        self.workspace
            .projects
            .iter()
            .flat_map(|(project, def)| {
                def.targets.iter().map(move |(task, target)| TargetSummary {
                    target: format!("{}:{}", project, task),
                    configurations: target.configurations.keys().cloned().collect(),
                    command: target.command.join(" "),
                })
            })
            .collect()
    }

    fn lookup(&self, target: &TargetRef) -> Result<(&ProjectDef, &TargetDef)> {
        let project = self
            .workspace
            .projects
            .get(&target.project)
            .ok_or_else(|| Error::TargetNotFound(target.to_string()))?;
        let def = project
            .targets
            .get(&target.task)
            .ok_or_else(|| Error::TargetNotFound(target.to_string()))?;
        Ok((project, def))
    }
}

/// Overlay the configuration's options on the base options
fn merge_options(def: &TargetDef, target: &TargetRef) -> Result<Map<String, Value>> {
    let mut options = def.options.clone();

    if let Some(name) = &target.configuration {
        let overlay = def
            .configurations
            .get(name)
            .ok_or_else(|| Error::TargetNotFound(target.to_string()))?;
        for (key, value) in overlay {
            options.insert(key.clone(), value.clone());
        }
    }

    Ok(options)
}

fn validate(target: &TargetRef, def: &TargetDef, options: &ServeOptions) -> Result<Option<Regex>> {
    let invalid = |reason: &str| Error::InvalidServeOptions {
        target: target.to_string(),
        reason: reason.to_string(),
    };

    if def.command.is_empty() {
        return Err(invalid("command is empty"));
    }
    if options.host.trim().is_empty() {
        return Err(invalid("host is empty"));
    }
    if options.port == 0 {
        return Err(invalid("port must be non-zero"));
    }

    def.ready_pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| invalid(&format!("readyPattern: {}", e)))
}

#[async_trait]
impl SubBuilder for WorkspaceSubBuilder {
    async fn resolve(&self, target: &TargetRef, overrides: &ServeOverrides) -> Result<ServeTarget> {
        let (project, def) = self.lookup(target)?;

        let merged = merge_options(def, target)?;
        let mut options: ServeOptions = serde_json::from_value(Value::Object(merged)).map_err(|e| {
            Error::InvalidServeOptions {
                target: target.to_string(),
                reason: e.to_string(),
            }
        })?;
        options.watch = overrides.watch;

        let ready = validate(target, def, &options)?;

        let mut command = CommandSpec::new(&def.command[0])
            .args(def.command[1..].iter().cloned())
            .current_dir(match &project.root {
                Some(root) => self.base_dir.join(root),
                None => self.base_dir.clone(),
            })
            .env("NIGHTRUN_HOST", &options.host)
            .env("NIGHTRUN_PORT", options.port.to_string())
            .env("NIGHTRUN_SERVE_PATH", options.serve_path.clone().unwrap_or_default())
            .env("NIGHTRUN_SSL", options.ssl.to_string())
            .env("NIGHTRUN_WATCH", options.watch.to_string())
            .io(IoMode::Messages {
                markers: ready
                    .into_iter()
                    .map(|pattern| LineMarker::new(pattern, ProcessMessage::Ready))
                    .collect(),
            });

        if options.watch {
            if let Some(watch_arg) = &def.watch_arg {
                command = command.arg(watch_arg);
            }
        }

        Ok(ServeTarget {
            target: target.clone(),
            options,
            command,
        })
    }

    async fn run(&self, target: &ServeTarget) -> Result<BuildEvents> {
        let waits_for_ready = matches!(
            &target.command.io,
            IoMode::Messages { markers } if !markers.is_empty()
        );

        info!(dev_server = %target.target, "Starting: {}", target.command.display());
        let events = self.slots.supersede(StageName::DevServer, &target.command)?;

        // Without a ready pattern the server counts as up once spawned
        let announce = (!waits_for_ready).then(|| StageResult::ok(StageName::DevServer));

        let lifecycle = futures::stream::unfold(Some(events), |state| async move {
            let mut events = match state {
                Some(events) => events,
                None => return None,
            };
            loop {
                let event = events.next().await;
                match event {
                    None => return None,
                    Some(ProcessEvent::Message(ProcessMessage::Ready)) => {
                        return Some((StageResult::ok(StageName::DevServer), Some(events)));
                    }
                    Some(ProcessEvent::Message(_)) => continue,
                    Some(ProcessEvent::Exit(exit)) => {
                        let diagnostic = match exit.code {
                            Some(code) => format!("dev server exited with code {}", code),
                            None => "dev server was terminated by a signal".to_string(),
                        };
                        return Some((StageResult::failed(StageName::DevServer, diagnostic), None));
                    }
                }
            }
        });

        Ok(futures::stream::iter(announce).chain(lifecycle).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::OsLauncher;
    use std::sync::Arc;
    use tempfile::TempDir;

    const WORKSPACE: &str = r#"{
        // dev-server targets
        "projects": {
            "app": {
                "targets": {
                    "serve": {
                        "command": ["sh", "-c", "echo booting; echo 'compiled successfully'; sleep 30"],
                        "readyPattern": "compiled successfully",
                        "watchArg": "--watch",
                        "options": { "host": "localhost", "port": 4200, "servePath": "/app" },
                        "configurations": {
                            "production": { "port": 8080, "ssl": true, "publicHost": "example.com" }
                        }
                    },
                    "broken": {
                        "command": ["sh", "-c", "exit 7"],
                        "readyPattern": "never printed"
                    },
                    "bad-port": {
                        "command": ["true"],
                        "options": { "port": 0 }
                    }
                }
            }
        }
    }"#;

    fn builder(dir: &TempDir) -> WorkspaceSubBuilder {
        let path = dir.path().join("nightrun.workspace.json");
        std::fs::write(&path, WORKSPACE).unwrap();
        let slots = ProcessSlots::new(Arc::new(OsLauncher::default()));
        WorkspaceSubBuilder::load(&path, slots).unwrap()
    }

    #[test]
    fn test_list_targets() {
        let dir = TempDir::new().unwrap();
        let targets = builder(&dir).list_targets();

        let names: Vec<_> = targets.iter().map(|t| t.target.as_str()).collect();
        assert_eq!(names, vec!["app:bad-port", "app:broken", "app:serve"]);
        assert_eq!(targets[2].configurations, vec!["production".to_string()]);
    }

    #[tokio::test]
    async fn test_resolve_merges_configuration() {
        let dir = TempDir::new().unwrap();
        let builder = builder(&dir);

        let base = builder
            .resolve(&"app:serve".parse().unwrap(), &ServeOverrides { watch: false })
            .await
            .unwrap();
        assert_eq!(base.base_url().as_str(), "http://localhost:4200/app");
        assert!(!base.command.args.contains(&"--watch".to_string()));

        let production = builder
            .resolve(&"app:serve:production".parse().unwrap(), &ServeOverrides { watch: true })
            .await
            .unwrap();
        assert_eq!(production.options.port, 8080);
        assert!(production.options.watch);
        assert_eq!(production.base_url().as_str(), "https://example.com");
        assert_eq!(production.command.args.last().map(String::as_str), Some("--watch"));
        assert!(production
            .command
            .envs
            .contains(&("NIGHTRUN_WATCH".to_string(), "true".to_string())));
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let dir = TempDir::new().unwrap();
        let builder = builder(&dir);
        let overrides = ServeOverrides::default();

        assert!(matches!(
            builder.resolve(&"web:serve".parse().unwrap(), &overrides).await,
            Err(Error::TargetNotFound(_))
        ));
        assert!(matches!(
            builder.resolve(&"app:serve:staging".parse().unwrap(), &overrides).await,
            Err(Error::TargetNotFound(_))
        ));
        assert!(matches!(
            builder.resolve(&"app:bad-port".parse().unwrap(), &overrides).await,
            Err(Error::InvalidServeOptions { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_waits_for_ready() {
        let dir = TempDir::new().unwrap();
        let builder = builder(&dir);
        let target = builder
            .resolve(&"app:serve".parse().unwrap(), &ServeOverrides::default())
            .await
            .unwrap();

        let mut events = builder.run(&target).await.unwrap();
        assert!(events.next().await.unwrap().success);
        assert!(builder.slots.is_live(StageName::DevServer));

        builder.slots.shutdown().await;
        let exit = events.next().await.unwrap();
        assert!(!exit.success);
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_run_exit_before_ready_fails() {
        let dir = TempDir::new().unwrap();
        let builder = builder(&dir);
        let target = builder
            .resolve(&"app:broken".parse().unwrap(), &ServeOverrides::default())
            .await
            .unwrap();

        let mut events = builder.run(&target).await.unwrap();
        let first = events.next().await.unwrap();
        assert!(!first.success);
        assert_eq!(first.diagnostic.as_deref(), Some("dev server exited with code 7"));
    }
}
