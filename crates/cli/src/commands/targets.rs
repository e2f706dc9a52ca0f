//! `nightrun targets`: dev-server targets declared in the workspace file

use anyhow::{Context, Result};
use clap::Args;
use nightrun_common::DEFAULT_WORKSPACE_FILE;
use nightrun_pipeline::{OsLauncher, ProcessSlots, TargetSummary, WorkspaceSubBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::output::{print_list, OutputFormat, TableDisplay};

#[derive(Args, Debug)]
pub struct TargetsArgs {
    /// Workspace file declaring dev-server targets
    #[arg(long, env = "NIGHTRUN_WORKSPACE", default_value = DEFAULT_WORKSPACE_FILE)]
    pub workspace: PathBuf,
}

impl TableDisplay for TargetSummary {
    fn headers() -> Vec<&'static str> {
        vec!["Target", "Configurations", "Command"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.target.clone(),
            if self.configurations.is_empty() {
                "-".to_string()
            } else {
                self.configurations.join(", ")
            },
            self.command.clone(),
        ]
    }
}

/// Load a workspace file for inspection; nothing gets spawned through it
pub fn load_workspace(path: &Path) -> Result<WorkspaceSubBuilder> {
    let slots = ProcessSlots::new(Arc::new(OsLauncher::default()));
    WorkspaceSubBuilder::load(path, slots).with_context(|| format!("loading workspace {}", path.display()))
}

pub fn execute(args: TargetsArgs, format: OutputFormat) -> Result<()> {
    let workspace = load_workspace(&args.workspace)?;
    print_list(&workspace.list_targets(), format);
    Ok(())
}
