//! `nightrun resolve-url`: the base URL tests would run against

use anyhow::{Context, Result};
use clap::Args;
use nightrun_common::DEFAULT_WORKSPACE_FILE;
use nightrun_pipeline::stages::ServeOverrides;
use nightrun_pipeline::{SubBuilder, TargetRef};
use std::path::PathBuf;

use super::targets::load_workspace;
use crate::output::{print_value, OutputFormat};

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Dev-server target (project:task[:configuration])
    pub target: String,

    /// Workspace file declaring dev-server targets
    #[arg(long, env = "NIGHTRUN_WORKSPACE", default_value = DEFAULT_WORKSPACE_FILE)]
    pub workspace: PathBuf,
}

pub async fn execute(args: ResolveArgs, format: OutputFormat) -> Result<()> {
    let target: TargetRef = args.target.parse()?;
    let workspace = load_workspace(&args.workspace)?;

    let resolved = workspace
        .resolve(&target, &ServeOverrides::default())
        .await
        .with_context(|| format!("resolving {}", target))?;
    let base_url = resolved.base_url();

    print_value("base_url", &base_url.as_str(), base_url.as_str(), format);
    Ok(())
}
