//! `nightrun check`: parse the configs without starting anything

use anyhow::Result;
use clap::Args;
use nightrun_common::{CompilerConfig, RunnerConfig};
use serde::Serialize;
use std::path::PathBuf;

use crate::output::{print_item, print_success, OutputFormat, TableDisplay};

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Compiler config for the e2e sources
    #[arg(long, env = "NIGHTRUN_COMPILER_CONFIG")]
    pub compiler_config: PathBuf,

    /// Test-runner config
    #[arg(long, env = "NIGHTRUN_RUNNER_CONFIG")]
    pub runner_config: PathBuf,
}

/// What the pipeline would use from the two configs
#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub out_dir: PathBuf,
    pub driver_port: u16,
    pub driver_autostart: bool,
    pub src_folders: Vec<String>,
}

impl ConfigSummary {
    pub fn new(compiler: &CompilerConfig, runner: &RunnerConfig) -> Self {
        Self {
            out_dir: compiler.out_dir.clone(),
            driver_port: runner.driver_port(),
            driver_autostart: runner.webdriver.start_process,
            src_folders: runner.src_folders.clone(),
        }
    }
}

impl TableDisplay for ConfigSummary {
    fn headers() -> Vec<&'static str> {
        vec!["Output dir", "Driver port", "Driver autostart", "Source folders"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.out_dir.display().to_string(),
            self.driver_port.to_string(),
            // The pipeline always turns this off before the test run
            format!("{} (disabled at run time)", self.driver_autostart),
            self.src_folders.join(", "),
        ]
    }
}

pub fn execute(args: CheckArgs, format: OutputFormat) -> Result<()> {
    let compiler = CompilerConfig::load(&args.compiler_config)?;
    let runner = RunnerConfig::load(&args.runner_config)?;

    print_item(&ConfigSummary::new(&compiler, &runner), format);
    if format == OutputFormat::Table {
        print_success("configs are valid");
    }
    Ok(())
}
