//! Pipeline stages: compile, serve, drive, test

pub mod compile;
pub mod devserver;
pub mod driver;
pub mod testrun;

pub use compile::{clear_output_dir, CompileRun, CompileStage};
pub use devserver::{
    BuildEvents, DevServerRun, DevServerStage, ServeOverrides, ServeTarget, SubBuilder, TargetRef,
};
pub use driver::{DriverRun, DriverStage};
pub use testrun::{CommandTestEngine, TestEngine, TestRunRequest, TestRunStage};
