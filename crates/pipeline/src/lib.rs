//! nightrun pipeline
//!
//! Process supervision and the compile → serve → drive → test pipeline.
//!
//! ```ignore
//! let slots = ProcessSlots::new(Arc::new(OsLauncher::default()));
//! let mut events = PipelineCoordinator::new(options, settings, slots).run();
//! while let Some(event) = events.next().await {
//!     println!("{}", event.success);
//! }
//! ```

pub mod coordinator;
pub mod slots;
pub mod stages;
pub mod supervisor;
pub mod workspace;

pub use coordinator::PipelineCoordinator;
pub use slots::ProcessSlots;
pub use stages::{SubBuilder, TargetRef, TestEngine, TestRunRequest};
pub use supervisor::{CommandSpec, OsLauncher, ProcessLauncher, SupervisedProcess};
pub use workspace::{TargetSummary, WorkspaceSubBuilder};
