//! Process slot arena
//!
//! One slot per stage, each holding at most one supervised process. Starting
//! a process for an occupied slot goes through [`ProcessSlots::supersede`],
//! which terminates the previous occupant's subtree first.

use nightrun_common::{Result, StageName};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::supervisor::{CommandSpec, ProcessEvents, ProcessLauncher, SupervisedProcess};

/// How often `shutdown` checks whether the terminated groups are gone
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Stage-indexed registry of supervised processes
#[derive(Clone)]
pub struct ProcessSlots {
    launcher: Arc<dyn ProcessLauncher>,
    slots: Arc<RwLock<HashMap<StageName, SupervisedProcess>>>,
}

impl ProcessSlots {
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            launcher,
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replace the slot's occupant with a freshly spawned `spec`.
    ///
    /// The previous occupant's subtree is terminated before the spawn, even
    /// when its leader already exited. A failed termination is logged and
    /// does not block the replacement.
    pub fn supersede(&self, stage: StageName, spec: &CommandSpec) -> Result<ProcessEvents> {
        let previous = self.slots.write().remove(&stage);
        if let Some(old) = previous {
            self.signal(&old);
            self.escalate_later(old);
        }

        let (process, events) = self.launcher.launch(stage, spec)?;
        self.slots.write().insert(stage, process);
        Ok(events)
    }

    /// Whether the slot holds a process that has not exited
    pub fn is_live(&self, stage: StageName) -> bool {
        self.slots
            .read()
            .get(&stage)
            .map_or(false, SupervisedProcess::is_alive)
    }

    /// Pid of the slot's occupant, live or not
    pub fn pid(&self, stage: StageName) -> Option<u32> {
        self.slots.read().get(&stage).map(SupervisedProcess::pid)
    }

    /// Terminate the slot occupant's subtree and empty the slot
    pub fn terminate(&self, stage: StageName) {
        let occupant = self.slots.write().remove(&stage);
        if let Some(process) = occupant {
            self.signal(&process);
            self.escalate_later(process);
        }
    }

    /// Terminate every slot and wait for the subtrees to go away.
    ///
    /// Subtrees still running after the launcher's grace period are killed.
    /// Returns only once every signal has been sent, so the host may exit
    /// right after.
    pub async fn shutdown(&self) {
        let occupants: Vec<SupervisedProcess> = {
            let mut slots = self.slots.write();
            StageName::ALL
                .iter()
                .filter_map(|stage| slots.remove(stage))
                .collect()
        };
        for process in &occupants {
            self.signal(process);
        }

        let deadline = Instant::now() + self.launcher.grace_period();
        let mut remaining = occupants;
        loop {
            remaining.retain(|process| self.launcher.is_running(process));
            if remaining.is_empty() {
                debug!("All process groups stopped");
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        for process in &remaining {
            kill(self.launcher.as_ref(), process);
        }
    }

    /// Signal the subtree; a leader that already exited may have left
    /// helpers in its group
    fn signal(&self, process: &SupervisedProcess) {
        let stage = process.stage();
        if process.is_alive() {
            info!(stage = %stage, pid = process.pid(), "Terminating process");
        } else {
            debug!(stage = %stage, pid = process.pid(), "Leader already exited, signalling its group");
        }
        if let Err(e) = self.launcher.terminate(process) {
            warn!(stage = %stage, "{}", e);
        }
    }

    /// Kill the subtree in the background if it outlives the grace period
    fn escalate_later(&self, process: SupervisedProcess) {
        let launcher = self.launcher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(launcher.grace_period()).await;
            if launcher.is_running(&process) {
                kill(launcher.as_ref(), &process);
            }
        });
    }

    pub fn launcher(&self) -> &Arc<dyn ProcessLauncher> {
        &self.launcher
    }
}

fn kill(launcher: &dyn ProcessLauncher, process: &SupervisedProcess) {
    warn!(
        stage = %process.stage(),
        pid = process.pid(),
        "Still running after {:?}, killing",
        launcher.grace_period()
    );
    if let Err(e) = launcher.kill(process) {
        warn!(stage = %process.stage(), "{}", e);
    }
}
