// ABOUTME: Switchover protocol module: change capture, convergence, cutover
// ABOUTME: Holds the cluster lock id, state machine values, and the done sentinel

pub mod changelog;
pub mod cutover;
pub mod engine;
pub mod initial;
pub mod sync;
pub mod tracker;

use std::fmt;
use std::str::FromStr;

use anyhow::bail;

pub use engine::Switchover;
pub use tracker::RowTracker;

/// Advisory lock id guarding the cutover critical section, cluster-wide.
pub const GLOBAL_SWITCHOVER_LOCK: i64 = 0x5357_4442;

/// The single-row state machine in the source's `switchover_state` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchoverState {
    Idle,
    InProgress,
    UseNextDb,
}

impl SwitchoverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchoverState::Idle => "idle",
            SwitchoverState::InProgress => "in_progress",
            SwitchoverState::UseNextDb => "use_next_db",
        }
    }
}

impl fmt::Display for SwitchoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwitchoverState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SwitchoverState::Idle),
            "in_progress" => Ok(SwitchoverState::InProgress),
            "use_next_db" => Ok(SwitchoverState::UseNextDb),
            other => bail!("unknown switchover state {:?}", other),
        }
    }
}

/// Sentinel returned from the cutover when the source state already reads
/// `use_next_db`: a concurrent driver finished first. The caller treats it
/// as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchoverDone;

impl fmt::Display for SwitchoverDone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("switchover already completed")
    }
}

impl std::error::Error for SwitchoverDone {}

/// Returns true if the error chain bottoms out in [`SwitchoverDone`].
pub fn is_already_done(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SwitchoverDone>().is_some()
}
