// ABOUTME: End-to-end switchover driver, converge loop through cutover
// ABOUTME: Owns the run's connections, tracker, and pause coordination

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_postgres::Client;

use crate::cancel::CancellationToken;
use crate::group::{ClusterGroup, ClusterStatus};
use crate::postgres;
use crate::schema::scan_tables;
use crate::switchover::changelog::{disable_triggers, enable_change_log};
use crate::switchover::cutover::final_sync;
use crate::switchover::initial::initial_sync;
use crate::switchover::is_already_done;
use crate::switchover::sync::{sync_changes, wait_for_running_tx};
use crate::switchover::tracker::RowTracker;

/// Outcome of inspecting one cluster snapshot during pause polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseQuorum {
    /// Every node is in resume-wait; proceed to the critical section.
    Ready,
    /// Nodes are still pausing.
    Waiting,
    /// No node is pausing and none is resume-waiting: the pause was lost.
    Failed,
}

fn pause_quorum(status: &ClusterStatus) -> PauseQuorum {
    let mut pausing = 0usize;
    let mut waiting = 0usize;
    for node in &status.nodes {
        for task in &node.tasks {
            match task.name.as_str() {
                "pause" => pausing += 1,
                "resume-after" => waiting += 1,
                _ => {}
            }
        }
    }

    if pausing == 0 && waiting == status.nodes.len() {
        PauseQuorum::Ready
    } else if pausing == 0 && waiting == 0 {
        PauseQuorum::Failed
    } else {
        PauseQuorum::Waiting
    }
}

/// The switchover driver. One instance performs one run; the advisory lock
/// on the source guarantees at most one driver acts per cluster.
pub struct Switchover {
    source_url: String,
    dest_url: String,
    group: Arc<dyn ClusterGroup>,
}

impl Switchover {
    pub fn new(
        source_url: impl Into<String>,
        dest_url: impl Into<String>,
        group: Arc<dyn ClusterGroup>,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            dest_url: dest_url.into(),
            group,
        }
    }

    /// Connect both databases and run the switchover to completion.
    pub async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
        let mut source = postgres::connect_with_retry(&self.source_url)
            .await
            .context("connect source")?;
        let mut dest = postgres::connect_with_retry(&self.dest_url)
            .await
            .context("connect dest")?;

        self.run(cancel, &mut source, &mut dest).await
    }

    /// Run the switchover over already-acquired connections.
    ///
    /// Both connections are dedicated to this run. On any unrecovered error
    /// the in-flight transactions roll back on drop and the switchover
    /// state stays `in_progress` for a later attempt.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        source: &mut Client,
        dest: &mut Client,
    ) -> Result<()> {
        let group = self.group.as_ref();

        group.progress("scanning tables...");
        let tables = scan_tables(source).await.context("scan tables")?;

        group.progress("enabling change log");
        enable_change_log(&tables, source)
            .await
            .context("enable change log")?;

        group.progress("disabling triggers");
        disable_triggers(&tables, dest)
            .await
            .context("disable triggers")?;

        group.progress("waiting for in-flight transactions to finish");
        wait_for_running_tx(cancel, group, source)
            .await
            .context("wait for running tx")?;

        group.progress("performing initial sync");
        initial_sync(cancel, group, &tables, source, dest)
            .await
            .context("initial sync")?;

        group.progress("recording new DB state");
        let mut tracker = RowTracker::new(tables, dest).await.context("read row IDs")?;

        sync_changes(cancel, group, &mut tracker, source, dest)
            .await
            .context("sync changes")?;

        group.progress("pausing");
        group.pause().await.context("pause")?;
        wait_for_pause_quorum(cancel, group).await?;

        group.progress("begin final sync");
        match final_sync(cancel, group, &mut tracker, source, dest).await {
            Ok(()) => Ok(()),
            Err(e) if is_already_done(&e) => {
                group.progress("switchover already completed elsewhere");
                Ok(())
            }
            Err(e) => {
                tracing::error!("final sync failed: {:#}", e);
                Err(e.context("final sync"))
            }
        }
    }
}

/// Poll the cluster snapshot every 10 ms until quorum pause is reached.
async fn wait_for_pause_quorum(cancel: &CancellationToken, group: &dyn ClusterGroup) -> Result<()> {
    let mut tick = tokio::time::interval(Duration::from_millis(10));
    loop {
        cancel.check()?;
        tick.tick().await;

        match pause_quorum(&group.status()) {
            PauseQuorum::Ready => return Ok(()),
            PauseQuorum::Failed => bail!("pause failed"),
            PauseQuorum::Waiting => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{NodeStatus, TaskStatus};

    fn node(task_names: &[&str]) -> NodeStatus {
        NodeStatus {
            tasks: task_names
                .iter()
                .map(|n| TaskStatus {
                    name: n.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_quorum_ready_when_all_resume_waiting() {
        let status = ClusterStatus {
            nodes: vec![node(&["resume-after"]), node(&["resume-after"])],
        };
        assert_eq!(pause_quorum(&status), PauseQuorum::Ready);
    }

    #[test]
    fn test_quorum_waiting_while_pausing() {
        let status = ClusterStatus {
            nodes: vec![node(&["pause"]), node(&["resume-after"])],
        };
        assert_eq!(pause_quorum(&status), PauseQuorum::Waiting);
    }

    #[test]
    fn test_quorum_waiting_when_partially_acknowledged() {
        // One node resume-waiting, one with no tasks yet: not a failure
        // until both counts reach zero.
        let status = ClusterStatus {
            nodes: vec![node(&["resume-after"]), node(&[])],
        };
        assert_eq!(pause_quorum(&status), PauseQuorum::Waiting);
    }

    #[test]
    fn test_quorum_failed_when_both_counts_zero() {
        let status = ClusterStatus {
            nodes: vec![node(&[]), node(&[])],
        };
        assert_eq!(pause_quorum(&status), PauseQuorum::Failed);
    }

    #[test]
    fn test_quorum_ready_with_no_nodes() {
        let status = ClusterStatus { nodes: vec![] };
        assert_eq!(pause_quorum(&status), PauseQuorum::Ready);
    }

    #[test]
    fn test_quorum_ignores_unrelated_tasks() {
        let status = ClusterStatus {
            nodes: vec![node(&["resume-after", "heartbeat"])],
        };
        assert_eq!(pause_quorum(&status), PauseQuorum::Ready);
    }
}
