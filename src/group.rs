// ABOUTME: Cluster coordination interface consumed by the switchover driver
// ABOUTME: Pause broadcast, node task snapshots, and operator progress lines

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

/// A task currently running on a node, identified by name.
///
/// The driver only inspects the names `pause` and `resume-after`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub name: String,
}

/// One application node's task list.
#[derive(Debug, Clone, Default)]
pub struct NodeStatus {
    pub tasks: Vec<TaskStatus>,
}

/// Snapshot of every node in the cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterStatus {
    pub nodes: Vec<NodeStatus>,
}

/// The coordination substrate: pause broadcast, cluster snapshots, and
/// user-visible progress reporting.
///
/// Leader election and the node task protocol live behind this trait; the
/// switchover driver never talks to peers directly.
#[async_trait]
pub trait ClusterGroup: Send + Sync {
    /// Broadcast a pause task to every peer node.
    async fn pause(&self) -> Result<()>;

    /// Current cluster snapshot.
    fn status(&self) -> ClusterStatus;

    /// Emit a user-visible progress line.
    fn progress(&self, message: &str);
}

/// Single-node group for standalone runs and tests.
///
/// There are no peers to pause, so `pause` moves this node's own task list
/// straight to `resume-after` and the quorum condition holds on the first
/// poll.
#[derive(Debug, Default)]
pub struct StandaloneGroup {
    tasks: Mutex<Vec<TaskStatus>>,
}

impl StandaloneGroup {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterGroup for StandaloneGroup {
    async fn pause(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("task list poisoned");
        *tasks = vec![TaskStatus {
            name: "resume-after".to_string(),
        }];
        Ok(())
    }

    fn status(&self) -> ClusterStatus {
        let tasks = self.tasks.lock().expect("task list poisoned");
        ClusterStatus {
            nodes: vec![NodeStatus {
                tasks: tasks.clone(),
            }],
        }
    }

    fn progress(&self, message: &str) {
        tracing::info!("{}", message);
    }
}
