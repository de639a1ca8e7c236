// ABOUTME: Library root for pg-switchover
// ABOUTME: Exposes the switchover engine, schema catalog, and group interface

pub mod cancel;
pub mod group;
pub mod postgres;
pub mod schema;
pub mod sqlutil;
pub mod switchover;

pub use cancel::CancellationToken;
pub use group::{ClusterGroup, ClusterStatus, NodeStatus, StandaloneGroup, TaskStatus};
pub use schema::{scan_tables, IdType, Table};
pub use switchover::{Switchover, SwitchoverDone, SwitchoverState, GLOBAL_SWITCHOVER_LOCK};
