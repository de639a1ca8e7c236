// ABOUTME: Stop-the-world cutover: final drain, sequence transfer, state flip
// ABOUTME: Critical section held under the cluster-wide advisory lock

use anyhow::{bail, Context, Result};
use tokio_postgres::{Client, Transaction};

use crate::cancel::CancellationToken;
use crate::group::ClusterGroup;
use crate::sqlutil::quote_ident;
use crate::switchover::sync::{sync_change_log, sync_changes};
use crate::switchover::tracker::RowTracker;
use crate::switchover::{SwitchoverDone, SwitchoverState, GLOBAL_SWITCHOVER_LOCK};

/// The change-log sequence has no counterpart in the destination.
const EXCLUDED_SEQUENCES: &[&str] = &["change_log_id_seq"];

/// Filter enumerated sequence names down to the ones to transfer.
fn transferable_sequences(names: Vec<String>) -> Vec<String> {
    names
        .into_iter()
        .filter(|n| !EXCLUDED_SEQUENCES.contains(&n.as_str()))
        .collect()
}

/// Read the current switchover state, locking the row against a concurrent
/// flip. NOWAIT: the caller already holds the advisory lock, so any row
/// contention means another session is wedged.
async fn read_state_locked(src_tx: &Transaction<'_>) -> Result<SwitchoverState> {
    let row = src_tx
        .query_one(
            "SELECT current_state FROM switchover_state FOR UPDATE NOWAIT",
            &[],
        )
        .await
        .context("get switchover state")?;
    let state: String = row.get(0);
    state.parse()
}

/// Execute the cutover.
///
/// Destination commit precedes the state flip, so data is durable before any
/// node can observe `use_next_db`. If the flip itself fails the destination
/// is fully populated and a later attempt converges to zero changes and
/// flips idempotently.
pub async fn final_sync(
    cancel: &CancellationToken,
    group: &dyn ClusterGroup,
    tracker: &mut RowTracker,
    source: &mut Client,
    dest: &mut Client,
) -> Result<()> {
    // Enumerate sequences before taking any lock; values are read later,
    // inside the critical section.
    let rows = source
        .query(
            "SELECT sequence_name
             FROM information_schema.sequences
             WHERE sequence_catalog = current_database() AND sequence_schema = 'public'",
            &[],
        )
        .await
        .context("get sequence names")?;
    let seq_names = transferable_sequences(rows.iter().map(|r| r.get(0)).collect());

    // Safety timeouts: bound the stop-the-world window if anything wedges.
    source
        .batch_execute("SET idle_in_transaction_session_timeout = 1000")
        .await
        .context("set idle_in_transaction_session_timeout")?;
    source
        .batch_execute("SET lock_timeout = 3000")
        .await
        .context("set lock_timeout")?;

    // Catch up before pausing the world, to keep the critical section short.
    sync_changes(cancel, group, tracker, source, dest)
        .await
        .context("sync changes")?;

    let src_tx = source.transaction().await.context("begin src")?;
    let dst_tx = dest.transaction().await.context("begin dst")?;

    group.progress("stop-the-world");
    src_tx
        .execute("SELECT pg_advisory_xact_lock($1)", &[&GLOBAL_SWITCHOVER_LOCK])
        .await
        .context("lock global switchover")?;

    match read_state_locked(&src_tx).await? {
        SwitchoverState::UseNextDb => return Err(SwitchoverDone.into()),
        SwitchoverState::Idle => bail!("not running"),
        SwitchoverState::InProgress => {}
    }

    group.progress("last sync");
    sync_change_log(cancel, tracker, &src_tx, &dst_tx)
        .await
        .map_err(anyhow::Error::from)
        .context("sync change log")?;

    for name in &seq_names {
        let row = src_tx
            .query_one(
                &format!("SELECT last_value, is_called FROM {}", quote_ident(name)),
                &[],
            )
            .await
            .with_context(|| format!("get sequence {}", name))?;
        let last_value: i64 = row.get(0);
        let is_called: bool = row.get(1);

        let quoted = quote_ident(name);
        dst_tx
            .execute(
                "SELECT pg_catalog.setval($1::text::regclass, $2, $3)",
                &[&quoted, &last_value, &is_called],
            )
            .await
            .with_context(|| format!("set sequence {}", name))?;
    }

    dst_tx.commit().await.context("commit dst")?;

    // The destination transaction is gone; triggers toggle on the bare
    // connection.
    super::changelog::enable_triggers(tracker.tables(), dest)
        .await
        .context("enable triggers")?;

    src_tx
        .execute(
            "UPDATE switchover_state SET current_state = 'use_next_db' WHERE current_state = 'in_progress'",
            &[],
        )
        .await
        .context("update switchover state")?;

    src_tx.commit().await.context("commit src")?;

    group.progress("done");
    Ok(())
}

/// Read the current switchover state without locking. Used by the CLI.
pub async fn read_state(source: &Client) -> Result<SwitchoverState> {
    let row = source
        .query_one("SELECT current_state FROM switchover_state", &[])
        .await
        .context("get switchover state")?;
    let state: String = row.get(0);
    state.parse()
}

/// Transition `idle` to `in_progress` under the advisory lock. The external
/// initialization step of the lifecycle.
pub async fn mark_in_progress(source: &mut Client) -> Result<()> {
    let tx = source.transaction().await.context("begin")?;
    tx.execute("SELECT pg_advisory_xact_lock($1)", &[&GLOBAL_SWITCHOVER_LOCK])
        .await
        .context("lock global switchover")?;
    let n = tx
        .execute(
            "UPDATE switchover_state SET current_state = 'in_progress' WHERE current_state = 'idle'",
            &[],
        )
        .await
        .context("update switchover state")?;
    if n == 0 {
        let state = read_state_locked(&tx).await?;
        bail!("switchover already {}", state);
    }
    tx.commit().await.context("commit")?;
    Ok(())
}

/// Reset the state to `idle` under the advisory lock, for `reset` after an
/// aborted run.
pub async fn mark_idle(source: &mut Client) -> Result<()> {
    let tx = source.transaction().await.context("begin")?;
    tx.execute("SELECT pg_advisory_xact_lock($1)", &[&GLOBAL_SWITCHOVER_LOCK])
        .await
        .context("lock global switchover")?;
    tx.execute("UPDATE switchover_state SET current_state = 'idle'", &[])
        .await
        .context("update switchover state")?;
    tx.commit().await.context("commit")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transferable_sequences_excludes_change_log() {
        let names = vec![
            "users_id_seq".to_string(),
            "change_log_id_seq".to_string(),
            "orders_id_seq".to_string(),
        ];
        assert_eq!(
            transferable_sequences(names),
            vec!["users_id_seq".to_string(), "orders_id_seq".to_string()]
        );
    }

    #[test]
    fn test_transferable_sequences_empty() {
        assert!(transferable_sequences(vec![]).is_empty());
    }
}
