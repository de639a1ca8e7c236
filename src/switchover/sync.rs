// ABOUTME: Converge loop and drain iteration: change log to destination
// ABOUTME: Paired transactions, tracker classification, batched JSON apply

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio_postgres::{Client, IsolationLevel, Transaction};

use crate::cancel::{is_cancelled, CancellationToken, Cancelled};
use crate::group::ClusterGroup;
use crate::schema::{IdValues, Table};
use crate::switchover::tracker::RowTracker;

/// One row fetched from the source, keyed by its pk string.
#[derive(Debug, Clone)]
struct SyncRow {
    id: String,
    data: Value,
}

/// Classified changes for one table within one drain window.
#[derive(Debug, Default)]
struct SyncData {
    to_insert: Vec<SyncRow>,
    to_update: Vec<SyncRow>,
    to_delete: Vec<String>,
}

/// A delete batch staged during the forward table pass, applied in reverse
/// table order once inserts and updates are done.
struct PendingDelete {
    query: String,
    ids: IdValues,
    count: usize,
}

/// Failure inside one drain step, carrying how many change-log rows were
/// seen but not yet acknowledged.
pub(crate) struct StepError {
    pub pending: usize,
    pub source: anyhow::Error,
}

impl From<StepError> for anyhow::Error {
    fn from(e: StepError) -> Self {
        e.source
    }
}

/// Failure of a whole drain iteration. `committed` is nonzero when rows were
/// committed on either side without the tracker recording them; the converge
/// loop must treat that as fatal.
pub(crate) struct LoopError {
    pub committed: usize,
    pub pending: usize,
    pub source: anyhow::Error,
}

/// Quiescence gate: wait until no transaction predating `now()` is still
/// running on the source, so the change log is a superset of everything
/// committed after this point.
pub async fn wait_for_running_tx(
    cancel: &CancellationToken,
    group: &dyn ClusterGroup,
    source: &Client,
) -> Result<()> {
    let row = source
        .query_one("SELECT now()", &[])
        .await
        .context("get current timestamp")?;
    let cutoff: chrono::DateTime<chrono::Utc> = row.get(0);

    loop {
        cancel.check()?;
        let row = source
            .query_one(
                "SELECT count(*) FROM pg_stat_activity WHERE state <> 'idle' AND xact_start <= $1",
                &[&cutoff],
            )
            .await
            .context("get running tx count")?;
        let n: i64 = row.get(0);
        if n == 0 {
            return Ok(());
        }

        group.progress(&format!("waiting for {} transaction(s) to finish", n));
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Open the drain transaction pair.
///
/// The source side is READ ONLY SERIALIZABLE DEFERRABLE: a consistent
/// snapshot with no predicate locks. The destination side runs at the
/// default level. If the destination begin fails the already-open source
/// transaction rolls back on drop.
pub(crate) async fn sync_tx<'s, 'd>(
    source: &'s mut Client,
    dest: &'d mut Client,
) -> Result<(Transaction<'s>, Transaction<'d>)> {
    let src_tx = source
        .build_transaction()
        .read_only(true)
        .isolation_level(IsolationLevel::Serializable)
        .deferrable(true)
        .start()
        .await
        .context("begin src")?;

    let dst_tx = dest.transaction().await.context("begin dst")?;

    Ok((src_tx, dst_tx))
}

/// Repeatedly drain the change log until an iteration reports zero rows.
///
/// A transient iteration failure rolls the tracker delta back and retries.
/// A failure after rows were committed without a tracker record is fatal:
/// the tracker would diverge from the destination.
pub async fn sync_changes(
    cancel: &CancellationToken,
    group: &dyn ClusterGroup,
    tracker: &mut RowTracker,
    source: &mut Client,
    dest: &mut Client,
) -> Result<()> {
    while !cancel.is_cancelled() {
        let start = Instant::now();
        match loop_sync(cancel, tracker, source, dest).await {
            Ok(0) => {
                tracker.commit();
                return Ok(());
            }
            Ok(n) => {
                tracker.commit();
                group.progress(&format!(
                    "sync: {} rows replicated in {}ms",
                    n,
                    start.elapsed().as_millis()
                ));
            }
            Err(e) => {
                if e.pending > 0 {
                    group.progress(&format!("sync: {} rows pending", e.pending));
                }
                tracker.rollback();
                if is_cancelled(&e.source) {
                    return Err(e.source);
                }
                if e.committed > 0 {
                    return Err(e.source.context("sync failure (commit without record)"));
                }
                tracing::error!("drain iteration failed, retrying: {:#}", e.source);
            }
        }
    }

    Err(Cancelled.into())
}

/// One drain iteration: paired transactions, apply, commit source then
/// destination, then delete the processed change-log rows.
///
/// Deletion happens after both commits: re-seeing a processed id later is a
/// harmless no-op diff, while losing one before the destination commit
/// would lose data.
pub(crate) async fn loop_sync(
    cancel: &CancellationToken,
    tracker: &mut RowTracker,
    source: &mut Client,
    dest: &mut Client,
) -> Result<usize, LoopError> {
    let (src_tx, dst_tx) = sync_tx(source, dest).await.map_err(|e| LoopError {
        committed: 0,
        pending: 0,
        source: e.context("sync tx"),
    })?;

    let ids = sync_change_log(cancel, tracker, &src_tx, &dst_tx)
        .await
        .map_err(|e| LoopError {
            committed: 0,
            pending: e.pending,
            source: e.source.context("sync change log"),
        })?;

    src_tx.commit().await.map_err(|e| LoopError {
        committed: ids.len(),
        pending: 0,
        source: anyhow::Error::new(e).context("commit src"),
    })?;

    dst_tx.commit().await.map_err(|e| LoopError {
        committed: 0,
        pending: ids.len(),
        source: anyhow::Error::new(e).context("commit dst"),
    })?;

    source
        .execute("DELETE FROM change_log WHERE id = ANY($1)", &[&ids])
        .await
        .map_err(|e| LoopError {
            committed: ids.len(),
            pending: 0,
            source: anyhow::Error::new(e).context("update change log"),
        })?;

    Ok(ids.len())
}

/// Drain the current change-log contents into the destination transaction.
///
/// Returns the change-log ids to delete once both sides commit. Pending
/// changes coalesce per `(table, row_id)`: the row is re-read once and only
/// its latest state replicates.
pub(crate) async fn sync_change_log(
    cancel: &CancellationToken,
    tracker: &mut RowTracker,
    src_tx: &Transaction<'_>,
    dst_tx: &Transaction<'_>,
) -> Result<Vec<i64>, StepError> {
    let (change_ids, row_ids) = read_pending(cancel, src_tx).await.map_err(|e| StepError {
        pending: 0,
        source: e,
    })?;
    if change_ids.is_empty() {
        return Ok(change_ids);
    }

    apply_pending(cancel, tracker, src_tx, dst_tx, &row_ids)
        .await
        .map_err(|e| StepError {
            pending: change_ids.len(),
            source: e,
        })?;

    Ok(change_ids)
}

/// Read the change log in id order, deduplicating to one re-read per
/// `(table, row_id)` while remembering every id encountered.
async fn read_pending(
    cancel: &CancellationToken,
    src_tx: &Transaction<'_>,
) -> Result<(Vec<i64>, HashMap<String, Vec<String>>)> {
    cancel.check()?;

    let rows = src_tx
        .query("SELECT id, table_name, row_id FROM change_log ORDER BY id", &[])
        .await
        .context("fetch changes")?;

    let mut change_ids = Vec::with_capacity(rows.len());
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut row_ids: HashMap<String, Vec<String>> = HashMap::new();
    for row in &rows {
        let id: i64 = row.get(0);
        let table: String = row.get(1);
        let row_id: String = row.get(2);

        change_ids.push(id);
        if seen.insert((table.clone(), row_id.clone())) {
            row_ids.entry(table).or_default().push(row_id);
        }
    }

    Ok((change_ids, row_ids))
}

/// Apply the deduplicated change set to the destination transaction.
///
/// Inserts and updates walk tables in declared order (parents first);
/// deletes are staged and applied in reverse order (children first). With
/// all constraints deferred, declared order alone keeps referential checks
/// satisfiable at commit.
async fn apply_pending(
    cancel: &CancellationToken,
    tracker: &mut RowTracker,
    src_tx: &Transaction<'_>,
    dst_tx: &Transaction<'_>,
    row_ids: &HashMap<String, Vec<String>>,
) -> Result<()> {
    dst_tx
        .execute("SET CONSTRAINTS ALL DEFERRED", &[])
        .await
        .context("defer constraints")?;

    let tables = tracker.tables().to_vec();
    let mut deletes: Vec<PendingDelete> = Vec::new();

    for table in &tables {
        if table.skip_sync() {
            continue;
        }
        let Some(ids) = row_ids.get(&table.name) else {
            continue;
        };
        if ids.is_empty() {
            continue;
        }
        cancel.check()?;

        let sd = fetch(tracker, table, src_tx, ids)
            .await
            .context("fetch changed rows")?;

        if !sd.to_delete.is_empty() {
            deletes.push(PendingDelete {
                query: table.delete_rows_query(),
                ids: table.id_values(&sd.to_delete)?,
                count: sd.to_delete.len(),
            });
        }

        apply(dst_tx, &table.update_rows_query(), &sd.to_update)
            .await
            .context("apply updates")?;
        apply(dst_tx, &table.insert_rows_query(), &sd.to_insert)
            .await
            .context("apply inserts")?;
    }

    for del in deletes.iter().rev() {
        let affected = dst_tx
            .execute(&del.query, &[del.ids.as_param()])
            .await
            .context("delete rows")?;
        if affected != del.count as u64 {
            bail!("delete rows: got {} != expected {}", affected, del.count);
        }
    }

    Ok(())
}

/// Re-read the current state of the given rows from the source and classify
/// each against the tracker.
async fn fetch(
    tracker: &mut RowTracker,
    table: &Table,
    src_tx: &Transaction<'_>,
    ids: &[String],
) -> Result<SyncData> {
    let params = table.id_values(ids)?;
    let rows = src_tx
        .query(&table.select_rows_query(), &[params.as_param()])
        .await
        .context("fetch rows")?;

    let fetched: Vec<SyncRow> = rows
        .iter()
        .map(|row| SyncRow {
            id: row.get(0),
            data: row.get(1),
        })
        .collect();

    Ok(classify(tracker, &table.name, fetched, ids))
}

/// Resolve re-read rows to inserts, updates, and deletes.
///
/// A returned row the tracker knows is an update; an unknown one is an
/// insert (staged in the tracker). A requested id the source no longer has
/// is a delete if the tracker knows it, and nothing at all otherwise: a row
/// inserted then deleted within one drain window collapses away.
fn classify(
    tracker: &mut RowTracker,
    table: &str,
    fetched: Vec<SyncRow>,
    requested: &[String],
) -> SyncData {
    let mut sd = SyncData::default();

    let exists_in_source: HashSet<String> = fetched.iter().map(|r| r.id.clone()).collect();

    for row in fetched {
        if tracker.exists(table, &row.id) {
            sd.to_update.push(row);
        } else {
            tracker.insert(table, &row.id);
            sd.to_insert.push(row);
        }
    }

    for id in requested {
        if exists_in_source.contains(id) {
            continue;
        }
        if !tracker.exists(table, id) {
            continue;
        }
        tracker.delete(table, id);
        sd.to_delete.push(id.clone());
    }

    sd
}

/// Ship a batch as one JSON array parameter, one round-trip per
/// (table, operation). The affected count must match the batch size.
async fn apply(dst_tx: &Transaction<'_>, query: &str, rows: &[SyncRow]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let data = Value::Array(rows.iter().map(|r| r.data.clone()).collect());
    let affected = dst_tx
        .execute(query, &[&data])
        .await
        .context("exec")?;
    if affected != rows.len() as u64 {
        bail!(
            "mismatch: got {} rows affected; expected {}",
            affected,
            rows.len()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::IdType;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    fn tracker_with(table: &str, ids: &[&str]) -> RowTracker {
        let t = Table {
            name: table.to_string(),
            id_col: "id".to_string(),
            id_type: IdType::Integer,
            columns: vec!["id".to_string(), "name".to_string()],
        };
        let mut base = StdHashMap::new();
        base.insert(
            table.to_string(),
            ids.iter().map(|s| s.to_string()).collect(),
        );
        RowTracker::with_base(vec![t], base)
    }

    fn row(id: &str) -> SyncRow {
        SyncRow {
            id: id.to_string(),
            data: json!({"id": id, "name": "x"}),
        }
    }

    #[test]
    fn test_classify_known_row_is_update() {
        let mut rt = tracker_with("a", &["1"]);
        let sd = classify(&mut rt, "a", vec![row("1")], &["1".to_string()]);
        assert_eq!(sd.to_update.len(), 1);
        assert!(sd.to_insert.is_empty());
        assert!(sd.to_delete.is_empty());
    }

    #[test]
    fn test_classify_unknown_row_is_insert_and_staged() {
        let mut rt = tracker_with("a", &[]);
        let sd = classify(&mut rt, "a", vec![row("3")], &["3".to_string()]);
        assert_eq!(sd.to_insert.len(), 1);
        assert!(sd.to_update.is_empty());
        assert!(rt.exists("a", "3"));
    }

    #[test]
    fn test_classify_missing_known_row_is_delete() {
        let mut rt = tracker_with("a", &["1"]);
        let sd = classify(&mut rt, "a", vec![], &["1".to_string()]);
        assert_eq!(sd.to_delete, vec!["1".to_string()]);
        assert!(!rt.exists("a", "1"));
    }

    #[test]
    fn test_classify_insert_then_delete_collapses() {
        // Row appeared and vanished between drains: the change log points at
        // it but the source no longer has it and the tracker never did.
        let mut rt = tracker_with("a", &[]);
        let sd = classify(&mut rt, "a", vec![], &["7".to_string()]);
        assert!(sd.to_insert.is_empty());
        assert!(sd.to_update.is_empty());
        assert!(sd.to_delete.is_empty());
    }

    #[test]
    fn test_classify_update_then_delete_yields_single_delete() {
        // Two change-log entries for the same row coalesce to one requested
        // id; the re-read finds nothing, so exactly one DELETE is staged.
        let mut rt = tracker_with("a", &["1"]);
        let sd = classify(&mut rt, "a", vec![], &["1".to_string()]);
        assert_eq!(sd.to_delete.len(), 1);
        assert!(sd.to_update.is_empty());
    }

    #[test]
    fn test_classify_mixed_batch() {
        let mut rt = tracker_with("a", &["1", "2"]);
        let sd = classify(
            &mut rt,
            "a",
            vec![row("1"), row("3")],
            &["1".to_string(), "2".to_string(), "3".to_string()],
        );
        assert_eq!(sd.to_update.len(), 1);
        assert_eq!(sd.to_insert.len(), 1);
        assert_eq!(sd.to_delete, vec!["2".to_string()]);
    }

    #[test]
    fn test_step_error_converts_to_anyhow() {
        let step = StepError {
            pending: 3,
            source: anyhow::anyhow!("boom"),
        };
        let err: anyhow::Error = step.into();
        assert_eq!(err.to_string(), "boom");
    }
}
