// ABOUTME: Initial bulk copy of every replicated table, source to destination
// ABOUTME: One snapshot transaction pair, truncate then chunked JSON inserts

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio_postgres::Client;

use crate::cancel::CancellationToken;
use crate::group::ClusterGroup;
use crate::schema::Table;
use crate::switchover::sync::sync_tx;

/// Rows per insert round-trip during the bulk copy. Bounds the JSON payload
/// shipped per statement.
const COPY_BATCH_ROWS: usize = 1000;

/// Copy every non-skipped table from source to destination.
///
/// Runs inside the same transaction pairing as a drain: the source side is a
/// serializable snapshot, so on return the destination matches one source
/// prefix and the already-installed change log captures every later
/// mutation. Destination tables are truncated first; constraints are
/// deferred, so declared table order suffices.
pub async fn initial_sync(
    cancel: &CancellationToken,
    group: &dyn ClusterGroup,
    tables: &[Table],
    source: &mut Client,
    dest: &mut Client,
) -> Result<()> {
    let (src_tx, dst_tx) = sync_tx(source, dest).await.context("sync tx")?;

    dst_tx
        .execute("SET CONSTRAINTS ALL DEFERRED", &[])
        .await
        .context("defer constraints")?;

    let names: Vec<String> = tables
        .iter()
        .filter(|t| !t.skip_sync())
        .map(|t| t.quoted_name())
        .collect();
    if names.is_empty() {
        return Ok(());
    }

    // One statement so referential checks among the set cannot fire.
    dst_tx
        .execute(&format!("TRUNCATE {}", names.join(", ")), &[])
        .await
        .context("truncate destination")?;

    for table in tables {
        if table.skip_sync() {
            continue;
        }
        cancel.check()?;

        let rows = src_tx
            .query(&table.select_all_rows_query(), &[])
            .await
            .with_context(|| format!("read {}", table.name))?;
        let total = rows.len();

        for chunk in rows.chunks(COPY_BATCH_ROWS) {
            let data = Value::Array(chunk.iter().map(|r| r.get::<_, Value>(1)).collect());
            let affected = dst_tx
                .execute(&table.insert_rows_query(), &[&data])
                .await
                .with_context(|| format!("copy {}", table.name))?;
            if affected != chunk.len() as u64 {
                bail!(
                    "copy {}: got {} rows affected; expected {}",
                    table.name,
                    affected,
                    chunk.len()
                );
            }
        }

        group.progress(&format!("copied {} rows from {}", total, table.name));
    }

    dst_tx.commit().await.context("commit dst")?;
    src_tx.commit().await.context("commit src")?;

    Ok(())
}
