// ABOUTME: Change-log capture installation and destination trigger toggling
// ABOUTME: Emits multi-statement batches so partial application is impossible

use anyhow::{Context, Result};
use tokio_postgres::Client;

use crate::schema::Table;
use crate::sqlutil::{quote_ident, SqlBatch};

/// Name of the per-table capture trigger. The `zz_` prefix sorts it after
/// application triggers so captured rows reflect their effects.
const TRIGGER_NAME: &str = "zz_switchover_change_log";

/// DDL for the capture side: the change-log table and the row-level trigger
/// function. The function takes the pk column name as a trigger argument so
/// one function serves every table.
const CHANGE_LOG_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS change_log (
    id BIGSERIAL PRIMARY KEY,
    table_name TEXT NOT NULL,
    row_id TEXT NOT NULL
);
CREATE OR REPLACE FUNCTION switchover_change_log() RETURNS trigger AS $$
DECLARE
    _row_id TEXT;
BEGIN
    IF TG_OP = 'DELETE' THEN
        _row_id := to_jsonb(OLD) ->> TG_ARGV[0];
    ELSE
        _row_id := to_jsonb(NEW) ->> TG_ARGV[0];
    END IF;
    INSERT INTO change_log (table_name, row_id) VALUES (TG_TABLE_NAME, _row_id);
    RETURN NULL;
END
$$ LANGUAGE plpgsql
"#;

/// DDL for the switchover state row, seeded `idle`. The `ok` column pins the
/// table to a single row.
const SWITCHOVER_STATE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS switchover_state (
    ok BOOLEAN PRIMARY KEY DEFAULT true CHECK (ok),
    current_state TEXT NOT NULL DEFAULT 'idle'
        CHECK (current_state IN ('idle', 'in_progress', 'use_next_db'))
);
INSERT INTO switchover_state (ok, current_state)
    VALUES (true, 'idle') ON CONFLICT (ok) DO NOTHING
"#;

fn create_trigger_statement(table: &Table) -> String {
    format!(
        "CREATE TRIGGER {trig} AFTER INSERT OR UPDATE OR DELETE ON {t} FOR EACH ROW EXECUTE PROCEDURE switchover_change_log('{id}')",
        trig = quote_ident(TRIGGER_NAME),
        t = table.quoted_name(),
        id = table.id_col,
    )
}

/// Install the change log and attach the capture trigger to every
/// non-skipped source table. Idempotent: existing triggers are replaced.
pub async fn enable_change_log(tables: &[Table], source: &Client) -> Result<()> {
    let mut batch = SqlBatch::new();
    batch.push(CHANGE_LOG_DDL.trim());
    for table in tables {
        if table.skip_sync() {
            continue;
        }
        batch.push(format!(
            "DROP TRIGGER IF EXISTS {trig} ON {t}",
            trig = quote_ident(TRIGGER_NAME),
            t = table.quoted_name(),
        ));
        batch.push(create_trigger_statement(table));
    }
    batch
        .execute(source)
        .await
        .context("Failed to enable change log")
}

/// Remove the capture triggers and drop the change log. Used by `reset`
/// after an aborted switchover.
pub async fn disable_change_log(tables: &[Table], source: &Client) -> Result<()> {
    let mut batch = SqlBatch::new();
    for table in tables {
        if table.skip_sync() {
            continue;
        }
        batch.push(format!(
            "DROP TRIGGER IF EXISTS {trig} ON {t}",
            trig = quote_ident(TRIGGER_NAME),
            t = table.quoted_name(),
        ));
    }
    batch.push("DROP FUNCTION IF EXISTS switchover_change_log()");
    batch.push("DROP TABLE IF EXISTS change_log");
    batch
        .execute(source)
        .await
        .context("Failed to disable change log")
}

/// Ensure the switchover state table exists on the source, seeded `idle`.
pub async fn ensure_switchover_state(source: &Client) -> Result<()> {
    source
        .batch_execute(SWITCHOVER_STATE_DDL.trim())
        .await
        .context("Failed to ensure switchover state")
}

/// Disable all user triggers on the destination for every replicated table.
/// One batch: all tables toggle or none do.
pub async fn disable_triggers(tables: &[Table], dest: &Client) -> Result<()> {
    let mut batch = SqlBatch::new();
    for table in tables {
        if table.skip_sync() {
            continue;
        }
        batch.push(format!(
            "ALTER TABLE {} DISABLE TRIGGER USER",
            table.quoted_name()
        ));
    }
    batch
        .execute(dest)
        .await
        .context("Failed to disable triggers")
}

/// Re-enable all user triggers on the destination.
pub async fn enable_triggers(tables: &[Table], dest: &Client) -> Result<()> {
    let mut batch = SqlBatch::new();
    for table in tables {
        if table.skip_sync() {
            continue;
        }
        batch.push(format!(
            "ALTER TABLE {} ENABLE TRIGGER USER",
            table.quoted_name()
        ));
    }
    batch
        .execute(dest)
        .await
        .context("Failed to enable triggers")
}
