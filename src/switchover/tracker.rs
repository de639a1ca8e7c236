// ABOUTME: In-memory model of which primary keys exist in the destination
// ABOUTME: Base set per table plus a staged delta committed per drain

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use tokio_postgres::Client;

use crate::schema::Table;
use crate::sqlutil::quote_ident;

/// Classifier for captured changes: knows, per table, every primary key
/// present in the destination.
///
/// Mutations during a drain land in a pending delta; `commit` folds the
/// delta into the base set once both database transactions committed, and
/// `rollback` discards it after a failed drain. The tracker is owned by the
/// driver task exclusively; `&mut` discipline serializes drains.
pub struct RowTracker {
    tables: Vec<Table>,
    base: HashMap<String, HashSet<String>>,
    added: HashMap<String, HashSet<String>>,
    removed: HashMap<String, HashSet<String>>,
}

impl RowTracker {
    /// Build the tracker by reading every primary key currently in the
    /// destination. Call after the initial sync so the base set matches the
    /// copied snapshot.
    pub async fn new(tables: Vec<Table>, dest: &Client) -> Result<Self> {
        let mut base: HashMap<String, HashSet<String>> = HashMap::new();
        for table in &tables {
            if table.skip_sync() {
                continue;
            }
            let query = format!(
                "SELECT cast({id} AS text) FROM {t}",
                id = quote_ident(&table.id_col),
                t = table.quoted_name(),
            );
            let rows = dest
                .query(&query, &[])
                .await
                .with_context(|| format!("Failed to read row ids from {}", table.name))?;
            let ids: HashSet<String> = rows.iter().map(|r| r.get::<_, String>(0)).collect();
            tracing::debug!("tracking {} rows in {}", ids.len(), table.name);
            base.insert(table.name.clone(), ids);
        }

        Ok(Self {
            tables,
            base,
            added: HashMap::new(),
            removed: HashMap::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_base(tables: Vec<Table>, base: HashMap<String, HashSet<String>>) -> Self {
        Self {
            tables,
            base,
            added: HashMap::new(),
            removed: HashMap::new(),
        }
    }

    /// Tables in declared (dependency) order.
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// Does the destination hold this row, as of the base set plus the
    /// staged delta?
    pub fn exists(&self, table: &str, id: &str) -> bool {
        if self.added.get(table).is_some_and(|s| s.contains(id)) {
            return true;
        }
        if self.removed.get(table).is_some_and(|s| s.contains(id)) {
            return false;
        }
        self.base.get(table).is_some_and(|s| s.contains(id))
    }

    /// Stage an addition. Cancels a staged removal of the same id.
    pub fn insert(&mut self, table: &str, id: &str) {
        if let Some(removed) = self.removed.get_mut(table) {
            if removed.remove(id) {
                return;
            }
        }
        self.added
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string());
    }

    /// Stage a removal. Cancels a staged addition of the same id.
    pub fn delete(&mut self, table: &str, id: &str) {
        if let Some(added) = self.added.get_mut(table) {
            if added.remove(id) {
                return;
            }
        }
        self.removed
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string());
    }

    /// Fold the staged delta into the base set after a successful drain.
    pub fn commit(&mut self) {
        for (table, ids) in self.added.drain() {
            self.base.entry(table).or_default().extend(ids);
        }
        for (table, ids) in self.removed.drain() {
            if let Some(base) = self.base.get_mut(&table) {
                for id in ids {
                    base.remove(&id);
                }
            }
        }
    }

    /// Discard the staged delta after a failed drain.
    pub fn rollback(&mut self) {
        self.added.clear();
        self.removed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::IdType;

    fn tracker_with(ids: &[&str]) -> RowTracker {
        let table = Table {
            name: "a".to_string(),
            id_col: "id".to_string(),
            id_type: IdType::Integer,
            columns: vec!["id".to_string()],
        };
        let mut base = HashMap::new();
        base.insert(
            "a".to_string(),
            ids.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
        );
        RowTracker::with_base(vec![table], base)
    }

    #[test]
    fn test_exists_reads_base_set() {
        let rt = tracker_with(&["1", "2"]);
        assert!(rt.exists("a", "1"));
        assert!(!rt.exists("a", "3"));
        assert!(!rt.exists("b", "1"));
    }

    #[test]
    fn test_pending_insert_visible_before_commit() {
        let mut rt = tracker_with(&[]);
        rt.insert("a", "7");
        assert!(rt.exists("a", "7"));
    }

    #[test]
    fn test_pending_delete_hides_base_row() {
        let mut rt = tracker_with(&["1"]);
        rt.delete("a", "1");
        assert!(!rt.exists("a", "1"));
    }

    #[test]
    fn test_commit_folds_delta() {
        let mut rt = tracker_with(&["1"]);
        rt.insert("a", "2");
        rt.delete("a", "1");
        rt.commit();
        assert!(rt.exists("a", "2"));
        assert!(!rt.exists("a", "1"));
    }

    #[test]
    fn test_rollback_restores_pre_delta_state() {
        let mut rt = tracker_with(&["1"]);
        rt.insert("a", "2");
        rt.delete("a", "1");
        rt.rollback();
        assert!(rt.exists("a", "1"));
        assert!(!rt.exists("a", "2"));
    }

    #[test]
    fn test_insert_then_delete_collapses_to_nothing() {
        let mut rt = tracker_with(&[]);
        rt.insert("a", "7");
        rt.delete("a", "7");
        assert!(!rt.exists("a", "7"));
        rt.commit();
        assert!(!rt.exists("a", "7"));
    }

    #[test]
    fn test_delete_then_insert_restores_row() {
        let mut rt = tracker_with(&["1"]);
        rt.delete("a", "1");
        rt.insert("a", "1");
        assert!(rt.exists("a", "1"));
        rt.commit();
        assert!(rt.exists("a", "1"));
    }
}
