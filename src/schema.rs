// ABOUTME: Table catalog for the switchover: discovery and canned statements
// ABOUTME: Scans public tables, orders by FK dependency, coerces primary keys

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{bail, Context, Result};
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;
use uuid::Uuid;

use crate::sqlutil::quote_ident;

/// Tables whose content must never replicate: the capture table itself and
/// the switchover state row live only on the source.
const SKIP_TABLES: &[&str] = &["change_log", "switchover_state"];

/// Primary key column type, used to coerce row-id strings back into a typed
/// array parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    Integer,
    BigInt,
    Uuid,
    Other,
}

impl IdType {
    pub fn from_data_type(data_type: &str) -> Self {
        match data_type {
            "integer" => IdType::Integer,
            "bigint" => IdType::BigInt,
            "uuid" => IdType::Uuid,
            _ => IdType::Other,
        }
    }
}

/// Primary-key values coerced to the column's wire type, ready to bind as a
/// single array parameter.
#[derive(Debug)]
pub enum IdValues {
    Integer(Vec<i32>),
    BigInt(Vec<i64>),
    Uuid(Vec<Uuid>),
    Text(Vec<String>),
}

impl IdValues {
    /// Borrow as a bindable query parameter.
    pub fn as_param(&self) -> &(dyn ToSql + Sync) {
        match self {
            IdValues::Integer(v) => v,
            IdValues::BigInt(v) => v,
            IdValues::Uuid(v) => v,
            IdValues::Text(v) => v,
        }
    }
}

/// Descriptor for one replicated table.
///
/// Carries everything the sync loop needs to compose statements: the
/// single-column primary key, its type, and the column list captured at scan
/// time (the update statement enumerates assignments).
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub id_col: String,
    pub id_type: IdType,
    pub columns: Vec<String>,
}

impl Table {
    /// Table name quoted for statement composition.
    pub fn quoted_name(&self) -> String {
        quote_ident(&self.name)
    }

    /// True for tables that must not replicate.
    pub fn skip_sync(&self) -> bool {
        SKIP_TABLES.contains(&self.name.as_str())
    }

    /// Select `(id, row_as_json)` for every extant row in a pk array.
    pub fn select_rows_query(&self) -> String {
        format!(
            "SELECT cast(src.{id} AS text) AS id, to_jsonb(src) AS data FROM {t} AS src WHERE src.{id} = ANY($1)",
            id = quote_ident(&self.id_col),
            t = self.quoted_name(),
        )
    }

    /// Full-table variant of [`Table::select_rows_query`], used by the
    /// initial bulk copy.
    pub fn select_all_rows_query(&self) -> String {
        format!(
            "SELECT cast(src.{id} AS text) AS id, to_jsonb(src) AS data FROM {t} AS src ORDER BY src.{id}",
            id = quote_ident(&self.id_col),
            t = self.quoted_name(),
        )
    }

    /// Insert rows shipped as one JSON array parameter, unpacked server-side.
    pub fn insert_rows_query(&self) -> String {
        format!(
            "INSERT INTO {t} SELECT * FROM jsonb_populate_recordset(NULL::{t}, $1)",
            t = self.quoted_name(),
        )
    }

    /// Update rows by primary key from one JSON array parameter.
    pub fn update_rows_query(&self) -> String {
        let assignments: Vec<String> = self
            .columns
            .iter()
            .filter(|c| *c != &self.id_col)
            .map(|c| format!("{col} = src.{col}", col = quote_ident(c)))
            .collect();

        // A table with only its pk column still needs a valid SET clause.
        let set_clause = if assignments.is_empty() {
            format!("{id} = src.{id}", id = quote_ident(&self.id_col))
        } else {
            assignments.join(", ")
        };

        format!(
            "UPDATE {t} AS dst SET {set} FROM jsonb_populate_recordset(NULL::{t}, $1) AS src WHERE dst.{id} = src.{id}",
            t = self.quoted_name(),
            set = set_clause,
            id = quote_ident(&self.id_col),
        )
    }

    /// Delete rows in a pk array.
    pub fn delete_rows_query(&self) -> String {
        format!(
            "DELETE FROM {t} WHERE {id} = ANY($1)",
            t = self.quoted_name(),
            id = quote_ident(&self.id_col),
        )
    }

    /// Coerce row-id strings to a typed array parameter for this table's pk.
    pub fn id_values(&self, ids: &[String]) -> Result<IdValues> {
        match self.id_type {
            IdType::Integer => {
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    out.push(id.parse::<i32>().with_context(|| {
                        format!("Invalid integer row id {:?} for table {}", id, self.name)
                    })?);
                }
                Ok(IdValues::Integer(out))
            }
            IdType::BigInt => {
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    out.push(id.parse::<i64>().with_context(|| {
                        format!("Invalid bigint row id {:?} for table {}", id, self.name)
                    })?);
                }
                Ok(IdValues::BigInt(out))
            }
            IdType::Uuid => {
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    out.push(id.parse::<Uuid>().with_context(|| {
                        format!("Invalid uuid row id {:?} for table {}", id, self.name)
                    })?);
                }
                Ok(IdValues::Uuid(out))
            }
            IdType::Other => Ok(IdValues::Text(ids.to_vec())),
        }
    }
}

/// Scan the source catalog and return replicated tables in foreign-key
/// dependency order (parents before children).
///
/// Only `public` base tables with a single-column primary key participate;
/// others are skipped with a warning. Declared order is the ordering source
/// of truth for the sync loop's apply order.
pub async fn scan_tables(client: &Client) -> Result<Vec<Table>> {
    let table_rows = client
        .query(
            "SELECT table_name
             FROM information_schema.tables
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
             ORDER BY table_name",
            &[],
        )
        .await
        .context("Failed to list tables")?;
    let names: Vec<String> = table_rows.iter().map(|r| r.get(0)).collect();

    let column_rows = client
        .query(
            "SELECT table_name, column_name, data_type
             FROM information_schema.columns
             WHERE table_schema = 'public'
             ORDER BY table_name, ordinal_position",
            &[],
        )
        .await
        .context("Failed to list columns")?;
    let mut columns: HashMap<String, Vec<(String, String)>> = HashMap::new();
    for row in &column_rows {
        let table: String = row.get(0);
        let column: String = row.get(1);
        let data_type: String = row.get(2);
        columns.entry(table).or_default().push((column, data_type));
    }

    let pk_rows = client
        .query(
            "SELECT c.relname, a.attname
             FROM pg_index i
             JOIN pg_class c ON c.oid = i.indrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             WHERE i.indisprimary AND n.nspname = 'public'
             ORDER BY c.relname, array_position(i.indkey, a.attnum)",
            &[],
        )
        .await
        .context("Failed to list primary keys")?;
    let mut pks: HashMap<String, Vec<String>> = HashMap::new();
    for row in &pk_rows {
        let table: String = row.get(0);
        let column: String = row.get(1);
        pks.entry(table).or_default().push(column);
    }

    let fk_rows = client
        .query(
            "SELECT child.relname, parent.relname
             FROM pg_constraint con
             JOIN pg_class child ON child.oid = con.conrelid
             JOIN pg_class parent ON parent.oid = con.confrelid
             JOIN pg_namespace n ON n.oid = child.relnamespace
             WHERE con.contype = 'f' AND n.nspname = 'public'",
            &[],
        )
        .await
        .context("Failed to list foreign keys")?;
    let edges: Vec<(String, String)> = fk_rows
        .iter()
        .map(|r| (r.get::<_, String>(0), r.get::<_, String>(1)))
        .collect();

    let mut tables = Vec::new();
    for name in &names {
        let pk_cols = match pks.get(name) {
            Some(cols) if cols.len() == 1 => cols,
            Some(_) => {
                tracing::warn!("skipping {}: composite primary key", name);
                continue;
            }
            None => {
                tracing::warn!("skipping {}: no primary key", name);
                continue;
            }
        };
        let id_col = pk_cols[0].clone();
        let table_columns = columns.get(name).cloned().unwrap_or_default();
        let id_type = table_columns
            .iter()
            .find(|(c, _)| c == &id_col)
            .map(|(_, dt)| IdType::from_data_type(dt))
            .unwrap_or(IdType::Other);

        tables.push(Table {
            name: name.clone(),
            id_col,
            id_type,
            columns: table_columns.into_iter().map(|(c, _)| c).collect(),
        });
    }

    order_by_dependency(tables, &edges)
}

/// Sort tables so every foreign-key parent precedes its children.
///
/// Kahn's algorithm over the FK edge list, name-stable among ready tables.
/// Self-references and edges to unknown tables are ignored; a residual cycle
/// is an error since apply order would be undefined.
fn order_by_dependency(tables: Vec<Table>, edges: &[(String, String)]) -> Result<Vec<Table>> {
    let known: HashSet<&str> = tables.iter().map(|t| t.name.as_str()).collect();

    // parent -> children, plus per-child count of unemitted parents
    let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut pending_parents: BTreeMap<&str, usize> = tables
        .iter()
        .map(|t| (t.name.as_str(), 0usize))
        .collect();

    let mut seen_edges = HashSet::new();
    for (child, parent) in edges {
        if child == parent {
            continue;
        }
        if !known.contains(child.as_str()) || !known.contains(parent.as_str()) {
            continue;
        }
        if !seen_edges.insert((child.as_str(), parent.as_str())) {
            continue;
        }
        children.entry(parent.as_str()).or_default().push(child.as_str());
        *pending_parents.get_mut(child.as_str()).expect("known table") += 1;
    }

    let mut ready: Vec<&str> = pending_parents
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(name, _)| *name)
        .collect();
    ready.sort_unstable();

    let mut order = Vec::with_capacity(tables.len());
    while let Some(name) = ready.first().copied() {
        ready.remove(0);
        order.push(name.to_string());
        for child in children.get(name).cloned().unwrap_or_default() {
            let n = pending_parents.get_mut(child).expect("known table");
            *n -= 1;
            if *n == 0 {
                let pos = ready.binary_search(&child).unwrap_or_else(|p| p);
                ready.insert(pos, child);
            }
        }
    }

    if order.len() != tables.len() {
        let stuck: Vec<&str> = pending_parents
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(name, _)| *name)
            .collect();
        bail!("foreign-key cycle among tables: {}", stuck.join(", "));
    }

    let mut by_name: HashMap<String, Table> =
        tables.into_iter().map(|t| (t.name.clone(), t)).collect();
    Ok(order
        .into_iter()
        .map(|name| by_name.remove(&name).expect("ordered table"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> Table {
        Table {
            name: name.to_string(),
            id_col: "id".to_string(),
            id_type: IdType::Integer,
            columns: vec!["id".to_string(), "name".to_string()],
        }
    }

    #[test]
    fn test_skip_sync_flags_internal_tables() {
        assert!(table("change_log").skip_sync());
        assert!(table("switchover_state").skip_sync());
        assert!(!table("users").skip_sync());
    }

    #[test]
    fn test_select_rows_query_shape() {
        let q = table("users").select_rows_query();
        assert!(q.contains("cast(src.\"id\" AS text)"));
        assert!(q.contains("to_jsonb(src)"));
        assert!(q.contains("FROM \"users\" AS src"));
        assert!(q.contains("= ANY($1)"));
    }

    #[test]
    fn test_insert_rows_query_uses_recordset() {
        let q = table("users").insert_rows_query();
        assert_eq!(
            q,
            "INSERT INTO \"users\" SELECT * FROM jsonb_populate_recordset(NULL::\"users\", $1)"
        );
    }

    #[test]
    fn test_update_rows_query_excludes_pk_from_set() {
        let q = table("users").update_rows_query();
        assert!(q.contains("SET \"name\" = src.\"name\""));
        assert!(!q.contains("SET \"id\" = src.\"id\""));
        assert!(q.contains("WHERE dst.\"id\" = src.\"id\""));
    }

    #[test]
    fn test_update_rows_query_pk_only_table() {
        let mut t = table("tags");
        t.columns = vec!["id".to_string()];
        let q = t.update_rows_query();
        assert!(q.contains("SET \"id\" = src.\"id\""));
    }

    #[test]
    fn test_delete_rows_query_shape() {
        let q = table("users").delete_rows_query();
        assert_eq!(q, "DELETE FROM \"users\" WHERE \"id\" = ANY($1)");
    }

    #[test]
    fn test_id_values_integer() {
        let vals = table("users")
            .id_values(&["1".to_string(), "42".to_string()])
            .unwrap();
        match vals {
            IdValues::Integer(v) => assert_eq!(v, vec![1, 42]),
            other => panic!("unexpected coercion: {:?}", other),
        }
    }

    #[test]
    fn test_id_values_rejects_garbage() {
        let err = table("users").id_values(&["xyz".to_string()]).unwrap_err();
        assert!(err.to_string().contains("users"));
    }

    #[test]
    fn test_id_values_uuid() {
        let mut t = table("sessions");
        t.id_type = IdType::Uuid;
        let vals = t
            .id_values(&["6b0bcd3e-0a54-4f9c-8f1e-6f54c1a7b111".to_string()])
            .unwrap();
        assert!(matches!(vals, IdValues::Uuid(ref v) if v.len() == 1));
    }

    #[test]
    fn test_id_type_from_data_type() {
        assert_eq!(IdType::from_data_type("integer"), IdType::Integer);
        assert_eq!(IdType::from_data_type("bigint"), IdType::BigInt);
        assert_eq!(IdType::from_data_type("uuid"), IdType::Uuid);
        assert_eq!(IdType::from_data_type("text"), IdType::Other);
    }

    #[test]
    fn test_order_by_dependency_parents_first() {
        let tables = vec![table("child"), table("parent"), table("grandchild")];
        let edges = vec![
            ("child".to_string(), "parent".to_string()),
            ("grandchild".to_string(), "child".to_string()),
        ];
        let ordered = order_by_dependency(tables, &edges).unwrap();
        let names: Vec<&str> = ordered.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["parent", "child", "grandchild"]);
    }

    #[test]
    fn test_order_by_dependency_stable_without_edges() {
        let tables = vec![table("b"), table("a"), table("c")];
        let ordered = order_by_dependency(tables, &[]).unwrap();
        let names: Vec<&str> = ordered.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_order_by_dependency_ignores_self_reference() {
        let tables = vec![table("node")];
        let edges = vec![("node".to_string(), "node".to_string())];
        let ordered = order_by_dependency(tables, &edges).unwrap();
        assert_eq!(ordered.len(), 1);
    }

    #[test]
    fn test_order_by_dependency_detects_cycle() {
        let tables = vec![table("a"), table("b")];
        let edges = vec![
            ("a".to_string(), "b".to_string()),
            ("b".to_string(), "a".to_string()),
        ];
        let err = order_by_dependency(tables, &edges).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }
}
