// ABOUTME: SQL helpers shared across the switchover modules
// ABOUTME: Identifier quoting and multi-statement DDL batch emission

use anyhow::{Context, Result};
use tokio_postgres::Client;

/// Quote a SQL identifier.
///
/// Wraps in double quotes and escapes embedded double quotes. Handles
/// schema-qualified names like `public.orders`.
pub fn quote_ident(name: &str) -> String {
    if name.contains('.') {
        name.split('.')
            .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(".")
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Accumulates statements and sends them as one simple-query batch.
///
/// The simple query protocol runs the whole string in a single implicit
/// transaction, so either every statement applies or none do. Statements
/// cannot carry bind parameters; values must be inlined by the caller.
#[derive(Debug, Default)]
pub struct SqlBatch {
    statements: Vec<String>,
}

impl SqlBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a statement.
    pub fn push(&mut self, statement: impl Into<String>) {
        self.statements.push(statement.into());
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Render the batch as a single semicolon-joined script.
    pub fn script(&self) -> String {
        self.statements.join(";\n")
    }

    /// Execute the whole batch; a failure anywhere rolls back every statement.
    pub async fn execute(&self, client: &Client) -> Result<()> {
        if self.statements.is_empty() {
            return Ok(());
        }
        client
            .batch_execute(&self.script())
            .await
            .with_context(|| format!("Failed to execute batch of {} statements", self.len()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_plain() {
        assert_eq!(quote_ident("users"), "\"users\"");
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_ident_qualified() {
        assert_eq!(quote_ident("public.orders"), "\"public\".\"orders\"");
    }

    #[test]
    fn test_batch_script_joins_statements() {
        let mut batch = SqlBatch::new();
        batch.push("ALTER TABLE \"a\" DISABLE TRIGGER USER");
        batch.push("ALTER TABLE \"b\" DISABLE TRIGGER USER");
        assert_eq!(
            batch.script(),
            "ALTER TABLE \"a\" DISABLE TRIGGER USER;\nALTER TABLE \"b\" DISABLE TRIGGER USER"
        );
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
    }
}
