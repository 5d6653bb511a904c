//! Destination schema types and DDL generation.

use crate::sanitize::SanitizedRow;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Schema of a destination table, as created by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationSchema {
    /// Table name
    pub table: String,
    /// Columns, in creation order
    pub columns: Vec<Column>,
}

impl DestinationSchema {
    /// Create an empty schema for a table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
        }
    }

    /// Infer a schema from a sanitized sample row.
    ///
    /// Every key of the sample becomes a text column. Keys that only appear in
    /// later rows are not part of the schema.
    pub fn infer(table: impl Into<String>, sample: &SanitizedRow) -> Self {
        Self {
            table: table.into(),
            columns: sample
                .keys()
                .map(|name| Column::new(name, ColumnType::Text))
                .collect(),
        }
    }

    /// Add a column.
    pub fn add_column(&mut self, column: Column) {
        self.columns.push(column);
    }

    /// Column names in order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Generate CREATE TABLE DDL for DuckDB/MotherDuck.
    pub fn to_duckdb_ddl(&self, schema: &str) -> String {
        let col_defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("    {} {}", quote_ident(&c.name), c.column_type.to_duckdb()))
            .collect();

        format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (\n{}\n)",
            quote_ident(schema),
            quote_ident(&self.table),
            col_defs.join(",\n")
        )
    }
}

/// Column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Column type
    pub column_type: ColumnType,
}

impl Column {
    /// Create a new column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Column types the engine declares on destination tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Generic text
    Text,
}

impl ColumnType {
    /// Convert to DuckDB type string.
    pub fn to_duckdb(&self) -> &'static str {
        match self {
            ColumnType::Text => "VARCHAR",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_duckdb())
    }
}

/// Quote an SQL identifier, doubling embedded quotes.
///
/// PostgreSQL and DuckDB share this quoting rule.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SanitizedRow {
        vec![
            ("id", Some("1".to_string())),
            ("note", None),
            ("created_at", Some("2024-01-01T00:00:00.000Z".to_string())),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_infer_from_first_row() {
        let schema = DestinationSchema::infer("orders", &sample());

        assert_eq!(schema.table, "orders");
        assert_eq!(schema.column_names(), vec!["id", "note", "created_at"]);
        assert!(schema.columns.iter().all(|c| c.column_type == ColumnType::Text));
    }

    #[test]
    fn test_table_ddl() {
        let schema = DestinationSchema::infer("orders", &sample());
        let ddl = schema.to_duckdb_ddl("main");

        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"main\".\"orders\" ("));
        assert!(ddl.contains("\"id\" VARCHAR,"));
        assert!(ddl.contains("\"created_at\" VARCHAR\n)"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_add_column() {
        let mut schema = DestinationSchema::new("events");
        schema.add_column(Column::new("payload", ColumnType::Text));
        assert_eq!(schema.column_names(), vec!["payload"]);
        assert_eq!(ColumnType::Text.to_string(), "VARCHAR");
    }
}
