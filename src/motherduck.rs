//! MotherDuck client and operations for pg-warehouse-sync.

use crate::config::MotherDuckConfig;
use crate::destination::{Destination, InsertError};
use crate::error::{Error, Result};
use crate::sanitize::SanitizedRow;
use crate::schema::{quote_ident, DestinationSchema};
use duckdb::{params, params_from_iter, Connection};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// MotherDuck client wrapper.
///
/// The DuckDB connection is not `Sync`, so it lives behind an async mutex and
/// every operation holds the lock for its whole statement sequence.
pub struct MotherDuckClient {
    conn: Mutex<Connection>,
    config: MotherDuckConfig,
}

impl MotherDuckClient {
    /// Connect to MotherDuck.
    #[instrument(skip(config), fields(database = %config.database))]
    pub fn connect(config: MotherDuckConfig) -> Result<Self> {
        info!("Connecting to MotherDuck...");

        // First connect without specifying database to create it if needed
        if config.create_database {
            let init_conn_str = format!("md:?motherduck_token={}", config.token);
            let init_conn = Connection::open(&init_conn_str)
                .map_err(|e| Error::motherduck_connection("Failed to connect to MotherDuck", e))?;

            let create_db = format!(
                "CREATE DATABASE IF NOT EXISTS {}",
                quote_ident(&config.database)
            );
            init_conn
                .execute(&create_db, [])
                .map_err(|e| Error::motherduck_query("", "Failed to create database", e))?;

            info!("Ensured database exists: {}", config.database);
        }

        let conn_str = format!("md:{}?motherduck_token={}", config.database, config.token);
        let conn = Connection::open(&conn_str)
            .map_err(|e| Error::motherduck_connection("Failed to connect to database", e))?;

        info!("Connected to MotherDuck database: {}", config.database);
        Ok(Self::from_connection(conn, config))
    }

    /// Open a local in-memory DuckDB database with the same behavior.
    pub fn open_in_memory(config: MotherDuckConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::motherduck_connection("Failed to open in-memory database", e))?;
        Ok(Self::from_connection(conn, config))
    }

    fn from_connection(conn: Connection, config: MotherDuckConfig) -> Self {
        Self {
            conn: Mutex::new(conn),
            config,
        }
    }

    /// Test connectivity.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("SELECT 1", [])
            .map_err(|e| Error::motherduck_query("", "Ping failed", e))?;
        Ok(())
    }

    /// Ensure schema exists.
    pub async fn ensure_schema(&self) -> Result<()> {
        if self.config.schema != "main" {
            let query = format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                quote_ident(&self.config.schema)
            );
            let conn = self.conn.lock().await;
            conn.execute(&query, [])
                .map_err(|e| Error::motherduck_query("", "Create schema failed", e))?;
        }
        Ok(())
    }

    /// Get row count for a table.
    pub async fn count_rows(&self, table: &str) -> Result<i64> {
        let query = format!("SELECT COUNT(*) FROM {}", self.qualified(table));
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&query)
            .map_err(|e| Error::motherduck_query(table, "Prepare count failed", e))?;

        let count: i64 = stmt
            .query_row([], |row| row.get(0))
            .map_err(|e| Error::motherduck_query(table, "Count failed", e))?;

        Ok(count)
    }

    /// Current columns of a table, in declaration order.
    pub async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        self.read_columns(&conn, table)
    }

    fn read_columns(&self, conn: &Connection, table: &str) -> Result<Vec<String>> {
        let mut stmt = conn
            .prepare(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_catalog = current_database() \
                 AND table_schema = ? AND table_name = ? \
                 ORDER BY ordinal_position",
            )
            .map_err(|e| Error::motherduck_query(table, "Prepare column lookup failed", e))?;

        let columns = stmt
            .query_map(params![self.config.schema, table], |row| row.get::<_, String>(0))
            .map_err(|e| Error::motherduck_query(table, "Column lookup failed", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::motherduck_query(table, "Column lookup failed", e))?;

        Ok(columns)
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.config.schema), quote_ident(table))
    }
}

impl Destination for MotherDuckClient {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_catalog = current_database() \
                 AND table_schema = ? AND table_name = ?",
            )
            .map_err(|e| Error::motherduck_query(table, "Check table exists failed", e))?;

        let count: i64 = stmt
            .query_row(params![self.config.schema, table], |row| row.get(0))
            .map_err(|e| Error::motherduck_query(table, "Check table exists failed", e))?;

        Ok(count > 0)
    }

    #[instrument(skip(self, schema), fields(table = %schema.table))]
    async fn create_table(&self, schema: &DestinationSchema) -> Result<()> {
        let ddl = schema.to_duckdb_ddl(&self.config.schema);
        debug!("Creating table with DDL: {}", ddl);

        let conn = self.conn.lock().await;
        conn.execute(&ddl, [])
            .map_err(|e| Error::motherduck_query(&schema.table, "Create table failed", e))?;

        info!("Created table: {}", schema.table);
        Ok(())
    }

    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn insert_rows(
        &self,
        table: &str,
        rows: &[SanitizedRow],
    ) -> std::result::Result<(), InsertError> {
        if rows.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().await;
        let columns = self
            .read_columns(&conn, table)
            .map_err(|e| InsertError::new(e.to_string()))?;
        if columns.is_empty() {
            return Err(InsertError::new(format!("Table '{}' has no columns", table)));
        }

        let query = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualified(table),
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            vec!["?"; columns.len()].join(", ")
        );

        conn.execute("BEGIN TRANSACTION", [])
            .map_err(|e| InsertError::new(format!("Begin transaction failed: {}", e)))?;

        let outcome = insert_projected(&conn, &query, &columns, rows);

        match outcome {
            Ok(()) => {
                if let Err(e) = conn.execute("COMMIT", []) {
                    let _ = conn.execute("ROLLBACK", []);
                    return Err(InsertError::new(format!("Commit failed: {}", e)));
                }
                debug!("Inserted {} rows into {}", rows.len(), table);
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }
}

/// Insert each row projected onto `columns`, stopping at the first failure.
fn insert_projected(
    conn: &Connection,
    query: &str,
    columns: &[String],
    rows: &[SanitizedRow],
) -> std::result::Result<(), InsertError> {
    let mut stmt = conn
        .prepare(query)
        .map_err(|e| InsertError::new(format!("Prepare insert failed: {}", e)))?;

    for (idx, row) in rows.iter().enumerate() {
        let values = columns.iter().map(|c| row.value(c));
        stmt.execute(params_from_iter(values)).map_err(|e| {
            InsertError::new(format!("Insert failed at row {}", idx)).with_row_error(idx, e.to_string())
        })?;
    }

    Ok(())
}
