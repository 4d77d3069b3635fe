//! SQLite row store.
//!
//! One table per statistic kind, named `statz_<table>`, with columns
//! `uuid`, the kind's declared dimensions, `value` and `timestamp`, and a
//! unique index over `uuid` plus dimensions. Each grouped write runs in a
//! single transaction on tokio's blocking pool; rows that fail are reported
//! back and the rest are committed.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::{BatchWriteOutcome, FailedRecord, RowStore};
use crate::error::StoreError;
use crate::schema::{MergePolicy, SchemaRegistry, StatSchema};
use crate::types::{Dimensions, PlayerId, StatKind, StatRecord, StatValue};

/// Row store backed by an SQLite database file.
pub struct SqliteRowStore {
    conn: Arc<Mutex<Connection>>,
    registry: Arc<SchemaRegistry>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteRowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRowStore")
            .field("path", &self.path)
            .finish()
    }
}

fn table_name(kind: StatKind) -> String {
    format!("statz_{}", kind.table_name())
}

fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

fn create_table_sql(schema: &StatSchema) -> String {
    let table = table_name(schema.kind);
    let mut columns = vec![
        "\"id\" INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        "\"uuid\" TEXT NOT NULL".to_string(),
    ];
    columns.extend(schema.dimensions.iter().map(|d| format!("{} TEXT NOT NULL", quote(d))));
    // No declared type: numbers and text keep their own storage class.
    columns.push("\"value\" NOT NULL".to_string());
    columns.push("\"timestamp\" INTEGER NOT NULL".to_string());

    let key_columns = key_columns(schema).join(", ");
    format!(
        "CREATE TABLE IF NOT EXISTS {table} ({});\n\
         CREATE UNIQUE INDEX IF NOT EXISTS \"{}_key\" ON {table} ({key_columns});",
        columns.join(", "),
        table.trim_matches('"'),
        table = quote(&table),
    )
}

fn key_columns(schema: &StatSchema) -> Vec<String> {
    std::iter::once("uuid")
        .chain(schema.dimensions.iter().copied())
        .map(quote)
        .collect()
}

fn upsert_sql(schema: &StatSchema) -> String {
    let table = quote(&table_name(schema.kind));
    let keys = key_columns(schema);
    let mut insert_columns = keys.clone();
    insert_columns.push(quote("value"));
    insert_columns.push(quote("timestamp"));
    let placeholders: Vec<String> = (1..=insert_columns.len()).map(|i| format!("?{i}")).collect();

    let merged = match schema.merge {
        MergePolicy::Sum => "\"value\" + excluded.\"value\"",
        MergePolicy::Max => "MAX(\"value\", excluded.\"value\")",
        MergePolicy::Replace => "excluded.\"value\"",
    };

    format!(
        "INSERT INTO {table} ({}) VALUES ({}) \
         ON CONFLICT ({}) DO UPDATE SET \"value\" = {merged}, \"timestamp\" = excluded.\"timestamp\"",
        insert_columns.join(", "),
        placeholders.join(", "),
        keys.join(", "),
    )
}

fn select_sql(schema: &StatSchema) -> String {
    let mut columns: Vec<String> = schema.dimensions.iter().map(|d| quote(d)).collect();
    columns.push(quote("value"));
    columns.push(quote("timestamp"));
    format!(
        "SELECT {} FROM {} WHERE \"uuid\" = ?1 ORDER BY \"id\"",
        columns.join(", "),
        quote(&table_name(schema.kind)),
    )
}

fn to_sql_value(value: &StatValue) -> Value {
    match value {
        StatValue::Number(n) => Value::Real(*n),
        StatValue::Text(s) => Value::Text(s.clone()),
    }
}

fn from_sql_value(value: Value) -> Result<StatValue, StoreError> {
    match value {
        Value::Real(n) => Ok(StatValue::Number(n)),
        Value::Integer(n) => Ok(StatValue::Number(n as f64)),
        Value::Text(s) => Ok(StatValue::Text(s)),
        other => Err(StoreError::unavailable(format!(
            "unexpected value column type: {other:?}"
        ))),
    }
}

fn upsert_record(tx: &Transaction<'_>, sql: &str, schema: &StatSchema, record: &StatRecord) -> rusqlite::Result<()> {
    let mut params: Vec<Value> = Vec::with_capacity(schema.dimensions.len() + 3);
    params.push(Value::Text(record.player_id.to_string()));
    for dim in &schema.dimensions {
        let value = record.dimensions.get(*dim).cloned().unwrap_or_default();
        params.push(Value::Text(value));
    }
    params.push(to_sql_value(&record.value));
    params.push(Value::Integer(record.timestamp as i64));

    let mut stmt = tx.prepare_cached(sql)?;
    stmt.execute(params_from_iter(params))?;
    Ok(())
}

impl SqliteRowStore {
    /// Opens (or creates) the database at `path` and creates every table
    /// the registry declares.
    ///
    /// The connection runs in WAL mode with a five second busy timeout.
    /// Tables that already exist are left as they are, so reopening a
    /// database keeps its rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the parent directory cannot be created
    /// and [`StoreError::Sqlite`] if the file cannot be opened or a table
    /// cannot be created.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use std::sync::Arc;
    /// # use statz_core::{SchemaRegistry, SqliteRowStore};
    /// let store = SqliteRowStore::open("data/statz.db", Arc::new(SchemaRegistry::builtin()))?;
    /// # Ok::<(), statz_core::StoreError>(())
    /// ```
    pub fn open(path: impl AsRef<Path>, registry: Arc<SchemaRegistry>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )?;
        let store = Self::with_connection(conn, registry, Some(path.clone()))?;
        info!("Opened statistics database at {}", path.display());
        Ok(store)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory(registry: Arc<SchemaRegistry>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, registry, None)
    }

    fn with_connection(
        conn: Connection,
        registry: Arc<SchemaRegistry>,
        path: Option<PathBuf>,
    ) -> Result<Self, StoreError> {
        for schema in registry.schemas() {
            conn.execute_batch(&create_table_sql(schema))?;
        }
        debug!("Ensured {} statistic tables", registry.schemas().len());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            registry,
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn write_blocking(
        conn: &Mutex<Connection>,
        schema: &StatSchema,
        records: Vec<StatRecord>,
    ) -> Result<BatchWriteOutcome, StoreError> {
        let sql = upsert_sql(schema);
        let mut conn = conn.lock();
        let tx = conn.transaction()?;

        let mut outcome = BatchWriteOutcome::default();
        for record in records {
            match upsert_record(&tx, &sql, schema, &record) {
                Ok(()) => outcome.written += 1,
                Err(e) => {
                    warn!("Failed to upsert {} row for {}: {}", schema.kind, record.player_id, e);
                    outcome.failed.push(FailedRecord {
                        record,
                        reason: e.to_string(),
                    });
                }
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    fn read_blocking(
        conn: &Mutex<Connection>,
        schema: &StatSchema,
        player_id: PlayerId,
    ) -> Result<Vec<StatRecord>, StoreError> {
        let conn = conn.lock();
        let mut stmt = conn.prepare_cached(&select_sql(schema))?;
        let dims = schema.dimensions.len();

        let rows = stmt.query_map([player_id.to_string()], |row| {
            let mut dimensions = Dimensions::new();
            for (i, name) in schema.dimensions.iter().enumerate() {
                dimensions.insert((*name).to_string(), row.get::<_, String>(i)?);
            }
            let value: Value = row.get(dims)?;
            let timestamp: i64 = row.get(dims + 1)?;
            Ok((dimensions, value, timestamp))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (dimensions, value, timestamp) = row?;
            records.push(StatRecord {
                player_id,
                kind: schema.kind,
                dimensions,
                value: from_sql_value(value)?,
                timestamp: timestamp.max(0) as u64,
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl RowStore for SqliteRowStore {
    #[instrument(skip(self, schema, records), fields(kind = %schema.kind, rows = records.len()))]
    async fn write_batch(
        &self,
        schema: &StatSchema,
        records: Vec<StatRecord>,
    ) -> Result<BatchWriteOutcome, StoreError> {
        let conn = self.conn.clone();
        let schema = schema.clone();
        tokio::task::spawn_blocking(move || Self::write_blocking(&conn, &schema, records))
            .await
            .map_err(|e| StoreError::Task {
                message: e.to_string(),
            })?
    }

    async fn read_all(
        &self,
        player_id: PlayerId,
        kind: StatKind,
    ) -> Result<Vec<StatRecord>, StoreError> {
        let schema = self
            .registry
            .schema(kind)
            .map_err(|e| StoreError::unavailable(e.to_string()))?
            .clone();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || Self::read_blocking(&conn, &schema, player_id))
            .await
            .map_err(|e| StoreError::Task {
                message: e.to_string(),
            })?
    }
}
