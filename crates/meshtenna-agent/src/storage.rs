//! SQLite storage for samples.
//!
//! The engine never talks to the pool directly: every read and write is a
//! [`StorageOp`] carrying parameterized SQL, executed through the
//! [`PersistenceQueue`](crate::persistence::PersistenceQueue).

use std::future::Future;
use std::path::Path;

use sqlx::query::Query as SqlxQuery;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, Sqlite};
use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

// ── Values ──────────────────────────────────────────────────────────

/// A single SQL value, either bound as a parameter or read from a column.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text content, or an empty string for anything else.
    pub fn into_text(self) -> String {
        match self {
            Value::Text(s) => s,
            _ => String::new(),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

pub type Row = Vec<Value>;

// ── Operations ──────────────────────────────────────────────────────

/// Parameterized SQL with positional `?` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageOp {
    ReadOne(Query),
    ReadAll(Query),
    Write(Query),
}

impl StorageOp {
    pub fn query(&self) -> &Query {
        match self {
            StorageOp::ReadOne(q) | StorageOp::ReadAll(q) | StorageOp::Write(q) => q,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StorageOp::ReadOne(_) => "read_one",
            StorageOp::ReadAll(_) => "read_all",
            StorageOp::Write(_) => "write",
        }
    }
}

/// Result of one operation. Reads fill `rows`; writes fill `rows_affected`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpOutput {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

/// Executes one storage operation to completion.
pub trait Storage: Send + Sync + 'static {
    fn execute(&self, op: &StorageOp) -> impl Future<Output = Result<OpOutput, StorageError>> + Send;
}

// ── SQLite ──────────────────────────────────────────────────────────

/// Connection pool over the samples database.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        tracing::info!("connected to SQLite");
        Ok(Self { pool })
    }

    /// Run embedded SQL migrations.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("database migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl Storage for SqliteStorage {
    async fn execute(&self, op: &StorageOp) -> Result<OpOutput, StorageError> {
        let query = op.query();
        let mut tx = self.pool.begin().await?;

        let output = match op {
            StorageOp::ReadOne(_) => {
                let row = bind_params(sqlx::query(&query.sql), &query.params)
                    .fetch_optional(&mut *tx)
                    .await?;
                OpOutput {
                    rows: row.iter().map(decode_row).collect(),
                    rows_affected: 0,
                }
            }
            StorageOp::ReadAll(_) => {
                let rows = bind_params(sqlx::query(&query.sql), &query.params)
                    .fetch_all(&mut *tx)
                    .await?;
                OpOutput {
                    rows: rows.iter().map(decode_row).collect(),
                    rows_affected: 0,
                }
            }
            StorageOp::Write(_) => {
                let result = bind_params(sqlx::query(&query.sql), &query.params)
                    .execute(&mut *tx)
                    .await?;
                OpOutput {
                    rows: Vec::new(),
                    rows_affected: result.rows_affected(),
                }
            }
        };

        tx.commit().await?;
        Ok(output)
    }
}

fn bind_params<'q>(
    mut query: SqlxQuery<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [Value],
) -> SqlxQuery<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<i64>),
            Value::Integer(v) => query.bind(*v),
            Value::Real(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
        };
    }
    query
}

fn decode_row(row: &SqliteRow) -> Row {
    (0..row.len()).map(|i| decode_column(row, i)).collect()
}

/// Columns of aggregate expressions carry no declared type, so decode by
/// the runtime storage class: integer first, then real, then text.
fn decode_column(row: &SqliteRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(Value::Null, Value::Integer);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map_or(Value::Null, Value::Real);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(Value::Null, Value::Text);
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_storage() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(&dir.path().join("test.db")).await.unwrap();
        storage.migrate().await.unwrap();
        (dir, storage)
    }

    #[test]
    fn option_values_map_to_null() {
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some(-80)), Value::Integer(-80));
        assert_eq!(Value::from(Some(2.5)), Value::Real(2.5));
    }

    #[test]
    fn numeric_values_widen_to_f64() {
        assert_eq!(Value::Integer(-80).as_f64(), Some(-80.0));
        assert_eq!(Value::Real(1.5).as_f64(), Some(1.5));
        assert_eq!(Value::Text("x".into()).as_f64(), None);
        assert_eq!(Value::Null.as_f64(), None);
    }

    #[tokio::test]
    async fn write_then_read_decodes_storage_classes() {
        let (_dir, storage) = temp_storage().await;

        let insert = Query::new("INSERT INTO results (antenna_name, rssi, snr) VALUES (?, ?, ?)")
            .bind("yagi")
            .bind(-72)
            .bind(Some(4.5));
        let out = storage.execute(&StorageOp::Write(insert)).await.unwrap();
        assert_eq!(out.rows_affected, 1);

        let read = Query::new("SELECT antenna_name, rssi, snr, notes FROM results");
        let out = storage.execute(&StorageOp::ReadOne(read)).await.unwrap();
        assert_eq!(
            out.rows,
            vec![vec![
                Value::Text("yagi".into()),
                Value::Integer(-72),
                Value::Real(4.5),
                Value::Null,
            ]]
        );
    }

    #[tokio::test]
    async fn aggregates_over_empty_table_are_null() {
        let (_dir, storage) = temp_storage().await;
        let read = Query::new("SELECT MIN(rssi), MAX(rssi) FROM results");
        let out = storage.execute(&StorageOp::ReadOne(read)).await.unwrap();
        assert_eq!(out.rows, vec![vec![Value::Null, Value::Null]]);
    }

    #[tokio::test]
    async fn invalid_sql_is_an_error() {
        let (_dir, storage) = temp_storage().await;
        let read = Query::new("SELECT nope FROM missing_table");
        assert!(storage.execute(&StorageOp::ReadAll(read)).await.is_err());
    }
}
