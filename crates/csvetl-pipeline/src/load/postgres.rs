//! PostgreSQL sink
//!
//! One transaction per batch. Rows go in as multi-row `INSERT` statements, chunked to stay
//! under the bind-parameter limit; the transaction commits only after every chunk is in.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{info, warn};

use super::sink::{Sink, SinkError, SinkErrorKind};
use crate::transform::schema::{ColumnType, TargetSchema};
use crate::types::{LoadBatch, TransformedRecord, Value};

/// Postgres accepts at most 65535 bind parameters per statement
const MAX_BIND_PARAMS: usize = 65_535;

/// Pool settings for `PostgresSink::connect`
#[derive(Debug, Clone)]
pub struct PgConnectOptions {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
}

pub struct PostgresSink {
    pool: PgPool,
    schema: Option<String>,
    table: String,
    columns: Vec<String>,
    column_types: Vec<ColumnType>,
    rows_per_statement: usize,
}

impl PostgresSink {
    pub fn new(pool: PgPool, schema: Option<&str>, table: &str, target: &TargetSchema) -> Self {
        let columns: Vec<String> = target.columns().iter().map(|c| c.name.clone()).collect();
        let rows_per_statement = (MAX_BIND_PARAMS / columns.len().max(1)).max(1);
        Self {
            pool,
            schema: schema.map(str::to_string),
            table: table.to_string(),
            column_types: target.columns().iter().map(|c| c.column_type).collect(),
            columns,
            rows_per_statement,
        }
    }

    /// Open the pool, retrying with a fixed delay, then check the target table exists
    pub async fn connect(
        options: &PgConnectOptions,
        schema: Option<&str>,
        table: &str,
        target: &TargetSchema,
    ) -> Result<Self, SinkError> {
        let attempts = options.connect_attempts.max(1);
        let mut attempt = 0;

        let pool = loop {
            attempt += 1;
            let result = PgPoolOptions::new()
                .max_connections(options.max_connections)
                .acquire_timeout(options.connect_timeout)
                .connect(&options.url)
                .await;

            match result {
                Ok(pool) => break pool,
                Err(e) if attempt < attempts => {
                    warn!(
                        "Connection attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, attempts, e, options.retry_delay
                    );
                    tokio::time::sleep(options.retry_delay).await;
                },
                Err(e) => {
                    return Err(SinkError::new(
                        SinkErrorKind::Connection,
                        format!("could not connect after {attempt} attempts: {e}"),
                    ));
                },
            }
        };

        info!(max_connections = options.max_connections, "Connected to PostgreSQL");

        let sink = Self::new(pool, schema, table, target);
        sink.verify_table().await?;
        Ok(sink)
    }

    /// Fail early when the target table is missing; tables are never created here
    pub async fn verify_table(&self) -> Result<(), SinkError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = COALESCE($1, current_schema())
                  AND table_name = $2
            )
            "#,
        )
        .bind(self.schema.as_deref())
        .bind(&self.table)
        .fetch_one(&self.pool)
        .await
        .map_err(into_sink_error)?;

        if exists {
            Ok(())
        } else {
            Err(SinkError::new(
                SinkErrorKind::SchemaMismatch,
                format!("table {} does not exist", self.qualified_table()),
            ))
        }
    }

    fn qualified_table(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.table)),
            None => quote_ident(&self.table),
        }
    }

    fn insert_prefix(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        format!("INSERT INTO {} ({}) ", self.qualified_table(), columns.join(", "))
    }

    async fn insert(&self, records: &[TransformedRecord]) -> Result<(), sqlx::Error> {
        let prefix = self.insert_prefix();
        let mut tx = self.pool.begin().await?;

        for chunk in records.chunks(self.rows_per_statement) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(&prefix);
            query_builder.push_values(chunk, |mut row, record| {
                for (value, column_type) in record.values().iter().zip(&self.column_types) {
                    bind_value(&mut row, value, *column_type);
                }
            });
            query_builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await
    }
}

#[async_trait]
impl Sink for PostgresSink {
    async fn submit(&self, batch: &LoadBatch) -> Result<(), SinkError> {
        // dropping an uncommitted transaction rolls it back
        self.insert(batch.records()).await.map_err(into_sink_error)
    }

    fn describe(&self) -> String {
        format!("postgres:{}", self.qualified_table())
    }
}

fn bind_value<Sep: std::fmt::Display>(
    row: &mut Separated<'_, '_, Postgres, Sep>,
    value: &Value,
    column_type: ColumnType,
) {
    match value {
        Value::Null => match column_type {
            ColumnType::Text => row.push_bind(None::<String>),
            ColumnType::Integer => row.push_bind(None::<i64>),
            ColumnType::Float => row.push_bind(None::<f64>),
            ColumnType::Boolean => row.push_bind(None::<bool>),
            ColumnType::Date => row.push_bind(None::<chrono::NaiveDate>),
            ColumnType::DateTime => row.push_bind(None::<chrono::NaiveDateTime>),
        },
        Value::Text(s) => row.push_bind(s.clone()),
        Value::Integer(i) => row.push_bind(*i),
        Value::Float(f) => row.push_bind(*f),
        Value::Boolean(b) => row.push_bind(*b),
        Value::Date(d) => row.push_bind(*d),
        Value::DateTime(dt) => row.push_bind(*dt),
    };
}

/// Quote an identifier, doubling embedded quotes
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn into_sink_error(err: sqlx::Error) -> SinkError {
    SinkError::new(classify(&err), err.to_string())
}

/// Map a driver error onto a sink failure class
pub fn classify(err: &sqlx::Error) -> SinkErrorKind {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| classify_sqlstate(&code))
            .unwrap_or(SinkErrorKind::Other),
        sqlx::Error::PoolTimedOut => SinkErrorKind::Timeout,
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => SinkErrorKind::Connection,
        _ => SinkErrorKind::Other,
    }
}

/// Classify a five-character SQLSTATE
pub fn classify_sqlstate(code: &str) -> SinkErrorKind {
    match code {
        "40001" | "40P01" => SinkErrorKind::Conflict,
        "57014" => SinkErrorKind::Timeout,
        c if c.starts_with("23") => SinkErrorKind::Constraint,
        c if c.starts_with("42") || c.starts_with("22") => SinkErrorKind::SchemaMismatch,
        c if c.starts_with("08") || c.starts_with("57P") => SinkErrorKind::Connection,
        _ => SinkErrorKind::Other,
    }
}
