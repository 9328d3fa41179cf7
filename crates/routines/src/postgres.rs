use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use taskline_contracts::{RawResult, Record, Scalar, Table};
use time::{Date, OffsetDateTime, PrimitiveDateTime};

use crate::backend::{RoutineBackend, RoutineSession};
use crate::binder::{BoundCall, fetch_cursor_sql};
use crate::error::{Failure, Fault};

pub const DEFAULT_BUSINESS_SQLSTATE: &str = "51000";

#[derive(Debug, Clone)]
pub struct PgBackendOptions {
    pub call_timeout: Duration,
    /// SQLSTATE a routine raises to signal a business-rule rejection.
    pub business_sqlstate: String,
}

impl Default for PgBackendOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            business_sqlstate: DEFAULT_BUSINESS_SQLSTATE.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgPoolSettings {
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl Default for PgPoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 8,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
pub struct PgBackend {
    pool: sqlx::PgPool,
    options: PgBackendOptions,
}

impl PgBackend {
    pub fn new(pool: sqlx::PgPool, options: PgBackendOptions) -> Self {
        Self { pool, options }
    }

    pub async fn connect(
        db_url: &str,
        settings: &PgPoolSettings,
        options: PgBackendOptions,
    ) -> Result<Self, Fault> {
        let pool = tokio::time::timeout(
            settings.connect_timeout,
            PgPoolOptions::new()
                .max_connections(settings.max_connections)
                .acquire_timeout(settings.connect_timeout)
                .connect(db_url),
        )
        .await
        .map_err(|_| Fault::Timeout)??;

        Ok(Self::new(pool, options))
    }

    pub async fn migrate(&self) -> Result<(), Fault> {
        tokio::time::timeout(Duration::from_secs(10), crate::migrate(&self.pool))
            .await
            .map_err(|_| Fault::Timeout)??;
        Ok(())
    }
}

#[async_trait]
impl RoutineBackend for PgBackend {
    async fn invoke(&self, call: &BoundCall) -> Result<RawResult, Failure> {
        let options = &self.options;
        with_timeout(options.call_timeout, async {
            if call.cursors {
                // Cursors only live as long as the transaction that opened them.
                let mut tx = self.pool.begin().await.map_err(Fault::from)?;
                let result = run_call(&mut tx, call, options).await?;
                tx.commit().await.map_err(|err| classify(err, options))?;
                Ok(result)
            } else {
                let mut conn = self.pool.acquire().await.map_err(Fault::from)?;
                run_call(&mut conn, call, options).await
            }
        })
        .await
    }

    async fn begin(&self) -> Result<Box<dyn RoutineSession>, Failure> {
        let tx = with_timeout(self.options.call_timeout, async {
            Ok(self.pool.begin().await.map_err(Fault::from)?)
        })
        .await?;
        Ok(Box::new(PgSession {
            tx,
            options: self.options.clone(),
        }))
    }

    async fn ping(&self) -> Result<(), Failure> {
        with_timeout(Duration::from_millis(500), async {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(Fault::from)?;
            Ok(())
        })
        .await
    }
}

struct PgSession {
    tx: sqlx::Transaction<'static, sqlx::Postgres>,
    options: PgBackendOptions,
}

#[async_trait]
impl RoutineSession for PgSession {
    async fn invoke(&mut self, call: &BoundCall) -> Result<RawResult, Failure> {
        let options = &self.options;
        let conn: &mut PgConnection = &mut self.tx;
        with_timeout(options.call_timeout, run_call(conn, call, options)).await
    }

    async fn commit(self: Box<Self>) -> Result<(), Failure> {
        let PgSession { tx, options } = *self;
        with_timeout(options.call_timeout, async {
            tx.commit().await.map_err(|err| classify(err, &options))
        })
        .await
    }

    async fn rollback(self: Box<Self>) -> Result<(), Failure> {
        let PgSession { tx, options } = *self;
        with_timeout(options.call_timeout, async {
            Ok(tx.rollback().await.map_err(Fault::from)?)
        })
        .await
    }
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, Failure>
where
    F: std::future::Future<Output = Result<T, Failure>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Failure::Infrastructure(Fault::Timeout))?
}

async fn run_call(
    conn: &mut PgConnection,
    call: &BoundCall,
    options: &PgBackendOptions,
) -> Result<RawResult, Failure> {
    let mut query = sqlx::query(&call.sql);
    for arg in call.args() {
        query = match arg {
            Scalar::Null => query,
            Scalar::Bool(v) => query.bind(*v),
            Scalar::Int(v) => query.bind(*v),
            Scalar::Float(v) => query.bind(*v),
            Scalar::Text(v) => query.bind(v.as_str()),
            Scalar::Date(v) => query.bind(*v),
            Scalar::Timestamp(v) => query.bind(*v),
        };
    }

    let rows = query
        .fetch_all(&mut *conn)
        .await
        .map_err(|err| classify(err, options))?;

    if !call.cursors {
        return Ok(RawResult::single(decode_rows(&rows)?));
    }

    let mut cursors = Vec::with_capacity(rows.len());
    for row in &rows {
        let name: Option<String> = row.try_get(0).map_err(Fault::from)?;
        if let Some(name) = name {
            cursors.push(name);
        }
    }

    let mut out = RawResult::default();
    for cursor in cursors {
        let rows = sqlx::query(&fetch_cursor_sql(&cursor))
            .fetch_all(&mut *conn)
            .await
            .map_err(|err| classify(err, options))?;
        let table = decode_rows(&rows)?;
        out.rows_affected += table.len() as u64;
        out.tables.push(table);
    }
    Ok(out)
}

/// Business-rule rejections are recognized by SQLSTATE; everything else is an
/// infrastructure fault.
fn classify(err: sqlx::Error, options: &PgBackendOptions) -> Failure {
    if let sqlx::Error::Database(db) = &err
        && db.code().as_deref() == Some(options.business_sqlstate.as_str())
    {
        return Failure::Business {
            code: options.business_sqlstate.clone(),
            message: db.message().to_string(),
        };
    }
    Failure::Infrastructure(Fault::Sqlx(err))
}

fn decode_rows(rows: &[PgRow]) -> Result<Table, Fault> {
    rows.iter().map(decode_row).collect()
}

fn decode_row(row: &PgRow) -> Result<Record, Fault> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let type_name = column.type_info().name();
        let value = match type_name {
            "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(Scalar::Bool),
            "INT2" => row
                .try_get::<Option<i16>, _>(idx)?
                .map(|v| Scalar::Int(i64::from(v))),
            "INT4" => row
                .try_get::<Option<i32>, _>(idx)?
                .map(|v| Scalar::Int(i64::from(v))),
            "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(Scalar::Int),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(idx)?
                .map(|v| Scalar::Float(f64::from(v))),
            "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(Scalar::Float),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                row.try_get::<Option<String>, _>(idx)?.map(Scalar::Text)
            }
            "DATE" => row.try_get::<Option<Date>, _>(idx)?.map(Scalar::Date),
            "TIMESTAMPTZ" => row
                .try_get::<Option<OffsetDateTime>, _>(idx)?
                .map(Scalar::Timestamp),
            "TIMESTAMP" => row
                .try_get::<Option<PrimitiveDateTime>, _>(idx)?
                .map(|v| Scalar::Timestamp(v.assume_utc())),
            "JSON" | "JSONB" => row
                .try_get::<Option<serde_json::Value>, _>(idx)?
                .map(|v| Scalar::Text(v.to_string())),
            "VOID" => None,
            other => {
                return Err(Fault::UnsupportedColumn {
                    column: column.name().to_string(),
                    type_name: other.to_string(),
                });
            }
        };
        record.insert(column.name().to_string(), value.unwrap_or(Scalar::Null));
    }
    Ok(record)
}
