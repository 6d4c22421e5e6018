//! # Connection Module
//!
//! The capability the mapper needs from a database: run statement trees, report
//! generated keys, and control transactions and savepoints. The sqlx-backed
//! implementation works over an `AnyPool` so one build serves PostgreSQL, MySQL
//! and SQLite.

// ============================================================================
// External Crate Imports
// ============================================================================

use async_trait::async_trait;
use indexmap::IndexMap;
use sqlx::{
    any::{AnyArguments, AnyRow},
    pool::PoolConnection,
    query::Query,
    Any, AnyPool, Column, Row as _, TypeInfo, ValueRef,
};

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{
    database::Drivers,
    query::{
        ast::{Insert, Statement},
        Serializer, Sql,
    },
    value::Value,
    Result,
};

/// A result row: column alias to value, in projection order.
pub type Row = IndexMap<String, Value>;

// ============================================================================
// Traits
// ============================================================================

/// A single database session.
#[async_trait]
pub trait Connection: Send {
    fn driver(&self) -> Drivers;

    /// Runs a `SELECT` and decodes every row.
    async fn query(&mut self, statement: &Statement) -> Result<Vec<Row>>;

    /// Runs a statement and returns the number of affected rows.
    async fn execute(&mut self, statement: &Statement) -> Result<u64>;

    /// Runs a (multi-row) insert and returns the generated keys, one per row and
    /// in row order, when the insert asks for them.
    async fn insert(&mut self, insert: &Insert) -> Result<Vec<Value>>;

    /// Runs SQL text without parameters.
    async fn execute_raw(&mut self, sql: &str) -> Result<()>;

    async fn begin(&mut self) -> Result<()> {
        let sql = match self.driver() {
            Drivers::MySQL => "START TRANSACTION",
            _ => "BEGIN",
        };
        self.execute_raw(sql).await
    }

    async fn commit(&mut self) -> Result<()> {
        self.execute_raw("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.execute_raw("ROLLBACK").await
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        let sql = format!("SAVEPOINT {}", Serializer::escape_id(self.driver(), name));
        self.execute_raw(&sql).await
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let sql = format!("RELEASE SAVEPOINT {}", Serializer::escape_id(self.driver(), name));
        self.execute_raw(&sql).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", Serializer::escape_id(self.driver(), name));
        self.execute_raw(&sql).await
    }
}

/// A source of connections shared by a `Database` and all of its forks.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    fn driver(&self) -> Drivers;

    async fn get_connection(&self) -> Result<Box<dyn Connection>>;

    /// Closes every connection of the pool.
    async fn end(&self);

    /// Quotes a string literal for inclusion in raw SQL.
    fn escape(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn escape_id(&self, name: &str) -> String {
        Serializer::escape_id(self.driver(), name)
    }
}

// ============================================================================
// sqlx Implementation
// ============================================================================

/// A [`ConnectionPool`] over a sqlx `AnyPool`.
#[derive(Debug, Clone)]
pub struct SqlxPool {
    pool: AnyPool,
    driver: Drivers,
}

impl SqlxPool {
    pub fn new(pool: AnyPool, driver: Drivers) -> Self {
        Self { pool, driver }
    }

    /// The underlying sqlx pool.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

#[async_trait]
impl ConnectionPool for SqlxPool {
    fn driver(&self) -> Drivers {
        self.driver
    }

    async fn get_connection(&self) -> Result<Box<dyn Connection>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(SqlxConnection { conn, driver: self.driver }))
    }

    async fn end(&self) {
        self.pool.close().await;
    }
}

/// A pooled sqlx connection. Returned to the pool on drop.
pub struct SqlxConnection {
    conn: PoolConnection<Any>,
    driver: Drivers,
}

fn bind_params<'q>(mut query: Query<'q, Any, AnyArguments<'q>>, params: &[Value]) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            // the serializer inlines nulls, only hand-built statements get here
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.clone()),
        };
    }
    query
}

fn decode_row(row: &AnyRow) -> Result<Row> {
    let mut result = IndexMap::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        let (is_null, kind) = {
            let raw = row.try_get_raw(i)?;
            (raw.is_null(), raw.type_info().name().to_string())
        };
        let value = if is_null {
            Value::Null
        } else {
            match kind.as_str() {
                "BOOLEAN" => Value::Bool(row.try_get::<bool, _>(i)?),
                "SMALLINT" | "INTEGER" | "BIGINT" => Value::Int(row.try_get::<i64, _>(i)?),
                "REAL" => Value::Float(row.try_get::<f32, _>(i)? as f64),
                "DOUBLE" => Value::Float(row.try_get::<f64, _>(i)?),
                "BLOB" => Value::Text(String::from_utf8_lossy(&row.try_get::<Vec<u8>, _>(i)?).into_owned()),
                _ => Value::Text(row.try_get::<String, _>(i)?),
            }
        };
        result.insert(column.name().to_string(), value);
    }
    Ok(result)
}

impl SqlxConnection {
    fn render(&self, statement: &Statement) -> Sql {
        let sql = Serializer::serialize(self.driver, statement);
        log::debug!("{} ({} params)", sql.text, sql.params.len());
        sql
    }
}

#[async_trait]
impl Connection for SqlxConnection {
    fn driver(&self) -> Drivers {
        self.driver
    }

    async fn query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        let sql = self.render(statement);
        let rows = bind_params(sqlx::query(&sql.text), &sql.params).fetch_all(&mut *self.conn).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        let sql = self.render(statement);
        let result = bind_params(sqlx::query(&sql.text), &sql.params).execute(&mut *self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn insert(&mut self, insert: &Insert) -> Result<Vec<Value>> {
        let count = insert.rows.len().max(1) as i64;
        let sql = self.render(&Statement::Insert(insert.clone()));
        let query = bind_params(sqlx::query(&sql.text), &sql.params);

        if insert.returning.is_none() {
            query.execute(&mut *self.conn).await?;
            return Ok(Vec::new());
        }

        match self.driver {
            Drivers::Postgres => {
                let rows = query.fetch_all(&mut *self.conn).await?;
                let mut ids = Vec::with_capacity(rows.len());
                for row in &rows {
                    ids.extend(decode_row(row)?.into_values().next());
                }
                Ok(ids)
            }
            Drivers::MySQL => {
                let result = query.execute(&mut *self.conn).await?;
                // the first id of a multi-row insert
                Ok(result.last_insert_id().map(|first| (first..first + count).map(Value::Int).collect()).unwrap_or_default())
            }
            Drivers::SQLite => {
                let result = query.execute(&mut *self.conn).await?;
                Ok(result
                    .last_insert_id()
                    .map(|last| (last - count + 1..=last).map(Value::Int).collect())
                    .unwrap_or_default())
            }
        }
    }

    async fn execute_raw(&mut self, sql: &str) -> Result<()> {
        log::debug!("{}", sql);
        let conn: &mut sqlx::AnyConnection = &mut *self.conn;
        sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?;
        Ok(())
    }
}
