//! # Database Module
//!
//! The unit of work. A [`Database`] owns the in-memory records of every table,
//! shares a connection pool and a schema with its forks, and knows how to create
//! the mapped tables. Records are written back by the flush engine.

// ============================================================================
// External Crate Imports
// ============================================================================

use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{
    connection::{ConnectionPool, SqlxPool},
    query::Serializer,
    record::{MergeSet, Record, RecordId},
    schema::{Field, Model, ModelId, Schema},
    table::Table,
    value::Document,
    Error, Result,
};

// ============================================================================
// Database Driver Enum
// ============================================================================

/// Supported database drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drivers {
    /// PostgreSQL driver
    Postgres,
    /// MySQL driver
    MySQL,
    /// SQLite driver
    SQLite,
}

impl Drivers {
    /// Detects the driver from a connection URL. Anything that is not PostgreSQL
    /// or MySQL is taken to be SQLite.
    pub fn from_url(url: &str) -> Drivers {
        if url.starts_with("postgres") {
            Drivers::Postgres
        } else if url.starts_with("mysql") {
            Drivers::MySQL
        } else {
            Drivers::SQLite
        }
    }
}

// ============================================================================
// Retry Policy
// ============================================================================

/// How often a failed flush transaction is tried again.
///
/// Retries happen after integrity errors (once, dropping to relaxed mode) and
/// after deadlocks. Each retry waits a random delay below `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries until the flush succeeds.
    pub max_retries: Option<u32>,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: Some(10), max_delay: Duration::from_millis(1000) }
    }
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self { max_retries: None, ..Self::default() }
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub(crate) fn allows(&self, retries: u32) -> bool {
        self.max_retries.is_none_or(|max| retries < max)
    }
}

// ============================================================================
// Database Struct
// ============================================================================

/// A unit of work over one schema.
///
/// Records appended to a database stay in memory until [`flush`](Database::flush)
/// writes them. Each table keeps an identity map per unique key, so appending
/// the same row twice yields one record.
///
/// # Example
///
/// ```rust,ignore
/// let mut db = Database::connect("sqlite::memory:", schema).await?;
/// db.create_tables().await?;
/// db.append("User", json!({ "email": "a@b.c", "firstName": "Ann" }))?;
/// db.flush().await?;
/// ```
#[derive(Clone)]
pub struct Database {
    pub(crate) schema: Arc<Schema>,
    pub(crate) pool: Arc<dyn ConnectionPool>,
    pub(crate) tables: Vec<Table>,
    pub(crate) records: Vec<Record>,
    pub(crate) merged: MergeSet,
    pub(crate) retry: RetryPolicy,
}

impl Database {
    pub fn new(schema: Arc<Schema>, pool: Arc<dyn ConnectionPool>) -> Self {
        let tables = schema.models.iter().map(|m| Table::new(m, Arc::clone(&schema), Arc::clone(&pool))).collect();
        Self { schema, pool, tables, records: Vec::new(), merged: MergeSet::default(), retry: RetryPolicy::default() }
    }

    /// Creates a new DatabaseBuilder for configuring the connection.
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    /// Connects to a database using the provided connection string.
    pub async fn connect(url: &str, schema: Schema) -> Result<Self> {
        DatabaseBuilder::new().connect(url, schema).await
    }

    /// An empty database sharing this one's pool, schema and retry policy.
    pub fn fork(&self) -> Database {
        let mut db = Database::new(Arc::clone(&self.schema), Arc::clone(&self.pool));
        db.retry = self.retry;
        db
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    pub fn driver(&self) -> Drivers {
        self.pool.driver()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    /// Looks a table up by model name (`OrderItem`) or table name (`order_item`).
    pub fn table(&self, name: &str) -> Result<&Table> {
        let model = self.schema.model_by_name(name)?;
        Ok(&self.tables[model.id])
    }

    pub(crate) fn model_id(&self, name: &str) -> Result<ModelId> {
        Ok(self.schema.model_by_name(name)?.id)
    }

    /// Number of records with pending writes.
    pub fn dirty_count(&self) -> usize {
        self.live_records().filter(|&id| self.records[id.0].is_dirty()).count()
    }

    /// Drops every record.
    pub fn clear(&mut self) {
        self.records.clear();
        self.merged = MergeSet::default();
        for table in &mut self.tables {
            table.clear();
        }
    }

    /// Records listed by their tables, in table and insertion order.
    pub(crate) fn live_records(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.tables.iter().flat_map(|t| t.records.iter().copied()).filter(|&id| !self.merged.is_merged(id))
    }

    /// Every table's records as documents, keyed by model name.
    pub fn json(&self) -> JsonValue {
        let mut doc = Document::new();
        for table in &self.tables {
            let items: Vec<JsonValue> = table
                .records
                .iter()
                .filter(|&&id| !self.merged.is_merged(id))
                .map(|&id| self.record_json(id))
                .collect();
            if !items.is_empty() {
                doc.insert(self.schema.model(table.model).name.clone(), JsonValue::Array(items));
            }
        }
        JsonValue::Object(doc)
    }

    /// Debug dumps of the records that still have pending writes.
    pub fn dump_dirty_records(&self) -> JsonValue {
        JsonValue::Array(self.live_records().filter(|&id| self.records[id.0].is_dirty()).map(|id| self.dump(id)).collect())
    }

    // ========================================================================
    // DDL
    // ========================================================================

    /// Creates every mapped table that does not exist yet, then adds foreign key
    /// constraints (except on SQLite, which cannot alter them in).
    pub async fn create_tables(&self) -> Result<()> {
        let driver = self.driver();
        let mut conn = self.pool.get_connection().await?;

        for model in &self.schema.models {
            for sql in create_table_sql(driver, model) {
                conn.execute_raw(&sql).await?;
            }
        }

        if driver == Drivers::SQLite {
            return Ok(());
        }

        for model in &self.schema.models {
            for field in &model.fields {
                let Field::ForeignKey(fk) = field else { continue };
                let target = self.schema.model(fk.referenced.model);
                let target_column = target.fields[fk.referenced.field].column().map(|c| c.name.as_str()).unwrap_or("id");
                let constraint = format!("fk_{}_{}_{}", model.table_name, target.table_name, fk.simple.column.name);
                let sql = format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {}({})",
                    Serializer::escape_id(driver, &model.table_name),
                    Serializer::escape_id(driver, &constraint),
                    Serializer::escape_id(driver, &fk.simple.column.name),
                    Serializer::escape_id(driver, &target.table_name),
                    Serializer::escape_id(driver, target_column),
                );
                // already present when the table existed before
                if let Err(e) = conn.execute_raw(&sql).await {
                    log::debug!("skipping constraint {}: {}", constraint, e);
                }
            }
        }
        Ok(())
    }

    /// Closes the connection pool.
    pub async fn end(&self) {
        self.pool.end().await;
    }
}

/// `CREATE TABLE IF NOT EXISTS` plus index statements for one model.
pub(crate) fn create_table_sql(driver: Drivers, model: &Model) -> Vec<String> {
    let quote = |name: &str| Serializer::escape_id(driver, name);
    let primary = &model.primary_key().fields;
    let mut column_defs = Vec::new();
    let mut indexes = Vec::new();

    for (index, field) in model.simple_fields() {
        let col = &field.column;
        let single_pk = primary.len() == 1 && primary[0] == index;
        let sql_type = match driver {
            Drivers::Postgres if col.auto_increment && col.sql_type.to_ascii_uppercase().contains("BIG") => "BIGSERIAL",
            Drivers::Postgres if col.auto_increment => "SERIAL",
            _ => col.sql_type.as_str(),
        };
        let mut def = format!("{} {}", quote(&col.name), sql_type);

        if single_pk {
            def.push_str(" PRIMARY KEY");
            if col.auto_increment && driver == Drivers::MySQL {
                def.push_str(" AUTO_INCREMENT");
            }
        } else if !col.nullable {
            def.push_str(" NOT NULL");
        }

        if !single_pk && model.is_unique_field(index) {
            def.push_str(" UNIQUE");
        }

        if col.indexed && !single_pk && !field.unique {
            indexes.push(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote(&format!("idx_{}_{}", model.table_name, col.name)),
                quote(&model.table_name),
                quote(&col.name)
            ));
        }

        column_defs.push(def);
    }

    let columns_of = |fields: &[usize]| {
        fields.iter().filter_map(|&f| model.fields[f].column()).map(|c| quote(&c.name)).collect::<Vec<_>>().join(", ")
    };
    if primary.len() > 1 {
        column_defs.push(format!("PRIMARY KEY ({})", columns_of(primary)));
    }
    for uk in model.unique_keys.iter().filter(|uk| !uk.primary && uk.fields.len() > 1) {
        column_defs.push(format!("UNIQUE ({})", columns_of(&uk.fields)));
    }

    let mut statements = vec![format!("CREATE TABLE IF NOT EXISTS {} ({})", quote(&model.table_name), column_defs.join(", "))];
    statements.extend(indexes);
    statements
}

// ============================================================================
// DatabaseBuilder Struct
// ============================================================================

/// Configures the pool behind a [`Database`].
///
/// # Example
///
/// ```rust,ignore
/// let db = Database::builder()
///     .max_connections(1)
///     .retry_policy(RetryPolicy::default().max_retries(3))
///     .connect("sqlite::memory:", schema)
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct DatabaseBuilder {
    max_connections: u32,
    retry: RetryPolicy,
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseBuilder {
    pub fn new() -> Self {
        Self { max_connections: 5, retry: RetryPolicy::default() }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn connect(self, url: &str, schema: Schema) -> Result<Database> {
        sqlx::any::install_default_drivers();
        let driver = Drivers::from_url(url);
        let mut options = sqlx::any::AnyPoolOptions::new().max_connections(self.max_connections);
        if driver == Drivers::SQLite {
            // an in-memory database lives only as long as its connection
            options = options.idle_timeout(None).max_lifetime(None);
        }
        let pool = options.connect(url).await?;
        log::info!("connected to {:?} database ({} connections max)", driver, self.max_connections);

        let mut db = Database::new(Arc::new(schema), Arc::new(SqlxPool::new(pool, driver)));
        db.retry = self.retry;
        Ok(db)
    }

    /// Connects using `DATABASE_URL`, with `DATABASE_MAX_CONNECTIONS` overriding
    /// the pool size when set.
    pub async fn from_env(self, schema: Schema) -> Result<Database> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| Error::Database(sqlx::Error::Configuration("DATABASE_URL is not set".into())))?;
        let builder = match std::env::var("DATABASE_MAX_CONNECTIONS").ok().and_then(|v| v.parse().ok()) {
            Some(max) => self.max_connections(max),
            None => self,
        };
        builder.connect(&url, schema).await
    }
}
