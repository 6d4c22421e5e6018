#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlit::{
    query::{
        ast::{Insert, Statement},
        Serializer,
    },
    ColumnInfo, Connection, ConnectionPool, Database, Drivers, Schema, TableInfo, Value,
};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Children are listed before their parents so that insert order in the
/// tests comes from references, not from table order.
pub fn shop_schema() -> sqlit::Result<Schema> {
    Schema::builder()
        .table(
            TableInfo::new("order_item")
                .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
                .column(ColumnInfo::new("order_id", "INTEGER").references("order", "id"))
                .column(ColumnInfo::new("line", "INTEGER"))
                .column(ColumnInfo::new("product_id", "INTEGER").references("product", "id"))
                .column(ColumnInfo::new("quantity", "INTEGER").nullable())
                .unique(&["order_id", "line"]),
        )
        .table(
            TableInfo::new("order_shipping")
                .column(ColumnInfo::new("order_id", "INTEGER").primary_key().references("order", "id"))
                .column(ColumnInfo::new("address", "VARCHAR(255)").nullable()),
        )
        .table(
            TableInfo::new("order")
                .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
                .column(ColumnInfo::new("code", "VARCHAR(32)").unique())
                .column(ColumnInfo::new("user_id", "INTEGER").nullable().references("user", "id"))
                .column(ColumnInfo::new("total", "DOUBLE").nullable()),
        )
        .table(
            TableInfo::new("user")
                .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
                .column(ColumnInfo::new("email", "VARCHAR(255)").unique())
                .column(ColumnInfo::new("name", "VARCHAR(64)").nullable()),
        )
        .table(
            TableInfo::new("product_category")
                .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
                .column(ColumnInfo::new("product_id", "INTEGER").references("product", "id"))
                .column(ColumnInfo::new("category_id", "INTEGER").references("category", "id"))
                .unique(&["product_id", "category_id"]),
        )
        .table(
            TableInfo::new("category")
                .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
                .column(ColumnInfo::new("name", "VARCHAR(64)").unique())
                .column(ColumnInfo::new("parent_id", "INTEGER").nullable().references("category", "id")),
        )
        .table(
            TableInfo::new("product")
                .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
                .column(ColumnInfo::new("sku", "VARCHAR(32)").unique())
                .column(ColumnInfo::new("name", "VARCHAR(64)").nullable())
                .column(ColumnInfo::new("price", "DOUBLE").nullable()),
        )
        .build()
}

/// A fresh in-memory database holding the given schema's tables.
pub async fn open(schema: Schema) -> Result<Database, Box<dyn std::error::Error>> {
    init_logger();
    let db = Database::builder().max_connections(1).connect("sqlite::memory:", schema).await?;
    db.create_tables().await?;
    Ok(db)
}

pub async fn shop() -> Result<Database, Box<dyn std::error::Error>> {
    open(shop_schema()?).await
}

// ============================================================================
// Statement Recording
// ============================================================================

/// The SQL text of every statement run through a [`RecordingPool`].
#[derive(Debug, Clone, Default)]
pub struct Statements(Arc<Mutex<Vec<String>>>);

impl Statements {
    fn push(&self, sql: String) {
        if let Ok(mut log) = self.0.lock() {
            log.push(sql);
        }
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut log) = self.0.lock() {
            log.clear();
        }
    }

    /// Statements starting with `prefix`, e.g. `INSERT INTO "user"`.
    pub fn starting_with(&self, prefix: &str) -> Vec<String> {
        self.all().into_iter().filter(|sql| sql.starts_with(prefix)).collect()
    }

    /// Position of the first statement starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.all().iter().position(|sql| sql.starts_with(prefix))
    }
}

pub struct RecordingPool {
    inner: Arc<dyn ConnectionPool>,
    statements: Statements,
}

struct RecordingConnection {
    inner: Box<dyn Connection>,
    statements: Statements,
}

#[async_trait]
impl ConnectionPool for RecordingPool {
    fn driver(&self) -> Drivers {
        self.inner.driver()
    }

    async fn get_connection(&self) -> sqlit::Result<Box<dyn Connection>> {
        let inner = self.inner.get_connection().await?;
        Ok(Box::new(RecordingConnection { inner, statements: self.statements.clone() }))
    }

    async fn end(&self) {
        self.inner.end().await
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    fn driver(&self) -> Drivers {
        self.inner.driver()
    }

    async fn query(&mut self, statement: &Statement) -> sqlit::Result<Vec<sqlit::Row>> {
        self.statements.push(Serializer::serialize(self.driver(), statement).text);
        self.inner.query(statement).await
    }

    async fn execute(&mut self, statement: &Statement) -> sqlit::Result<u64> {
        self.statements.push(Serializer::serialize(self.driver(), statement).text);
        self.inner.execute(statement).await
    }

    async fn insert(&mut self, insert: &Insert) -> sqlit::Result<Vec<Value>> {
        let statement = Statement::Insert(insert.clone());
        self.statements.push(Serializer::serialize(self.driver(), &statement).text);
        self.inner.insert(insert).await
    }

    async fn execute_raw(&mut self, sql: &str) -> sqlit::Result<()> {
        self.statements.push(sql.to_string());
        self.inner.execute_raw(sql).await
    }
}

/// A database sharing `db`'s connections whose statements are recorded.
pub fn recording(db: &Database) -> (Database, Statements) {
    let statements = Statements::default();
    let pool = RecordingPool { inner: Arc::clone(db.pool()), statements: statements.clone() };
    (Database::new(Arc::clone(db.schema()), Arc::new(pool)), statements)
}
