mod common;

use async_trait::async_trait;
use common::TestResult;
use futures::future::BoxFuture;
use serde_json::json;
use sqlit::{
    query::ast::{Insert, Statement},
    ColumnInfo, Connection, ConnectionPool, Data, Database, Drivers, Error, FlushMethod, FlushOptions, RetryPolicy,
    Schema, SelectOptions, TableInfo, Value,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Two tables referencing each other; `nullable` decides whether the
/// department side of the cycle may be written without its manager.
fn cycle_schema(nullable: bool) -> sqlit::Result<Schema> {
    let manager = ColumnInfo::new("manager_id", "INTEGER").references("employee", "id");
    let manager = if nullable { manager.nullable() } else { manager };
    Schema::builder()
        .table(
            TableInfo::new("department")
                .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
                .column(ColumnInfo::new("name", "VARCHAR(64)").unique())
                .column(manager),
        )
        .table(
            TableInfo::new("employee")
                .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
                .column(ColumnInfo::new("email", "VARCHAR(64)").unique())
                .column(ColumnInfo::new("department_id", "INTEGER").references("department", "id")),
        )
        .build()
}

#[tokio::test]
async fn test_parents_are_inserted_before_children() -> TestResult {
    let db = common::shop().await?;
    let (mut db, log) = common::recording(&db);

    let user = db.append("User", json!({ "email": "a@b.c" }))?;
    let order = db.append("Order", Data::new().with("code", "A-1").with("user", user))?;
    db.flush().await?;

    let user_insert = log.position("INSERT INTO \"user\"").ok_or("user was not inserted")?;
    let order_insert = log.position("INSERT INTO \"order\"").ok_or("order was not inserted")?;
    assert!(user_insert < order_insert);
    assert_eq!(db.dirty_count(), 0);
    assert_eq!(db.get(order, "user")?, db.primary_key(user));
    assert!(db.record(order).inserted());

    let orders = db.table("Order")?.select(&json!("*"), &SelectOptions::new()).await?;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0]["code"], json!("A-1"));
    assert_eq!(orders[0]["user"], json!({ "id": 1 }));
    Ok(())
}

#[tokio::test]
async fn test_nested_parent_documents_are_appended() -> TestResult {
    let mut db = common::shop().await?;

    let order = db.append("Order", json!({ "code": "A-1", "user": { "email": "a@b.c", "name": "Ann" } }))?;
    let again = db.append("User", json!({ "email": "a@b.c" }))?;
    db.flush().await?;

    assert_eq!(db.table("User")?.records().len(), 1);
    assert_eq!(db.get(order, "user")?, db.primary_key(again));
    let user = db.table("User")?.get(&json!({ "email": "a@b.c" })).await?.ok_or("user missing")?;
    assert_eq!(user["name"], json!("Ann"));
    Ok(())
}

#[tokio::test]
async fn test_rows_with_the_same_columns_share_one_insert() -> TestResult {
    let db = common::shop().await?;
    let (mut db, log) = common::recording(&db);

    for email in ["a@b.c", "b@b.c", "c@b.c"] {
        db.append("User", json!({ "email": email }))?;
    }
    db.append("User", json!({ "email": "d@b.c", "name": "Dee" }))?;
    db.flush().await?;

    assert_eq!(log.starting_with("INSERT INTO \"user\"").len(), 2);
    assert_eq!(db.table("User")?.count(&json!({}), None).await?, 4);

    let keys: Vec<Option<Value>> = db.table("User")?.records().iter().map(|&id| db.primary_key(id)).collect();
    assert_eq!(keys, vec![Some(Value::Int(1)), Some(Value::Int(2)), Some(Value::Int(3)), Some(Value::Int(4))]);
    Ok(())
}

#[tokio::test]
async fn test_existing_rows_are_updated_not_duplicated() -> TestResult {
    let db = common::shop().await?;

    let mut first = db.fork();
    first.append("User", json!({ "email": "a@b.c", "name": "Ann" }))?;
    first.flush().await?;

    let (mut second, log) = common::recording(&db);
    let user = second.append("User", json!({ "email": "a@b.c", "name": "Anna" }))?;
    second.flush().await?;

    assert!(log.starting_with("INSERT INTO \"user\"").is_empty());
    assert_eq!(log.starting_with("UPDATE \"user\"").len(), 1);
    assert_eq!(second.primary_key(user), Some(Value::Int(1)));
    assert!(!second.record(user).inserted());

    let rows = db.table("User")?.select(&json!("*"), &SelectOptions::new()).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("Anna"));
    Ok(())
}

#[tokio::test]
async fn test_unchanged_rows_are_not_written() -> TestResult {
    let db = common::shop().await?;

    let mut first = db.fork();
    first.append("User", json!({ "email": "a@b.c", "name": "Ann" }))?;
    first.flush().await?;

    let (mut second, log) = common::recording(&db);
    second.append("User", json!({ "email": "a@b.c", "name": "Ann" }))?;
    second.flush().await?;

    assert!(log.starting_with("INSERT").is_empty());
    assert!(log.starting_with("UPDATE").is_empty());
    assert_eq!(second.dirty_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_records_sharing_a_key_are_merged() -> TestResult {
    let db = common::shop().await?;
    let (mut db, log) = common::recording(&db);

    let first = db.append("User", json!({ "email": "a@b.c" }))?;
    let second = db.append("User", json!({ "name": "Bob" }))?;
    assert_ne!(db.resolve(first), db.resolve(second));

    db.set(second, "email", "a@b.c")?;
    db.flush().await?;

    assert_eq!(db.resolve(second), db.resolve(first));
    assert_eq!(log.starting_with("INSERT INTO \"user\"").len(), 1);
    let rows = db.table("User")?.select(&json!("*"), &SelectOptions::new()).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("Bob"));
    Ok(())
}

#[tokio::test]
async fn test_appending_a_known_key_returns_the_same_record() -> TestResult {
    let mut db = common::shop().await?;

    let order = db.append("Order", json!({ "code": "A-1" }))?;
    let again = db.append("Order", json!({ "code": "A-1", "total": 12.5 }))?;
    assert_eq!(order, again);
    assert_eq!(db.get(order, "total")?, Some(Value::Float(12.5)));

    let user = db.append("User", json!({ "email": "a@b.c" }))?;
    let other = db.append("User", json!({ "email": "b@b.c" }))?;
    db.set(order, "user", user)?;
    db.set(order, "user", user)?;
    assert!(matches!(db.set(order, "user", other), Err(Error::Reassignment { .. })));
    Ok(())
}

#[tokio::test]
async fn test_nullable_cycle_is_written_in_two_steps() -> TestResult {
    let mut db = common::open(cycle_schema(true)?).await?;

    let department = db.append("Department", json!({ "name": "R&D" }))?;
    let employee = db.append("Employee", Data::new().with("email", "e@x.y").with("department", department))?;
    db.set(department, "manager", employee)?;
    db.flush().await?;

    assert_eq!(db.dirty_count(), 0);
    let row = db.table("Department")?.get(&json!({ "name": "R&D" })).await?.ok_or("department missing")?;
    assert_eq!(row["manager"], json!({ "id": 1 }));
    let row = db.table("Employee")?.get(&json!(1)).await?.ok_or("employee missing")?;
    assert_eq!(row["department"], json!({ "id": 1 }));
    Ok(())
}

#[tokio::test]
async fn test_non_null_cycle_cannot_be_flushed() -> TestResult {
    let mut db = common::open(cycle_schema(false)?).await?;

    let department = db.append("Department", json!({ "name": "R&D" }))?;
    let employee = db.append("Employee", Data::new().with("email", "e@x.y").with("department", department))?;
    db.set(department, "manager", employee)?;

    assert!(matches!(db.flush().await, Err(Error::CircularReferences)));
    assert_eq!(db.dirty_count(), 2);
    assert!(matches!(db.save(employee).await, Err(Error::RecordLoop)));
    assert_eq!(db.table("Department")?.count(&json!({}), None).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_save_writes_parents_first() -> TestResult {
    let mut db = common::shop().await?;

    let user = db.append("User", json!({ "email": "a@b.c" }))?;
    let order = db.append("Order", Data::new().with("code", "A-1").with("user", user))?;
    let unrelated = db.append("Product", json!({ "sku": "P-1" }))?;
    db.save(order).await?;

    assert!(!db.record(user).is_dirty());
    assert!(!db.record(order).is_dirty());
    assert!(db.record(unrelated).is_dirty());
    assert_eq!(db.table("Product")?.count(&json!({}), None).await?, 0);
    assert_eq!(db.table("Order")?.count(&json!({ "user": { "email": "a@b.c" } }), None).await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_save_updates_a_row_that_already_exists() -> TestResult {
    let db = common::shop().await?;
    db.table("User")?.insert(&json!({ "email": "a@b.c", "name": "Ann" })).await?;

    let mut fork = db.fork();
    let user = fork.append("User", json!({ "email": "a@b.c", "name": "Anna" }))?;
    fork.save(user).await?;

    assert_eq!(fork.primary_key(user), Some(Value::Int(1)));
    assert_eq!(fork.record(user).state().method, FlushMethod::Update);
    let row = db.table("User")?.get(&json!(1)).await?.ok_or("user missing")?;
    assert_eq!(row["name"], json!("Anna"));
    assert_eq!(db.table("User")?.count(&json!({}), None).await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_save_restores_records() -> TestResult {
    let mut db = common::shop().await?;

    let order = db.append("Order", json!({ "code": "A-1" }))?;
    // no line, so the item has no complete unique key
    let item = db.append(
        "OrderItem",
        Data::new().with("order", order).with("product", json!({ "sku": "P-1" })).with("quantity", 1),
    )?;
    assert!(matches!(db.save(item).await, Err(Error::RecordLoop)));

    assert!(db.primary_key(order).is_none_or(|key| key.is_null()));
    assert!(db.record(order).is_dirty());
    assert_eq!(db.table("Order")?.count(&json!({}), None).await?, 0);
    assert_eq!(db.table("Product")?.count(&json!({}), None).await?, 0);

    db.set(item, "line", 1)?;
    db.save(item).await?;
    assert_eq!(db.table("Order")?.count(&json!({}), None).await?, 1);
    assert_eq!(db.table("OrderItem")?.count(&json!({}), None).await?, 1);
    assert_eq!(db.get(item, "order")?, db.primary_key(order));
    Ok(())
}

#[tokio::test]
async fn test_update_and_delete_single_records() -> TestResult {
    let mut db = common::shop().await?;

    let user = db.append("User", json!({ "email": "a@b.c" }))?;
    db.flush().await?;

    db.update_record(user, json!({ "name": "Ann" })).await?;
    let row = db.table("User")?.get(&json!(1)).await?.ok_or("user missing")?;
    assert_eq!(row["name"], json!("Ann"));

    db.delete_record(user).await?;
    assert!(db.record(user).state().deleted);
    assert!(db.table("User")?.get(&json!(1)).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_marked_records_are_deleted_on_flush() -> TestResult {
    let db = common::shop().await?;
    let table = db.table("Product")?;
    table.insert(&json!({ "sku": "P-1" })).await?;
    table.insert(&json!({ "sku": "P-2" })).await?;

    let mut fork = db.fork();
    let product = fork.append("Product", json!({ "sku": "P-1" }))?;
    fork.mark_deleted(product);
    assert!(fork.record(product).is_dirty());
    fork.flush().await?;

    assert!(fork.record(product).state().deleted);
    let rows = db.table("Product")?.select(&json!("*"), &SelectOptions::new()).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["sku"], json!("P-2"));
    Ok(())
}

#[tokio::test]
async fn test_forks_flush_independently() -> TestResult {
    let db = common::shop().await?;

    let mut first = db.fork();
    let mut second = db.fork();
    first.append("Order", json!({ "code": "A-1", "user": { "email": "a@b.c" } }))?;
    second.append("Order", json!({ "code": "A-2", "user": { "email": "a@b.c" } }))?;
    first.flush().await?;
    second.flush().await?;

    assert_eq!(db.table("User")?.count(&json!({}), None).await?, 1);
    assert_eq!(db.table("Order")?.count(&json!({ "user": { "email": "a@b.c" } }), None).await?, 2);
    Ok(())
}

fn mark_before_commit(conn: &mut dyn Connection) -> BoxFuture<'_, sqlit::Result<()>> {
    Box::pin(async move { conn.execute_raw("INSERT INTO \"product\" (\"sku\") VALUES ('hook')").await })
}

fn refuse(_conn: &mut dyn Connection) -> BoxFuture<'_, sqlit::Result<()>> {
    Box::pin(async move { Err(Error::RowNotFound) })
}

#[tokio::test]
async fn test_hooks_run_inside_the_flush_transaction() -> TestResult {
    let mut db = common::shop().await?;

    db.append("User", json!({ "email": "a@b.c" }))?;
    db.flush_with(FlushOptions::new().before_commit(mark_before_commit)).await?;
    assert_eq!(db.table("Product")?.count(&json!({ "sku": "hook" }), None).await?, 1);

    db.append("User", json!({ "email": "b@b.c" }))?;
    let result = db.flush_with(FlushOptions::new().after_begin(refuse)).await;
    assert!(matches!(result, Err(Error::RowNotFound)));
    assert_eq!(db.dirty_count(), 1);
    assert_eq!(db.table("User")?.count(&json!({}), None).await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_flush_restores_records() -> TestResult {
    let mut db = common::shop().await?;

    let user = db.append("User", json!({ "email": "a@b.c" }))?;
    db.flush_with(FlushOptions::new().before_commit(refuse).retry(RetryPolicy::default().max_retries(0))).await.ok();

    assert_eq!(db.primary_key(user), None);
    assert!(db.record(user).is_dirty());
    assert_eq!(db.table("User")?.count(&json!({}), None).await?, 0);

    db.flush().await?;
    assert_eq!(db.primary_key(user), Some(Value::Int(1)));
    Ok(())
}

#[tokio::test]
async fn test_retry_policy_is_configurable() -> TestResult {
    let db = common::shop().await?;
    let mut fork = db.fork();
    fork.set_retry_policy(RetryPolicy::default().max_retries(3).max_delay(Duration::from_millis(5)));
    assert_eq!(fork.retry_policy().max_retries, Some(3));

    fork.append("User", json!({ "email": "a@b.c" }))?;
    fork.flush().await?;
    assert_eq!(db.table("User")?.count(&json!({}), None).await?, 1);
    Ok(())
}

// ============================================================================
// Concurrent Writers
// ============================================================================

/// Commits a conflicting user right before the first batched insert, as a
/// second writer would between the existence check and the insert.
struct RacingPool {
    inner: Arc<dyn ConnectionPool>,
    raced: Arc<AtomicBool>,
}

struct RacingConnection {
    inner: Box<dyn Connection>,
    raced: Arc<AtomicBool>,
}

#[async_trait]
impl ConnectionPool for RacingPool {
    fn driver(&self) -> Drivers {
        self.inner.driver()
    }

    async fn get_connection(&self) -> sqlit::Result<Box<dyn Connection>> {
        let inner = self.inner.get_connection().await?;
        Ok(Box::new(RacingConnection { inner, raced: Arc::clone(&self.raced) }))
    }

    async fn end(&self) {
        self.inner.end().await
    }
}

#[async_trait]
impl Connection for RacingConnection {
    fn driver(&self) -> Drivers {
        self.inner.driver()
    }

    async fn query(&mut self, statement: &Statement) -> sqlit::Result<Vec<sqlit::Row>> {
        self.inner.query(statement).await
    }

    async fn execute(&mut self, statement: &Statement) -> sqlit::Result<u64> {
        self.inner.execute(statement).await
    }

    async fn insert(&mut self, insert: &Insert) -> sqlit::Result<Vec<Value>> {
        if !self.raced.swap(true, Ordering::SeqCst) {
            self.inner.execute_raw("COMMIT").await?;
            self.inner.execute_raw("INSERT INTO \"user\" (\"email\", \"name\") VALUES ('a@b.c', 'Other')").await?;
            self.inner.execute_raw("BEGIN").await?;
        }
        self.inner.insert(insert).await
    }

    async fn execute_raw(&mut self, sql: &str) -> sqlit::Result<()> {
        self.inner.execute_raw(sql).await
    }
}

#[tokio::test]
async fn test_insert_conflict_falls_back_to_existing_row() -> TestResult {
    let db = common::shop().await?;
    let raced = Arc::new(AtomicBool::new(false));
    let pool = RacingPool { inner: Arc::clone(db.pool()), raced: Arc::clone(&raced) };
    let mut racing = Database::new(Arc::clone(db.schema()), Arc::new(pool));
    racing.set_retry_policy(RetryPolicy::default().max_delay(Duration::from_millis(10)));

    let user = racing.append("User", json!({ "email": "a@b.c", "name": "Ann" }))?;
    racing.flush().await?;

    assert!(raced.load(Ordering::SeqCst));
    assert_eq!(racing.primary_key(user), Some(Value::Int(1)));
    assert!(!racing.record(user).is_dirty());
    let rows = db.table("User")?.select(&json!("*"), &SelectOptions::new()).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("Ann"));
    Ok(())
}
