mod common;

use common::TestResult;
use serde_json::json;
use sqlit::{Database, Error, SelectOptions, Value};

async fn seed_products(db: &Database) -> Result<(), Box<dyn std::error::Error>> {
    let products = db.table("Product")?;
    products.insert(&json!({ "sku": "P-1", "name": "Apple", "price": 5 })).await?;
    products.insert(&json!({ "sku": "P-2", "name": "Pear", "price": 10.5 })).await?;
    products.insert(&json!({ "sku": "P-3", "price": 20 })).await?;
    Ok(())
}

async fn seed_orders(db: &Database) -> Result<(), Box<dyn std::error::Error>> {
    let users = db.table("User")?;
    users.insert(&json!({ "email": "a@b.c", "name": "Ann" })).await?;
    users.insert(&json!({ "email": "b@b.c" })).await?;

    let orders = db.table("Order")?;
    orders.insert(&json!({ "code": "A-1", "user": 1, "total": 15 })).await?;
    orders.insert(&json!({ "code": "A-2", "user": { "id": 1 }, "total": 5 })).await?;
    orders.insert(&json!({ "code": "B-1", "user": 2 })).await?;
    orders.insert(&json!({ "code": "C-1" })).await?;

    seed_products(db).await?;
    let items = db.table("OrderItem")?;
    items.insert(&json!({ "order": 1, "line": 1, "product": 1, "quantity": 2 })).await?;
    items.insert(&json!({ "order": 1, "line": 2, "product": 2 })).await?;
    items.insert(&json!({ "order": 3, "line": 1, "product": 2, "quantity": 1 })).await?;
    Ok(())
}

fn codes(rows: &[sqlit::Document]) -> Vec<String> {
    rows.iter().filter_map(|row| row.get("code").and_then(|c| c.as_str()).map(str::to_string)).collect()
}

#[tokio::test]
async fn test_insert_get_update_delete() -> TestResult {
    let db = common::shop().await?;
    let users = db.table("User")?;

    assert_eq!(users.insert(&json!({ "email": "a@b.c" })).await?, Value::Int(1));
    assert_eq!(users.insert(&json!({ "email": "b@b.c" })).await?, Value::Int(2));

    let by_key = users.get(&json!(1)).await?.ok_or("missing by key")?;
    assert_eq!(by_key["email"], json!("a@b.c"));
    let by_unique = users.get(&json!({ "email": "b@b.c" })).await?.ok_or("missing by unique key")?;
    assert_eq!(by_unique["id"], json!(2));
    assert!(users.get(&json!(3)).await?.is_none());
    assert!(matches!(users.get(&json!({ "name": "Ann" })).await, Err(Error::BadSelector(_))));

    assert_eq!(users.update(&json!({ "name": "Ann" }), &json!({ "email": "a@b.c" })).await?, 1);
    assert_eq!(users.get(&json!(1)).await?.ok_or("missing")?["name"], json!("Ann"));
    assert_eq!(users.update(&json!({ "name": "Nobody" }), &json!({ "email": "x@y.z" })).await?, 0);

    assert_eq!(users.delete(&json!({ "id": 1 })).await?, 1);
    assert_eq!(users.count(&json!({}), None).await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_empty_inserts_are_rejected() -> TestResult {
    let db = common::shop().await?;
    assert!(matches!(db.table("User")?.insert(&json!({})).await, Err(Error::EmptyData(_))));
    assert!(matches!(db.table("User")?.insert(&json!({ "nope": 1 })).await, Err(Error::UnknownField { .. })));
    assert!(matches!(db.table("Nope"), Err(Error::UnknownTable(_))));
    Ok(())
}

#[tokio::test]
async fn test_values_are_coerced_to_column_types() -> TestResult {
    let db = common::shop().await?;

    db.table("User")?.insert(&json!({ "email": "  a@b.c ", "name": 42 })).await?;
    let user = db.table("User")?.get(&json!({ "email": "a@b.c" })).await?.ok_or("email was not trimmed")?;
    assert_eq!(user["name"], json!("42"));

    seed_products(&db).await?;
    let product = db.table("Product")?.get(&json!({ "sku": "P-1" })).await?.ok_or("missing product")?;
    assert_eq!(product["price"], json!(5.0));

    let result = db.table("Order")?.insert(&json!({ "code": "A-1", "total": "lots" })).await;
    assert!(matches!(result, Err(Error::InvalidValue { .. })));
    Ok(())
}

#[tokio::test]
async fn test_comparison_operators() -> TestResult {
    let db = common::shop().await?;
    seed_products(&db).await?;
    let products = db.table("Product")?;

    assert_eq!(products.count(&json!({ "price_gt": 5 }), None).await?, 2);
    assert_eq!(products.count(&json!({ "price_le": 10.5 }), None).await?, 2);
    assert_eq!(products.count(&json!({ "price_ge": 10.5, "price_lt": 20 }), None).await?, 1);
    assert_eq!(products.count(&json!({ "sku_in": ["P-1", "P-3", "P-9"] }), None).await?, 2);
    assert_eq!(products.count(&json!({ "sku": ["P-1", "P-2"] }), None).await?, 2);
    assert_eq!(products.count(&json!({ "name_like": "P%" }), None).await?, 1);
    assert_eq!(products.count(&json!({ "name_null": true }), None).await?, 1);
    assert_eq!(products.count(&json!({ "name_null": false }), None).await?, 2);
    assert_eq!(products.count(&json!({ "name": null }), None).await?, 1);
    assert_eq!(products.count(&json!({ "name": [null, "Apple"] }), None).await?, 2);
    assert_eq!(products.count(&json!({}), Some("name")).await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_boolean_combinators() -> TestResult {
    let db = common::shop().await?;
    seed_products(&db).await?;
    let products = db.table("Product")?;

    assert_eq!(products.count(&json!([{ "sku": "P-1" }, { "price_gt": 15 }]), None).await?, 2);
    assert_eq!(products.count(&json!({ "or": [{ "sku": "P-1" }, { "sku": "P-2" }] }), None).await?, 2);
    assert_eq!(products.count(&json!({ "and": [{ "price_gt": 1 }, { "price_lt": 15 }] }), None).await?, 2);
    assert_eq!(products.count(&json!({ "not": { "sku": "P-1" } }), None).await?, 2);
    assert_eq!(products.count(&json!({ "not": [{ "sku": "P-1" }, { "sku": "P-2" }] }), None).await?, 1);

    // an empty alternative list matches nothing, its negation everything
    assert_eq!(products.count(&json!({ "or": [] }), None).await?, 0);
    assert_eq!(products.count(&json!({ "sku": [] }), None).await?, 0);
    assert_eq!(products.count(&json!({ "not": { "id": [] } }), None).await?, 3);

    assert!(matches!(products.count(&json!({ "colour": "red" }), None).await, Err(Error::UnknownField { .. })));
    Ok(())
}

#[tokio::test]
async fn test_ordering_and_paging() -> TestResult {
    let db = common::shop().await?;
    seed_orders(&db).await?;
    let orders = db.table("Order")?;

    let rows = orders.select(&json!("*"), &SelectOptions::new().order_by("-code")).await?;
    assert_eq!(codes(&rows), vec!["C-1", "B-1", "A-2", "A-1"]);

    let rows = orders.select(&json!("*"), &SelectOptions::new().order_by("code").limit(2).offset(1)).await?;
    assert_eq!(codes(&rows), vec!["A-2", "B-1"]);

    let options = SelectOptions::new().filter(json!({ "user_null": false })).order_by("user.email desc").order_by("code");
    let rows = orders.select(&json!("*"), &options).await?;
    assert_eq!(codes(&rows), vec!["B-1", "A-1", "A-2"]);
    Ok(())
}

#[tokio::test]
async fn test_foreign_key_filters() -> TestResult {
    let db = common::shop().await?;
    seed_orders(&db).await?;
    let orders = db.table("Order")?;

    assert_eq!(orders.count(&json!({ "user": 1 }), None).await?, 2);
    assert_eq!(orders.count(&json!({ "user": { "id": 2 } }), None).await?, 1);
    assert_eq!(orders.count(&json!({ "user": { "email": "a@b.c" } }), None).await?, 2);
    assert_eq!(orders.count(&json!({ "user": { "name": "Ann" } }), None).await?, 2);
    assert_eq!(orders.count(&json!({ "user": [2, { "email": "a@b.c" }] }), None).await?, 3);
    assert_eq!(orders.count(&json!({ "user_null": true }), None).await?, 1);
    assert_eq!(orders.count(&json!({ "user_in": [1, 2] }), None).await?, 3);

    let items = db.table("OrderItem")?;
    assert_eq!(items.count(&json!({ "order": { "user": { "email": "a@b.c" } } }), None).await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_related_field_filters() -> TestResult {
    let db = common::shop().await?;
    seed_orders(&db).await?;

    let users = db.table("User")?;
    assert_eq!(users.count(&json!({ "orders": { "total_gt": 10 } }), None).await?, 1);
    assert_eq!(users.count(&json!({ "orders": "*" }), None).await?, 2);
    assert_eq!(users.count(&json!({ "orders_some": { "code": "B-1" } }), None).await?, 1);
    assert_eq!(users.count(&json!({ "orders_none": { "total_gt": 10 } }), None).await?, 1);

    let orders = db.table("Order")?;
    assert_eq!(orders.count(&json!({ "orderItems": { "product": { "sku": "P-2" } } }), None).await?, 2);
    assert_eq!(orders.count(&json!({ "orderItems_none": {} }), None).await?, 2);

    // a foreign key filtered through the referenced row's children
    let items = db.table("OrderItem")?;
    assert_eq!(items.count(&json!({ "order": { "orderItems": { "quantity": 2 } } }), None).await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_select_shapes() -> TestResult {
    let db = common::shop().await?;
    seed_orders(&db).await?;
    let orders = db.table("Order")?;

    let shape = json!({ "user": { "email": true }, "total": false, "orderItems": true });
    let rows = orders.select(&shape, &SelectOptions::new().filter(json!({ "code": "A-1" }))).await?;
    assert_eq!(rows.len(), 1);
    let order = &rows[0];
    assert_eq!(order["user"]["email"], json!("a@b.c"));
    assert!(order.get("total").is_none());

    let items = order["orderItems"].as_array().ok_or("items are not a list")?;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["product"], json!({ "id": 1 }));
    assert!(items[0].get("order").is_none());

    let shape = json!({ "code": "orderCode", "orderShipping": true });
    let rows = orders.select(&shape, &SelectOptions::new().filter(json!({ "code": "C-1" }))).await?;
    assert_eq!(rows[0]["orderCode"], json!("C-1"));
    assert_eq!(rows[0]["orderShipping"], json!(null));
    Ok(())
}

#[tokio::test]
async fn test_related_options_in_shapes() -> TestResult {
    let db = common::shop().await?;
    seed_orders(&db).await?;

    let shape = json!({ "orders": { "where": { "total_null": false }, "orderBy": "-code" } });
    let users = db.table("User")?.select(&shape, &SelectOptions::new().order_by("email")).await?;
    assert_eq!(users.len(), 2);

    let ann = users[0]["orders"].as_array().ok_or("orders are not a list")?;
    assert_eq!(ann.iter().map(|o| o["code"].clone()).collect::<Vec<_>>(), vec![json!("A-2"), json!("A-1")]);
    assert_eq!(users[1]["orders"], json!([]));

    let shape = json!({ "orders": { "limit": 1, "orderBy": ["code"] } });
    let users = db.table("User")?.select(&shape, &SelectOptions::new().order_by("email")).await?;
    assert_eq!(users[0]["orders"].as_array().map(Vec::len), Some(1));
    assert_eq!(users[0]["orders"][0]["code"], json!("A-1"));
    Ok(())
}

#[tokio::test]
async fn test_claim_takes_each_row_once() -> TestResult {
    let db = common::shop().await?;
    seed_orders(&db).await?;
    let orders = db.table("Order")?;

    let mut claimed = Vec::new();
    while let Some(row) = orders.claim(&json!({ "total": 1 }), &json!({ "total_null": true }), &[]).await? {
        assert_eq!(row["total"], json!(1.0));
        claimed.push(row["code"].clone());
    }
    claimed.sort_by_key(|code| code.to_string());
    assert_eq!(claimed, vec![json!("B-1"), json!("C-1")]);
    assert_eq!(orders.count(&json!({ "total_null": true }), None).await?, 0);
    Ok(())
}
