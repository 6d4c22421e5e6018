mod common;

use common::TestResult;
use serde_json::json;
use sqlit::{Error, SelectOptions};

#[tokio::test]
async fn test_create_with_parent_and_children() -> TestResult {
    let db = common::shop().await?;
    db.table("Product")?.insert(&json!({ "sku": "P-1" })).await?;
    db.table("User")?.insert(&json!({ "email": "a@b.c" })).await?;

    let order = db
        .create(
            "Order",
            &json!({
                "code": "A-1",
                "user": { "connect": { "email": "a@b.c" } },
                "orderItems": { "create": [
                    { "line": 1, "product": 1, "quantity": 2 },
                    { "line": 2, "product": { "id": 1 } },
                ] },
                "orderShipping": { "create": { "address": "Main St 1" } },
            }),
        )
        .await?;

    assert_eq!(order["code"], json!("A-1"));
    assert_eq!(order["user"], json!({ "id": 1 }));
    assert_eq!(db.table("OrderItem")?.count(&json!({ "order": { "code": "A-1" } }), None).await?, 2);
    let shipping = db.table("OrderShipping")?.get(&json!(1)).await?.ok_or("shipping missing")?;
    assert_eq!(shipping["address"], json!("Main St 1"));
    Ok(())
}

#[tokio::test]
async fn test_create_nested_parent() -> TestResult {
    let db = common::shop().await?;

    let order = db.create("Order", &json!({ "code": "A-1", "user": { "create": { "email": "new@b.c" } } })).await?;
    let user = db.table("User")?.get(&json!({ "email": "new@b.c" })).await?.ok_or("user missing")?;
    assert_eq!(order["user"]["id"], user["id"]);

    // a document holding a parent field is a reference, not an operation
    let order = db.create("Order", &json!({ "code": "A-2", "user": { "id": 1 } })).await?;
    assert_eq!(order["user"], json!({ "id": 1 }));

    let result = db.create("Order", &json!({ "code": "A-3", "user": { "merge": {} } })).await;
    assert!(matches!(result, Err(Error::UnsupportedMethod(_))));
    assert!(matches!(db.create("Order", &json!({})).await, Err(Error::EmptyData(_))));
    Ok(())
}

#[tokio::test]
async fn test_failed_create_rolls_back() -> TestResult {
    let db = common::shop().await?;

    let result = db
        .create(
            "Order",
            &json!({
                "code": "A-1",
                "user": { "create": { "email": "a@b.c" } },
                "orderItems": { "explode": [] },
            }),
        )
        .await;
    assert!(matches!(result, Err(Error::UnsupportedMethod(_))));
    assert_eq!(db.table("Order")?.count(&json!({}), None).await?, 0);
    assert_eq!(db.table("User")?.count(&json!({}), None).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_upsert_creates_then_updates() -> TestResult {
    let db = common::shop().await?;

    let created = db.upsert("User", &json!({ "email": "a@b.c", "name": "Ann" }), &json!({ "name": "Anna" })).await?;
    assert_eq!(created["name"], json!("Ann"));

    let updated = db.upsert("User", &json!({ "email": "a@b.c", "name": "Ann" }), &json!({ "name": "Anna" })).await?;
    assert_eq!(updated["id"], created["id"]);
    assert_eq!(updated["name"], json!("Anna"));

    let unchanged = db.upsert("User", &json!({ "email": "a@b.c" }), &json!({})).await?;
    assert_eq!(unchanged["name"], json!("Anna"));
    assert_eq!(db.table("User")?.count(&json!({}), None).await?, 1);

    let result = db.upsert("User", &json!({ "name": "Bob" }), &json!({})).await;
    assert!(matches!(result, Err(Error::Incomplete(_))));
    Ok(())
}

#[tokio::test]
async fn test_modify_applies_child_operations() -> TestResult {
    let db = common::shop().await?;
    db.table("Product")?.insert(&json!({ "sku": "P-1" })).await?;
    db.create(
        "Order",
        &json!({
            "code": "A-1",
            "orderItems": { "create": [
                { "line": 1, "product": 1, "quantity": 1 },
                { "line": 2, "product": 1, "quantity": 1 },
                { "line": 3, "product": 1, "quantity": 1 },
            ] },
        }),
    )
    .await?;

    let order = db
        .modify(
            "Order",
            &json!({
                "total": 30,
                "orderItems": {
                    "update": { "data": { "quantity": 5 }, "where": { "line": 1 } },
                    "delete": { "line": 2 },
                    "upsert": [
                        { "create": { "line": 3, "product": 1 }, "update": { "quantity": 9 } },
                        { "create": { "line": 4, "product": 1, "quantity": 4 } },
                    ],
                },
            }),
            &json!({ "code": "A-1" }),
        )
        .await?
        .ok_or("order missing")?;
    assert_eq!(order["total"], json!(30.0));

    let items = db
        .table("OrderItem")?
        .select(&json!("*"), &SelectOptions::new().filter(json!({ "order": 1 })).order_by("line"))
        .await?;
    let lines: Vec<_> = items.iter().map(|i| (i["line"].clone(), i["quantity"].clone())).collect();
    assert_eq!(lines, vec![(json!(1), json!(5)), (json!(3), json!(9)), (json!(4), json!(4))]);

    assert!(db.modify("Order", &json!({ "total": 1 }), &json!({ "code": "Z-9" })).await?.is_none());
    assert!(matches!(db.modify("Order", &json!({ "total": 1 }), &json!({ "total": 30 })).await, Err(Error::BadFilter(_))));
    Ok(())
}

#[tokio::test]
async fn test_set_replaces_children() -> TestResult {
    let db = common::shop().await?;
    db.table("Product")?.insert(&json!({ "sku": "P-1" })).await?;
    db.create("Order", &json!({ "code": "A-1", "orderItems": { "create": [{ "line": 1, "product": 1 }] } })).await?;

    db.modify(
        "Order",
        &json!({ "orderItems": { "set": [{ "line": 7, "product": 1 }, { "line": 8, "product": 1 }] } }),
        &json!({ "code": "A-1" }),
    )
    .await?;
    let lines: Vec<_> = db
        .table("OrderItem")?
        .select(&json!("*"), &SelectOptions::new().order_by("line"))
        .await?
        .into_iter()
        .map(|item| item["line"].clone())
        .collect();
    assert_eq!(lines, vec![json!(7), json!(8)]);
    Ok(())
}

#[tokio::test]
async fn test_unique_child_is_replaced_or_disconnected() -> TestResult {
    let db = common::shop().await?;
    db.create("Order", &json!({ "code": "A-1", "orderShipping": { "create": { "address": "Old St" } } })).await?;

    db.modify("Order", &json!({ "orderShipping": { "create": { "address": "New St" } } }), &json!({ "code": "A-1" })).await?;
    let rows = db.table("OrderShipping")?.select(&json!("*"), &SelectOptions::new()).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["address"], json!("New St"));

    // the foreign key is not nullable, so detaching deletes the child
    db.modify("Order", &json!({ "orderShipping": null }), &json!({ "code": "A-1" })).await?;
    assert_eq!(db.table("OrderShipping")?.count(&json!({}), None).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_connect_and_disconnect_children() -> TestResult {
    let db = common::shop().await?;
    db.table("Order")?.insert(&json!({ "code": "A-1" })).await?;
    db.table("Order")?.insert(&json!({ "code": "A-2" })).await?;

    db.create("User", &json!({ "email": "a@b.c", "orders": { "connect": [{ "code": "A-1" }, 2] } })).await?;
    assert_eq!(db.table("Order")?.count(&json!({ "user": { "email": "a@b.c" } }), None).await?, 2);

    db.modify("User", &json!({ "orders": { "disconnect": { "code": "A-2" } } }), &json!({ "email": "a@b.c" })).await?;
    assert_eq!(db.table("Order")?.count(&json!({ "user_null": true }), None).await?, 1);

    let result = db.modify("User", &json!({ "orders": { "connect": { "total": 1 } } }), &json!({ "email": "a@b.c" })).await;
    assert!(matches!(result, Err(Error::BadFilter(_))));
    Ok(())
}

#[tokio::test]
async fn test_many_to_many_operations() -> TestResult {
    let db = common::shop().await?;
    let categories = db.table("Category")?;
    categories.insert(&json!({ "name": "Fruit" })).await?;
    categories.insert(&json!({ "name": "Fresh" })).await?;

    db.create(
        "Product",
        &json!({
            "sku": "P-1",
            "categories": {
                "connect": [{ "name": "Fruit" }, { "name": "Missing" }],
                "create": { "name": "Sale" },
            },
        }),
    )
    .await?;
    let links = db.table("ProductCategory")?;
    assert_eq!(links.count(&json!({ "product": { "sku": "P-1" } }), None).await?, 2);
    assert_eq!(db.table("Product")?.count(&json!({ "categories": { "name": "Sale" } }), None).await?, 1);

    // connecting twice keeps a single link
    db.modify("Product", &json!({ "categories": { "connect": { "name": "Fruit" } } }), &json!({ "sku": "P-1" })).await?;
    assert_eq!(links.count(&json!({}), None).await?, 2);

    db.modify("Product", &json!({ "categories": { "set": [{ "name": "Fresh" }] } }), &json!({ "sku": "P-1" })).await?;
    let names: Vec<_> = db
        .table("Category")?
        .select(&json!("*"), &SelectOptions::new().filter(json!({ "products": { "sku": "P-1" } })))
        .await?
        .into_iter()
        .map(|c| c["name"].clone())
        .collect();
    assert_eq!(names, vec![json!("Fresh")]);

    db.modify("Product", &json!({ "categories": { "disconnect": { "name": "Fresh" } } }), &json!({ "sku": "P-1" })).await?;
    assert_eq!(links.count(&json!({}), None).await?, 0);
    assert_eq!(db.table("Category")?.count(&json!({}), None).await?, 3);

    db.modify("Product", &json!({ "categories": { "connect": [{ "name": "Sale" }] } }), &json!({ "sku": "P-1" })).await?;
    db.modify("Product", &json!({ "categories": { "delete": { "name": "Sale" } } }), &json!({ "sku": "P-1" })).await?;
    assert_eq!(links.count(&json!({}), None).await?, 0);
    assert!(db.table("Category")?.get(&json!({ "name": "Sale" })).await?.is_none());
    Ok(())
}
