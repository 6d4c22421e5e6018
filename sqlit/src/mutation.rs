//! # Nested Mutations
//!
//! `create`, `upsert` and `modify` write one row together with the rows it
//! points at and the rows pointing back at it, in a single transaction.
//!
//! Foreign key fields may hold a parent operation instead of a value:
//!
//! ```json
//! { "code": "A-1", "user": { "connect": { "email": "a@b.c" } } }
//! ```
//!
//! and related fields hold child operations keyed by method:
//! `connect`, `create`, `upsert`, `update`, `delete`, `disconnect` and `set`.
//!
//! ```rust,ignore
//! let order = db
//!     .create("Order", &json!({
//!         "code": "A-1",
//!         "user": { "connect": { "email": "a@b.c" } },
//!         "orderItems": { "create": [{ "product": 1, "quantity": 2 }] },
//!     }))
//!     .await?;
//! ```

use futures::future::BoxFuture;
use serde_json::Value as JsonValue;

use crate::{
    connection::Connection,
    database::Database,
    query::filter::to_array,
    schema::{Field, FieldRef, ForeignKeyField, RelatedField},
    table::{SelectOptions, TableOps},
    transaction::Transaction,
    value::{is_value, Document, Value},
    Error, Result,
};

fn single(name: &str, value: JsonValue) -> Document {
    let mut doc = Document::new();
    doc.insert(name.to_string(), value);
    doc
}

fn with(mut doc: Document, name: &str, value: JsonValue) -> Document {
    doc.insert(name.to_string(), value);
    doc
}

fn object(value: &JsonValue) -> Result<Document> {
    match value {
        JsonValue::Object(doc) => Ok(doc.clone()),
        JsonValue::Null => Ok(Document::new()),
        other => Err(Error::BadFilter(other.to_string())),
    }
}

/// Splits `{ data, where }` update arguments; a plain document is all data.
fn data_and_where(arg: &JsonValue) -> Result<(Document, Document)> {
    match arg.as_object() {
        Some(doc) if doc.contains_key("data") => {
            Ok((object(doc.get("data").unwrap_or(&JsonValue::Null))?, object(doc.get("where").unwrap_or(&JsonValue::Null))?))
        }
        _ => Ok((object(arg)?, Document::new())),
    }
}

impl<'s> TableOps<'s> {
    fn key_of(&self, doc: &Document) -> Value {
        let m = self.model();
        self.schema.value_of(self.model, doc, m.key_field()).unwrap_or(Value::Null)
    }

    /// Inserts `data`, resolving parent operations first and applying child
    /// operations afterwards, then re-reads the row.
    pub(crate) fn create<'a>(&'a self, conn: &'a mut dyn Connection, data: &'a Document) -> BoxFuture<'a, Result<Document>> {
        Box::pin(async move {
            if data.is_empty() {
                return Err(Error::EmptyData(self.model().name.clone()));
            }
            let row = self.resolve_parent_fields(conn, data, None).await?;
            self.create_resolved(conn, data, &row).await
        })
    }

    async fn create_resolved(&self, conn: &mut dyn Connection, data: &Document, row: &Document) -> Result<Document> {
        let id = self.insert_row(conn, row).await?;
        self.update_child_fields(conn, data, &id).await?;
        self.get(conn, &id.to_json()).await?.ok_or(Error::RowNotFound)
    }

    /// Creates the row named by the unique key in `data`, or applies `update`
    /// to it when it exists.
    pub(crate) fn upsert<'a>(
        &'a self,
        conn: &'a mut dyn Connection,
        data: &'a Document,
        update: &'a Document,
    ) -> BoxFuture<'a, Result<Document>> {
        Box::pin(async move {
            let m = self.model();
            if !self.schema.check_unique_key(self.model, data) {
                return Err(Error::Incomplete(m.name.clone()));
            }
            let row = self.resolve_parent_fields(conn, data, None).await?;
            let unique = self.schema.unique_fields(self.model, &row).ok_or_else(|| Error::Incomplete(m.name.clone()))?;

            match self.get(conn, &JsonValue::Object(unique.clone())).await? {
                None => self.create_resolved(conn, data, &row).await,
                Some(_) if !update.is_empty() => {
                    self.modify(conn, update, &unique).await?.ok_or(Error::RowNotFound)
                }
                Some(existing) => Ok(existing),
            }
        })
    }

    /// Updates the row matching the unique `filter`, then applies child
    /// operations. Returns the row as it reads after the update.
    pub(crate) fn modify<'a>(
        &'a self,
        conn: &'a mut dyn Connection,
        data: &'a Document,
        filter: &'a Document,
    ) -> BoxFuture<'a, Result<Option<Document>>> {
        Box::pin(async move {
            if !self.schema.check_unique_key(self.model, filter) {
                return Err(Error::BadFilter(JsonValue::Object(filter.clone()).to_string()));
            }
            let row = self.resolve_parent_fields(conn, data, Some(filter)).await?;
            self.update(conn, &row, &JsonValue::Object(filter.clone())).await?;

            let mut lookup = filter.clone();
            for (name, value) in &row {
                lookup.insert(name.clone(), value.clone());
            }
            let Some(found) = self.get(conn, &JsonValue::Object(lookup)).await? else {
                return Ok(None);
            };
            let id = self.key_of(&found);
            self.update_child_fields(conn, data, &id).await?;
            Ok(Some(found))
        })
    }

    /// Copies column fields, replacing parent operations on foreign keys by the
    /// key they resolve to.
    async fn resolve_parent_fields(
        &self,
        conn: &mut dyn Connection,
        input: &Document,
        filter: Option<&Document>,
    ) -> Result<Document> {
        let m = self.model();
        let mut row = Document::new();

        for (name, value) in input {
            let index = m.field_index(name).ok_or_else(|| Error::unknown_field(&m.name, name))?;
            let fk = match &m.fields[index] {
                Field::Related(_) => continue,
                Field::Simple(_) => {
                    row.insert(name.clone(), value.clone());
                    continue;
                }
                Field::ForeignKey(fk) => fk,
            };

            // a single key that is not a field of the parent names an operation
            let parent = self.at(fk.referenced.model);
            let operation = value.as_object().filter(|doc| doc.len() == 1).and_then(|doc| doc.iter().next());
            let Some((method, arg)) = operation.filter(|(method, _)| parent.model().field(method).is_none()) else {
                row.insert(name.clone(), value.clone());
                continue;
            };

            match method.as_str() {
                "connect" => {
                    let found = parent.get(conn, arg).await?;
                    let key = found.map(|doc| parent.key_of(&doc)).unwrap_or(Value::Null);
                    row.insert(name.clone(), key.to_json());
                }
                "create" => {
                    let created = parent.create(conn, &object(arg)?).await?;
                    row.insert(name.clone(), parent.key_of(&created).to_json());
                }
                "update" => {
                    let filter = filter.ok_or_else(|| Error::UnsupportedMethod(method.clone()))?;
                    let current = self.get(conn, &JsonValue::Object(filter.clone())).await?.ok_or(Error::RowNotFound)?;
                    let Some(key) = self.schema.value_of(self.model, &current, index).filter(|k| !k.is_null()) else {
                        continue;
                    };
                    let parent_filter = single(parent.model().key_name(), key.to_json());
                    parent.modify(conn, &object(arg)?, &parent_filter).await?;
                }
                other => return Err(Error::UnsupportedMethod(other.to_string())),
            }
        }
        Ok(row)
    }

    async fn update_child_fields(&self, conn: &mut dyn Connection, data: &Document, id: &Value) -> Result<()> {
        let m = self.model();
        for (name, value) in data {
            if let Some(Field::Related(related)) = m.field(name) {
                match related.through {
                    Some(through) => self.update_child_through(conn, related, through, id, value).await?,
                    None => self.update_child_field(conn, related, id, value).await?,
                }
            }
        }
        Ok(())
    }

    /// Detaches the single child of a unique foreign key: nulls it out when the
    /// column allows it, deletes the child otherwise.
    async fn disconnect_unique(&self, conn: &mut dyn Connection, fk: &ForeignKeyField, id: &Value) -> Result<()> {
        let by_parent = JsonValue::Object(single(&fk.simple.name, id.to_json()));
        if fk.simple.column.nullable {
            self.update(conn, &single(&fk.simple.name, JsonValue::Null), &by_parent).await?;
        } else {
            self.delete(conn, &by_parent).await?;
        }
        Ok(())
    }

    async fn update_child_field(
        &self,
        conn: &mut dyn Connection,
        related: &RelatedField,
        id: &Value,
        value: &JsonValue,
    ) -> Result<()> {
        let schema = self.schema;
        let child = self.at(related.referencing.model);
        let fk = schema.foreign_key(related.referencing);
        let fk_name = fk.simple.name.as_str();
        let unique = schema.is_unique_reference(related.referencing);
        let by_parent = single(fk_name, id.to_json());

        if value.is_null() {
            return child.disconnect_unique(conn, fk, id).await;
        }
        let methods = value.as_object().ok_or_else(|| Error::BadFilter(value.to_string()))?;

        for (method, arg) in methods {
            match method.as_str() {
                "connect" => {
                    for item in to_array(arg) {
                        let filter = if is_value(item) {
                            single(child.model().key_name(), item.clone())
                        } else {
                            object(item)?
                        };
                        if !schema.check_unique_key(child.model, &filter) {
                            return Err(Error::BadFilter(item.to_string()));
                        }
                        if unique {
                            child.disconnect_unique(conn, fk, id).await?;
                        }
                        child.update(conn, &by_parent, &JsonValue::Object(filter)).await?;
                    }
                }
                "create" => {
                    let docs: Vec<Document> =
                        to_array(arg).into_iter().map(|item| object(item).map(|doc| with(doc, fk_name, id.to_json()))).collect::<Result<_>>()?;
                    if unique {
                        child.disconnect_unique(conn, fk, id).await?;
                        if let Some(doc) = docs.first() {
                            child.create(conn, doc).await?;
                        }
                    } else {
                        for doc in &docs {
                            child.create(conn, doc).await?;
                        }
                    }
                }
                "upsert" => {
                    for item in to_array(arg) {
                        let item = object(item)?;
                        let create = with(object(item.get("create").unwrap_or(&JsonValue::Null))?, fk_name, id.to_json());
                        let update = object(item.get("update").unwrap_or(&JsonValue::Null))?;
                        child.upsert(conn, &create, &update).await?;
                    }
                }
                "update" => {
                    for item in to_array(arg) {
                        let (data, filter) = data_and_where(item)?;
                        let filter = with(filter, fk_name, id.to_json());
                        child.modify(conn, &data, &filter).await?;
                    }
                }
                "delete" => {
                    let filters = to_array(arg)
                        .into_iter()
                        .map(|item| object(item).map(|doc| JsonValue::Object(with(doc, fk_name, id.to_json()))))
                        .collect::<Result<Vec<_>>>()?;
                    child.delete(conn, &JsonValue::Array(filters)).await?;
                }
                "disconnect" => {
                    let filters = to_array(arg)
                        .into_iter()
                        .map(|item| object(item).map(|doc| JsonValue::Object(with(doc, fk_name, id.to_json()))))
                        .collect::<Result<Vec<_>>>()?;
                    child.update(conn, &single(fk_name, JsonValue::Null), &JsonValue::Array(filters)).await?;
                }
                "set" => {
                    child.delete(conn, &JsonValue::Object(by_parent.clone())).await?;
                    for item in to_array(arg) {
                        let doc = with(object(item)?, fk_name, id.to_json());
                        child.create(conn, &doc).await?;
                    }
                }
                other => return Err(Error::UnsupportedMethod(other.to_string())),
            }
        }
        Ok(())
    }

    /// Child operations on a many-to-many field. `connect`/`create`/`upsert`
    /// act on the far rows and add join rows; `disconnect` removes join rows;
    /// `delete` removes both; `set` replaces every join row.
    async fn update_child_through(
        &self,
        conn: &mut dyn Connection,
        related: &RelatedField,
        through: FieldRef,
        id: &Value,
        value: &JsonValue,
    ) -> Result<()> {
        let schema = self.schema;
        let mapping = self.at(related.referencing.model);
        let near = schema.foreign_key(related.referencing).simple.name.as_str();
        let far_fk = schema.foreign_key(through);
        let far_name = far_fk.simple.name.as_str();
        let far = self.at(far_fk.referenced.model);
        let by_parent = single(near, id.to_json());

        if value.is_null() {
            mapping.delete(conn, &JsonValue::Object(by_parent)).await?;
            return Ok(());
        }
        let methods = value.as_object().ok_or_else(|| Error::BadFilter(value.to_string()))?;

        for (method, arg) in methods {
            match method.as_str() {
                "connect" | "set" => {
                    if method == "set" {
                        mapping.delete(conn, &JsonValue::Object(by_parent.clone())).await?;
                    }
                    for item in to_array(arg) {
                        let Some(found) = far.get(conn, item).await? else { continue };
                        let link = with(by_parent.clone(), far_name, far.key_of(&found).to_json());
                        mapping.upsert(conn, &link, &Document::new()).await?;
                    }
                }
                "create" => {
                    for item in to_array(arg) {
                        let created = far.create(conn, &object(item)?).await?;
                        let link = with(by_parent.clone(), far_name, far.key_of(&created).to_json());
                        mapping.create(conn, &link).await?;
                    }
                }
                "upsert" => {
                    for item in to_array(arg) {
                        let item = object(item)?;
                        let create = object(item.get("create").unwrap_or(&JsonValue::Null))?;
                        let update = object(item.get("update").unwrap_or(&JsonValue::Null))?;
                        let row = far.upsert(conn, &create, &update).await?;
                        let link = with(by_parent.clone(), far_name, far.key_of(&row).to_json());
                        mapping.upsert(conn, &link, &Document::new()).await?;
                    }
                }
                "update" => {
                    let back = far_fk
                        .related
                        .map(|r| schema.field(r).name().to_string())
                        .ok_or_else(|| Error::UnsupportedMethod(method.clone()))?;
                    for item in to_array(arg) {
                        let (data, filter) = data_and_where(item)?;
                        let linked = single(self.model().key_name(), id.to_json());
                        let filter = with(filter, &back, JsonValue::Object(linked));
                        far.modify(conn, &data, &filter).await?;
                    }
                }
                "delete" => {
                    for item in to_array(arg) {
                        let filter = JsonValue::Object(with(by_parent.clone(), far_name, item.clone()));
                        let links = mapping.select(conn, &JsonValue::String("*".into()), &SelectOptions::new().filter(filter.clone())).await?;
                        let keys: Vec<JsonValue> = links
                            .iter()
                            .filter_map(|link| schema.value_of(mapping.model, link, through.field))
                            .map(|key| key.to_json())
                            .collect();
                        mapping.delete(conn, &filter).await?;
                        if !keys.is_empty() {
                            far.delete(conn, &JsonValue::Object(single(far.model().key_name(), JsonValue::Array(keys)))).await?;
                        }
                    }
                }
                "disconnect" => {
                    for item in to_array(arg) {
                        let filter = with(by_parent.clone(), far_name, item.clone());
                        mapping.delete(conn, &JsonValue::Object(filter)).await?;
                    }
                }
                other => return Err(Error::UnsupportedMethod(other.to_string())),
            }
        }
        Ok(())
    }
}

// ============================================================================
// Database Entry Points
// ============================================================================

impl Database {
    fn document(&self, table: &str, data: &JsonValue) -> Result<Document> {
        match data {
            JsonValue::Object(doc) => Ok(doc.clone()),
            _ => Err(Error::EmptyData(table.to_string())),
        }
    }

    /// Creates a row with its nested parents and children in one transaction.
    pub async fn create(&self, table: &str, data: &JsonValue) -> Result<Document> {
        let ops = TableOps::new(&self.schema, self.model_id(table)?);
        let data = self.document(table, data)?;
        let mut conn = self.pool.get_connection().await?;
        let mut tx = Transaction::begin(&mut *conn).await?;
        let result = ops.create(tx.connection(), &data).await;
        tx.finish(result).await
    }

    /// Creates the row identified by the unique key in `data`, or applies
    /// `update` to the existing one.
    pub async fn upsert(&self, table: &str, data: &JsonValue, update: &JsonValue) -> Result<Document> {
        let ops = TableOps::new(&self.schema, self.model_id(table)?);
        let data = self.document(table, data)?;
        let update = object(update)?;
        let mut conn = self.pool.get_connection().await?;
        let mut tx = Transaction::begin(&mut *conn).await?;
        let result = ops.upsert(tx.connection(), &data, &update).await;
        tx.finish(result).await
    }

    /// Updates the row selected by a unique `filter` and applies nested
    /// operations. Returns `None` when no row matches.
    pub async fn modify(&self, table: &str, data: &JsonValue, filter: &JsonValue) -> Result<Option<Document>> {
        let ops = TableOps::new(&self.schema, self.model_id(table)?);
        let data = self.document(table, data)?;
        let filter = object(filter)?;
        let mut conn = self.pool.get_connection().await?;
        let mut tx = Transaction::begin(&mut *conn).await?;
        let result = ops.modify(tx.connection(), &data, &filter).await;
        tx.finish(result).await
    }
}
