//! # Subtree Replacement
//!
//! [`Database::replace`] makes the rows under a record look exactly like a
//! nested document: the root row is written, every related field listed in the
//! document is written child by child, and the children the document no longer
//! mentions are deleted.
//!
//! Children are matched to existing rows by the flush lookup, so a child that
//! keeps its unique key keeps its row (and primary key).
//!
//! ```rust,ignore
//! let (tree, order) = db.replace("Order", &json!({
//!     "code": "A-1",
//!     "user": { "email": "alice@example.com" },
//!     "orderItems": [
//!         { "product": { "sku": "P-1" }, "quantity": 2 }
//!     ]
//! })).await?;
//! ```

use futures::future::BoxFuture;
use serde_json::Value as JsonValue;

use crate::{
    connection::Connection,
    database::Database,
    flush::column_data,
    record::{Input, RecordId},
    schema::{Field, ModelId, RelatedField},
    table::TableOps,
    transaction::Transaction,
    value::Document,
    Error, Result,
};

/// The items of a related field: an array, a single object, or nothing.
fn related_items(model: &str, field: &str, value: &JsonValue) -> Result<Vec<Document>> {
    let items = match value {
        JsonValue::Null => return Ok(Vec::new()),
        JsonValue::Array(items) => items.iter().collect(),
        JsonValue::Object(_) => vec![value],
        other => {
            return Err(Error::InvalidValue { field: format!("{}.{}", model, field), value: other.to_string() });
        }
    };
    items
        .into_iter()
        .map(|item| match item {
            JsonValue::Object(doc) => Ok(doc.clone()),
            other => Err(Error::InvalidValue { field: format!("{}.{}", model, field), value: other.to_string() }),
        })
        .collect()
}

/// Items that carry no nested lists can be written together.
fn is_shallow(item: &Document) -> bool {
    !item.values().any(JsonValue::is_array)
}

impl Database {
    /// Replaces the subtree rooted at `doc` in one transaction.
    ///
    /// Returns the database holding the written records and the root's handle.
    pub async fn replace(&self, table: &str, doc: &JsonValue) -> Result<(Database, RecordId)> {
        let model = self.model_id(table)?;
        let doc = match doc {
            JsonValue::Object(doc) if !doc.is_empty() => doc,
            _ => return Err(Error::EmptyData(self.schema.model(model).name.clone())),
        };

        let mut tree = self.fork();
        let mut conn = self.pool.get_connection().await?;
        let mut tx = Transaction::begin(&mut *conn).await?;
        let result = tree.replace_record(tx.connection(), model, doc).await;
        let root = tx.finish(result).await?;
        Ok((tree, root))
    }

    fn replace_record<'a>(
        &'a mut self,
        conn: &'a mut dyn Connection,
        model: ModelId,
        doc: &'a Document,
    ) -> BoxFuture<'a, Result<RecordId>> {
        Box::pin(async move {
            let schema = std::sync::Arc::clone(&self.schema);
            let m = schema.model(model);

            let data = column_data(self, model, doc)?;
            let root = self.append_to(model, data)?;
            self.flush_database(conn, true).await?;
            let root = self.resolve(root);
            let key = match self.primary_key(root) {
                Some(key) if !key.is_null() => key,
                _ => return Err(Error::RowNotFound),
            };

            for (name, value) in doc {
                let Some(Field::Related(related)) = m.field(name) else { continue };
                let index = m.field_index(name).ok_or_else(|| Error::unknown_field(&m.name, name))?;
                let items = related_items(&m.name, name, value)?;

                let children = match related.through {
                    None => self.replace_children(conn, root, related, items).await?,
                    Some(_) => self.replace_links(conn, root, related, items).await?,
                };
                log::debug!("{}({}).{}: {} records", m.name, key, name, children.len());
                self.record_mut(root).related.insert(index, children);
            }
            Ok(root)
        })
    }

    /// One-to-many: children get the root as their parent, stale children go.
    async fn replace_children(
        &mut self,
        conn: &mut dyn Connection,
        root: RecordId,
        related: &RelatedField,
        items: Vec<Document>,
    ) -> Result<Vec<RecordId>> {
        let schema = std::sync::Arc::clone(&self.schema);
        let child = related.referencing.model;
        let fk = schema.field(related.referencing).name().to_string();

        let mut children = Vec::with_capacity(items.len());
        for mut item in items {
            let id = if is_shallow(&item) {
                let mut data = column_data(self, child, &item)?;
                data.0.push((fk.clone(), Input::Record(root)));
                self.append_to(child, data)?
            } else {
                item.insert(fk.clone(), self.plainify(root));
                self.replace_record(conn, child, &item).await?
            };
            children.push(id);
        }
        self.flush_database(conn, true).await?;

        let children: Vec<RecordId> = children.into_iter().map(|id| self.resolve(id)).collect();
        let kept: Vec<JsonValue> = children.iter().filter_map(|&id| self.primary_key(id)).map(|k| k.to_json()).collect();
        self.delete_stale(conn, child, &fk, root, schema.model(child).key_name(), kept).await?;
        Ok(children)
    }

    /// Many-to-many: far rows first, then one join row per far row.
    async fn replace_links(
        &mut self,
        conn: &mut dyn Connection,
        root: RecordId,
        related: &RelatedField,
        items: Vec<Document>,
    ) -> Result<Vec<RecordId>> {
        let schema = std::sync::Arc::clone(&self.schema);
        let Some(through) = related.through else { return Ok(Vec::new()) };
        let join = related.referencing.model;
        let near = schema.field(related.referencing).name().to_string();
        let far_fk = schema.foreign_key(through);
        let far = far_fk.referenced.model;
        let far_name = far_fk.simple.name.clone();

        let mut targets = Vec::with_capacity(items.len());
        for item in items {
            let id = if is_shallow(&item) {
                let data = column_data(self, far, &item)?;
                self.append_to(far, data)?
            } else {
                self.replace_record(conn, far, &item).await?
            };
            targets.push(id);
        }
        self.flush_database(conn, true).await?;

        let targets: Vec<RecordId> = targets.into_iter().map(|id| self.resolve(id)).collect();
        for &target in &targets {
            let data = crate::record::Data::new().with(near.clone(), root).with(far_name.clone(), target);
            self.append_to(join, data)?;
        }
        self.flush_database(conn, true).await?;

        let kept: Vec<JsonValue> = targets.iter().filter_map(|&id| self.primary_key(id)).map(|k| k.to_json()).collect();
        self.delete_stale(conn, join, &near, root, &far_name, kept).await?;
        Ok(targets)
    }

    /// Deletes the rows of `model` under `root` whose `field` is not in `kept`.
    async fn delete_stale(
        &self,
        conn: &mut dyn Connection,
        model: ModelId,
        fk: &str,
        root: RecordId,
        field: &str,
        kept: Vec<JsonValue>,
    ) -> Result<()> {
        let key = self.primary_key(root).map(|k| k.to_json()).unwrap_or(JsonValue::Null);
        let mut not = Document::new();
        not.insert(field.to_string(), JsonValue::Array(kept));
        let mut filter = Document::new();
        filter.insert(fk.to_string(), key);
        filter.insert("not".into(), JsonValue::Object(not));

        let removed = TableOps::new(&self.schema, model).delete(conn, &JsonValue::Object(filter)).await?;
        if removed > 0 {
            log::debug!("{}: deleted {} stale rows", self.schema.model(model).name, removed);
        }
        Ok(())
    }
}
