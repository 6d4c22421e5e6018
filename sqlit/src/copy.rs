//! # Record Copy
//!
//! Deep-copies a record together with the rows that depend on it.
//!
//! A table is part of the copy when one of its unique keys contains a foreign
//! key to a table already in the copy, so an order brings its order items but
//! not the products they reference. The copied rows are loaded into a fresh
//! database, `data` is applied to the root, auto-increment keys are dropped so
//! the rows insert as new ones, and the whole set is flushed.
//!
//! ```rust,ignore
//! let order = db.append("Order", json!({ "code": "A-1" }))?;
//! let (copy, root) = db.copy_record(order, json!({ "code": "A-2" }), CopyOptions::default()).await?;
//! ```

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::{
    database::Database,
    query::Projection,
    record::{Data, Input, RecordId},
    schema::{Field, ModelId},
    table::{SelectOptions, TableOps},
    value::Document,
    Error, Result,
};

/// Options of [`Database::copy_record`].
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Model or table names left out of the copy.
    pub except: Vec<String>,
}

impl CopyOptions {
    pub fn except(mut self, names: &[&str]) -> Self {
        self.except.extend(names.iter().map(|n| n.to_string()));
        self
    }
}

impl Database {
    /// The filter selecting the rows of every copied table.
    fn copy_filters(&self, model: ModelId, root: JsonValue, options: &CopyOptions) -> IndexMap<ModelId, JsonValue> {
        let mut filters = IndexMap::new();
        filters.insert(model, JsonValue::Array(vec![root]));

        loop {
            let mut added = 0;
            for m in &self.schema.models {
                if filters.contains_key(&m.id) || options.except.iter().any(|e| e == &m.name || e == &m.table_name) {
                    continue;
                }

                let mut parts = Vec::new();
                for key in &m.unique_keys {
                    for &field in &key.fields {
                        let Field::ForeignKey(fk) = &m.fields[field] else { continue };
                        let referenced = fk.referenced.model;
                        if referenced == m.id {
                            continue;
                        }
                        if let Some(filter) = filters.get(&referenced) {
                            let mut part = Document::new();
                            part.insert(fk.simple.name.clone(), filter.clone());
                            parts.push(JsonValue::Object(part));
                        }
                    }
                }

                let filter = match parts.len() {
                    0 => continue,
                    1 => parts.remove(0),
                    _ => JsonValue::Array(parts),
                };
                filters.insert(m.id, filter);
                added += 1;
            }
            if added == 0 {
                break;
            }
        }
        filters
    }

    /// Appends a selected row: the key and references stay clean, the other
    /// fields become dirty.
    fn append_row(&mut self, model: ModelId, row: &Document) -> Result<RecordId> {
        let schema = std::sync::Arc::clone(&self.schema);
        let m = schema.model(model);
        let key = row.get(m.key_name()).cloned().unwrap_or(JsonValue::Null);
        let id = self.append_reference(model, key)?;

        for (index, field) in m.fields.iter().enumerate() {
            if index == m.key_field() {
                continue;
            }
            match field {
                Field::ForeignKey(fk) => match row.get(&fk.simple.name) {
                    None | Some(JsonValue::Null) => {}
                    Some(value) => self.assign(id, &fk.simple.name, Input::Json(value.clone()))?,
                },
                Field::Simple(simple) => {
                    if let Some(value) = row.get(&simple.name) {
                        self.assign(id, &simple.name, Input::Json(value.clone()))?;
                    }
                }
                Field::Related(_) => {}
            }
        }
        Ok(id)
    }

    /// Copies a record and its dependent rows, applying `data` to the copy of
    /// the record itself.
    ///
    /// Returns the database holding the copies and the handle of the root copy.
    pub async fn copy_record(&self, id: RecordId, data: impl Into<Data>, options: CopyOptions) -> Result<(Database, RecordId)> {
        let id = self.resolve(id);
        let model = self.record(id).table;
        let root = self.plainify(id);
        if root.is_null() {
            return Err(Error::BadFilter(self.dump(id).to_string()));
        }

        let filters = self.copy_filters(model, root, &options);
        let mut copy = self.fork();
        {
            let mut conn = self.pool.get_connection().await?;
            for (table, filter) in &filters {
                let select = SelectOptions::new().filter(filter.clone());
                let rows = TableOps::new(&self.schema, *table).query_documents(&mut *conn, Projection::All, &select).await?;
                log::debug!("copy: {} rows of {}", rows.len(), self.schema.model(*table).name);
                for row in &rows {
                    copy.append_row(*table, row)?;
                }
            }
        }

        let root = copy.tables[model].records.first().copied().ok_or(Error::RowNotFound)?;
        let m = self.schema.model(model);
        for (name, input) in data.into().0 {
            if let Some(index) = m.field_index(&name) {
                copy.records[root.0].data[index] = None;
            }
            copy.set(root, &name, input)?;
        }

        for table in 0..copy.tables.len() {
            let m = copy.schema.model(table);
            if !m.is_auto_increment() {
                continue;
            }
            let key = m.key_field();
            for record in copy.tables[table].records.clone() {
                let record = &mut copy.records[record.0];
                if record.data.iter().filter(|v| v.is_some()).count() > 1 {
                    record.data[key] = None;
                    record.state.dirty.remove(&key);
                }
            }
        }

        copy.flush().await?;
        Ok((copy, root))
    }
}
