//! # Table Module
//!
//! Direct, record-free access to one mapped table: `select`, `get`, `insert`,
//! `update`, `delete`, `count` and `claim`. Filters and field shapes are JSON
//! documents (see [`crate::query::filter`]).
//!
//! A [`Table`] also carries the records of its [`Database`](crate::Database) and
//! their identity maps; the statement logic itself lives in [`TableOps`] so the
//! flush engine and nested mutations can run it on a borrowed connection.
//!
//! ```rust,ignore
//! let orders = db.table("Order")?;
//! let recent = orders
//!     .select(&json!({ "user": { "email": true }, "orderItems": true }),
//!             &SelectOptions::new().filter(json!({ "status_ge": 1 })).order_by("-dateCreated"))
//!     .await?;
//! ```

// ============================================================================
// External Crate Imports
// ============================================================================

use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{
    connection::{Connection, ConnectionPool},
    document::to_document,
    query::{
        ast::{Delete, Expr, Insert, Statement, Update},
        filter::{should_select_separately, truthy},
        Projection, QueryBuilder,
    },
    record::RecordId,
    schema::{Field, Model, ModelId, RelatedField, Schema},
    value::{is_value, normalize, to_row, Document, Value},
    Error, Result,
};

// ============================================================================
// Select Options
// ============================================================================

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(entry) => vec![entry],
        OneOrMany::Many(entries) => entries,
    })
}

/// Filter, ordering and paging of a select.
///
/// Deserializes from the options object of a related field in a field shape:
/// `{ "where": {...}, "orderBy": ["-date"], "limit": 5, "offset": 0 }`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectOptions {
    #[serde(rename = "where")]
    pub filter: JsonValue,
    /// Field paths, `-path` or `path desc` for descending order.
    #[serde(deserialize_with = "one_or_many")]
    pub order_by: Vec<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: JsonValue) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, entry: &str) -> Self {
        self.order_by.push(entry.to_string());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// `'*'`, `true` and null select every column; an array of names is a shape
/// listing those fields.
fn field_shape(fields: &JsonValue) -> Result<Option<Document>> {
    match fields {
        JsonValue::Null | JsonValue::Bool(true) => Ok(None),
        JsonValue::String(s) if s == "*" => Ok(None),
        JsonValue::Object(doc) => Ok(Some(doc.clone())),
        JsonValue::Array(names) => {
            let mut doc = Document::new();
            for name in names {
                let name = name.as_str().ok_or_else(|| Error::BadFilter(fields.to_string()))?;
                doc.insert(name.to_string(), JsonValue::Bool(true));
            }
            Ok(Some(doc))
        }
        other => Err(Error::BadFilter(other.to_string())),
    }
}

/// Splits the value of a related field in a shape into its own field shape and
/// select options.
fn related_options(value: &JsonValue) -> Result<(JsonValue, SelectOptions)> {
    match value {
        JsonValue::Object(doc) => {
            let fields = doc.get("fields").cloned().unwrap_or_else(|| JsonValue::String("*".into()));
            Ok((fields, serde_json::from_value(value.clone())?))
        }
        _ => Ok((JsonValue::String("*".into()), SelectOptions::default())),
    }
}

// ============================================================================
// Table Struct
// ============================================================================

/// One mapped table of a [`Database`](crate::Database).
#[derive(Clone)]
pub struct Table {
    pub(crate) model: ModelId,
    pub(crate) schema: Arc<Schema>,
    pub(crate) pool: Arc<dyn ConnectionPool>,
    /// Records in insertion order. Merged records stay listed.
    pub(crate) records: Vec<RecordId>,
    /// One identity map per unique key, keyed by the JSON-encoded key values.
    pub(crate) record_map: Vec<HashMap<String, RecordId>>,
}

impl Table {
    pub(crate) fn new(model: &Model, schema: Arc<Schema>, pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            model: model.id,
            schema,
            pool,
            records: Vec::new(),
            record_map: vec![HashMap::new(); model.unique_keys.len()],
        }
    }

    pub fn model(&self) -> &Model {
        self.schema.model(self.model)
    }

    pub fn name(&self) -> &str {
        &self.model().name
    }

    pub fn records(&self) -> &[RecordId] {
        &self.records
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
        for map in &mut self.record_map {
            map.clear();
        }
    }

    pub(crate) fn ops(&self) -> TableOps<'_> {
        TableOps::new(&self.schema, self.model)
    }

    /// Selects documents. `fields` is `"*"` or a field shape; related fields in
    /// the shape are fetched with extra queries.
    pub async fn select(&self, fields: &JsonValue, options: &SelectOptions) -> Result<Vec<Document>> {
        let mut conn = self.pool.get_connection().await?;
        self.ops().select(&mut *conn, fields, options).await
    }

    /// Fetches one row by primary key or by a complete unique key.
    pub async fn get(&self, key: &JsonValue) -> Result<Option<Document>> {
        let mut conn = self.pool.get_connection().await?;
        self.ops().get(&mut *conn, key).await
    }

    /// Inserts one row and returns its key.
    pub async fn insert(&self, data: &JsonValue) -> Result<Value> {
        let mut conn = self.pool.get_connection().await?;
        let doc = data.as_object().ok_or_else(|| Error::EmptyData(self.name().to_string()))?;
        self.ops().insert_row(&mut *conn, doc).await
    }

    /// Updates the rows matching `filter`, returning the affected row count.
    pub async fn update(&self, data: &JsonValue, filter: &JsonValue) -> Result<u64> {
        let mut conn = self.pool.get_connection().await?;
        let doc = data.as_object().ok_or_else(|| Error::EmptyData(self.name().to_string()))?;
        self.ops().update(&mut *conn, doc, filter).await
    }

    pub async fn delete(&self, filter: &JsonValue) -> Result<u64> {
        let mut conn = self.pool.get_connection().await?;
        self.ops().delete(&mut *conn, filter).await
    }

    /// Counts matching rows, or the non-null values of `field`.
    pub async fn count(&self, filter: &JsonValue, field: Option<&str>) -> Result<i64> {
        let mut conn = self.pool.get_connection().await?;
        self.ops().count(&mut *conn, filter, field).await
    }

    /// Atomically takes one row matching `filter` by applying `data` to it.
    ///
    /// Up to ten candidates are read and one is picked at random; the update
    /// is conditional on the filter still matching, so concurrent claimers
    /// never take the same row. Returns `None` once no row matches.
    ///
    /// ```rust,ignore
    /// let job = db.table("Job")?.claim(&json!({ "status": 1 }), &json!({ "status": 0 }), &[]).await?;
    /// ```
    pub async fn claim(&self, data: &JsonValue, filter: &JsonValue, order_by: &[String]) -> Result<Option<Document>> {
        let data = data.as_object().ok_or_else(|| Error::EmptyData(self.name().to_string()))?;
        let mut conn = self.pool.get_connection().await?;
        let ops = self.ops();
        let options = SelectOptions { filter: filter.clone(), order_by: order_by.to_vec(), limit: Some(10), offset: None };

        loop {
            let rows = ops.query_documents(&mut *conn, Projection::All, &options).await?;
            if rows.is_empty() {
                return Ok(None);
            }

            let pick = rand::thread_rng().gen_range(0..rows.len());
            let key = self
                .schema
                .unique_fields(self.model, &rows[pick])
                .ok_or_else(|| Error::BadSelector(JsonValue::Object(rows[pick].clone()).to_string()))?;
            let condition = JsonValue::Array(vec![filter.clone(), JsonValue::Object(key.clone())]);
            let mut guarded = Document::new();
            guarded.insert("and".into(), condition);

            if ops.update(&mut *conn, data, &JsonValue::Object(guarded)).await? == 1 {
                return ops.get(&mut *conn, &JsonValue::Object(key)).await;
            }

            let delay = rand::thread_rng().gen_range(0..1000);
            log::debug!("{}: claim lost, retrying in {}ms", self.name(), delay);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}

// ============================================================================
// Statement Operations
// ============================================================================

/// The statements of one table, run on a caller-provided connection.
#[derive(Clone, Copy)]
pub(crate) struct TableOps<'s> {
    pub(crate) schema: &'s Schema,
    pub(crate) model: ModelId,
}

impl<'s> TableOps<'s> {
    pub(crate) fn new(schema: &'s Schema, model: ModelId) -> Self {
        Self { schema, model }
    }

    /// The same operations on another model.
    pub(crate) fn at(&self, model: ModelId) -> TableOps<'s> {
        TableOps { schema: self.schema, model }
    }

    pub(crate) fn model(&self) -> &'s Model {
        self.schema.model(self.model)
    }

    pub(crate) fn select<'a>(
        &'a self,
        conn: &'a mut dyn Connection,
        fields: &'a JsonValue,
        options: &'a SelectOptions,
    ) -> BoxFuture<'a, Result<Vec<Document>>> {
        Box::pin(async move {
            let shape = field_shape(fields)?;
            let projection = match &shape {
                Some(doc) => Projection::Shape(doc),
                None => Projection::All,
            };
            let mut rows = self.query_documents(conn, projection, options).await?;
            if let Some(shape) = &shape {
                self.resolve_related_fields(conn, &mut rows, shape).await?;
            }
            Ok(rows)
        })
    }

    pub(crate) async fn query_documents(
        &self,
        conn: &mut dyn Connection,
        projection: Projection<'_>,
        options: &SelectOptions,
    ) -> Result<Vec<Document>> {
        let mut builder = QueryBuilder::new(self.schema);
        let mut select = builder.select(self.model, projection, &options.filter, &options.order_by)?;
        select.limit = options.limit;
        select.offset = options.offset;

        let rows = conn.query(&Statement::Select(select)).await?;
        let mut docs = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(doc) = to_document(self.schema, self.model, row, builder.field_map())? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    async fn resolve_related_fields(
        &self,
        conn: &mut dyn Connection,
        rows: &mut [Document],
        shape: &Document,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let schema = self.schema;
        let m = self.model();

        for (name, value) in shape {
            let Some(index) = m.field_index(name) else { continue };
            match &m.fields[index] {
                Field::Related(related) if truthy(value) => {
                    let (fields, options) = related_options(value)?;
                    let parents: Vec<Value> = rows
                        .iter()
                        .map(|row| schema.value_of(self.model, row, m.key_field()).unwrap_or(Value::Null))
                        .collect();
                    let results = self.select_related(conn, related, &parents, &fields, &options).await?;
                    for (row, result) in rows.iter_mut().zip(results) {
                        row.insert(name.clone(), result);
                    }
                }
                Field::ForeignKey(fk) if should_select_separately(schema, fk.referenced.model, value) => {
                    let referenced = schema.model(fk.referenced.model);
                    let mut keys: Vec<Value> = Vec::new();
                    for row in rows.iter() {
                        match schema.value_of(self.model, row, index) {
                            Some(key) if !key.is_null() && !keys.contains(&key) => keys.push(key),
                            _ => {}
                        }
                    }
                    if keys.is_empty() {
                        continue;
                    }

                    let mut filter = Document::new();
                    filter.insert(
                        referenced.key_name().to_string(),
                        JsonValue::Array(keys.iter().map(Value::to_json).collect()),
                    );
                    let options = SelectOptions::new().filter(JsonValue::Object(filter));
                    let docs = self.at(referenced.id).select(conn, value, &options).await?;

                    let by_key: HashMap<Value, Document> = docs
                        .into_iter()
                        .filter_map(|doc| schema.value_of(referenced.id, &doc, referenced.key_field()).map(|k| (k, doc)))
                        .collect();
                    for row in rows.iter_mut() {
                        let found = schema.value_of(self.model, row, index).and_then(|key| by_key.get(&key));
                        if let Some(doc) = found {
                            row.insert(name.clone(), JsonValue::Object(doc.clone()));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Fetches the children of every parent key, one result per parent: an
    /// array, or a single document (or null) when the foreign key is unique.
    async fn select_related(
        &self,
        conn: &mut dyn Connection,
        related: &RelatedField,
        parents: &[Value],
        fields: &JsonValue,
        options: &SelectOptions,
    ) -> Result<Vec<JsonValue>> {
        let schema = self.schema;
        let child = self.at(related.referencing.model);
        let referencing = &schema.foreign_key(related.referencing).simple.name;
        let through = related.through.map(|t| schema.foreign_key(t).simple.name.clone());
        let unique = through.is_none() && schema.is_unique_reference(related.referencing);

        let (select_fields, order_by) = match &through {
            Some(name) => {
                let mut shape = Document::new();
                shape.insert(name.clone(), fields.clone());
                let order = options
                    .order_by
                    .iter()
                    .map(|entry| match entry.strip_prefix('-') {
                        Some(rest) => format!("-{}.{}", name, rest),
                        None => format!("{}.{}", name, entry),
                    })
                    .collect();
                (JsonValue::Object(shape), order)
            }
            None => (fields.clone(), options.order_by.clone()),
        };

        let filter_for = |keys: JsonValue| {
            let mut doc = Document::new();
            if !options.filter.is_null() {
                match &through {
                    Some(name) => doc.insert(name.clone(), options.filter.clone()),
                    None => doc.insert("and".into(), JsonValue::Array(vec![options.filter.clone()])),
                };
            }
            doc.insert(referencing.clone(), keys);
            JsonValue::Object(doc)
        };

        let mut groups: HashMap<Value, Vec<JsonValue>> = HashMap::new();
        let mut collect = |rows: Vec<Document>| {
            for mut row in rows {
                let Some(parent) = row.remove(referencing.as_str()) else { continue };
                let Some(key) = schema.key_value(self.model, &parent) else { continue };
                let item = match &through {
                    Some(name) => row.remove(name.as_str()).unwrap_or(JsonValue::Null),
                    None => JsonValue::Object(row),
                };
                groups.entry(key).or_default().push(item);
            }
        };

        if options.limit.is_none() && options.offset.is_none() {
            let mut keys: Vec<JsonValue> = Vec::new();
            for parent in parents.iter().filter(|p| !p.is_null()) {
                let key = parent.to_json();
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            if !keys.is_empty() {
                let opts = SelectOptions { filter: filter_for(JsonValue::Array(keys)), order_by, limit: None, offset: None };
                collect(child.select(conn, &select_fields, &opts).await?);
            }
        } else {
            for parent in parents.iter().filter(|p| !p.is_null()) {
                let opts = SelectOptions {
                    filter: filter_for(parent.to_json()),
                    order_by: order_by.clone(),
                    limit: options.limit,
                    offset: options.offset,
                };
                collect(child.select(conn, &select_fields, &opts).await?);
            }
        }

        Ok(parents
            .iter()
            .map(|parent| {
                let items = groups.get(parent).cloned().unwrap_or_default();
                if unique {
                    items.into_iter().next().unwrap_or(JsonValue::Null)
                } else {
                    JsonValue::Array(items)
                }
            })
            .collect())
    }

    /// `key` is a primary key value or a document holding a complete unique key.
    pub(crate) async fn get(&self, conn: &mut dyn Connection, key: &JsonValue) -> Result<Option<Document>> {
        let m = self.model();
        let filter = if is_value(key) {
            let mut doc = Document::new();
            doc.insert(m.key_name().to_string(), key.clone());
            JsonValue::Object(doc)
        } else {
            match key.as_object() {
                Some(doc) if self.schema.check_unique_key(self.model, doc) => key.clone(),
                _ => return Err(Error::BadSelector(key.to_string())),
            }
        };
        let rows = self.query_documents(conn, Projection::All, &SelectOptions::new().filter(filter)).await?;
        Ok(rows.into_iter().next())
    }

    /// Column values of a document, normalized. Related fields are skipped.
    pub(crate) fn document_values(&self, doc: &Document) -> Result<Vec<(usize, Value)>> {
        let m = self.model();
        let mut values = Vec::with_capacity(doc.len());
        for (name, json) in doc {
            let index = m.field_index(name).ok_or_else(|| Error::unknown_field(&m.name, name))?;
            let invalid = || Error::InvalidValue { field: name.clone(), value: json.to_string() };
            let value = match &m.fields[index] {
                Field::Related(_) => continue,
                Field::Simple(field) => normalize(Value::from_json(json).ok_or_else(invalid)?, field)?,
                Field::ForeignKey(fk) if json.is_null() => normalize(Value::Null, &fk.simple)?,
                Field::ForeignKey(fk) => {
                    normalize(self.schema.key_value(fk.referenced.model, json).ok_or_else(invalid)?, &fk.simple)?
                }
            };
            values.push((index, value));
        }
        Ok(values)
    }

    /// Multi-row insert of normalized values; returns the generated keys in row order.
    pub(crate) async fn insert_batch(
        &self,
        conn: &mut dyn Connection,
        fields: &[usize],
        rows: Vec<Vec<Value>>,
    ) -> Result<Vec<Value>> {
        let m = self.model();
        let simple: Vec<_> = fields.iter().filter_map(|&f| m.fields[f].as_simple()).collect();
        let insert = Insert {
            table: m.table_name.clone(),
            columns: simple.iter().map(|f| f.column.name.clone()).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().zip(&simple).map(|(value, field)| to_row(value, field)).collect())
                .collect(),
            returning: m.is_auto_increment().then(|| m.key_column().name.clone()),
        };
        conn.insert(&insert).await
    }

    /// Inserts one row and returns its generated key, or the key it was given.
    pub(crate) async fn insert_row(&self, conn: &mut dyn Connection, doc: &Document) -> Result<Value> {
        let m = self.model();
        let values = self.document_values(doc)?;
        if values.is_empty() {
            return Err(Error::EmptyData(m.name.clone()));
        }
        let (fields, row): (Vec<usize>, Vec<Value>) = values.into_iter().unzip();
        let ids = self.insert_batch(conn, &fields, vec![row.clone()]).await?;
        Ok(ids
            .into_iter()
            .next()
            .or_else(|| fields.iter().position(|&f| f == m.key_field()).map(|i| row[i].clone()))
            .unwrap_or(Value::Null))
    }

    /// Updates matching rows. Fields whose value equals the filter's are not set.
    pub(crate) async fn update(&self, conn: &mut dyn Connection, data: &Document, filter: &JsonValue) -> Result<u64> {
        let m = self.model();
        let mut assignments = self.document_values(data)?;
        if let Some(filter) = filter.as_object() {
            assignments.retain(|(index, value)| {
                let Some(current) = self.schema.value_of(self.model, filter, *index) else { return true };
                let current = m.fields[*index].as_simple().and_then(|f| normalize(current.clone(), f).ok()).unwrap_or(current);
                current.to_string() != value.to_string()
            });
        }
        let condition = QueryBuilder::new(self.schema).where_clause(self.model, filter)?;
        self.update_fields(conn, &assignments, condition).await
    }

    pub(crate) async fn update_fields(
        &self,
        conn: &mut dyn Connection,
        assignments: &[(usize, Value)],
        filter: Option<Expr>,
    ) -> Result<u64> {
        if assignments.is_empty() {
            return Ok(0);
        }
        let m = self.model();
        let assignments = assignments
            .iter()
            .filter_map(|(index, value)| m.fields[*index].as_simple().map(|f| (f.column.name.clone(), to_row(value, f))))
            .collect();
        conn.execute(&Statement::Update(Update { table: m.table_name.clone(), assignments, filter })).await
    }

    pub(crate) async fn delete(&self, conn: &mut dyn Connection, filter: &JsonValue) -> Result<u64> {
        let condition = QueryBuilder::new(self.schema).where_clause(self.model, filter)?;
        let table = self.model().table_name.clone();
        conn.execute(&Statement::Delete(Delete { table, filter: condition })).await
    }

    pub(crate) async fn count(&self, conn: &mut dyn Connection, filter: &JsonValue, field: Option<&str>) -> Result<i64> {
        let select = QueryBuilder::new(self.schema).select(self.model, Projection::Count(field), filter, &[])?;
        let rows = conn.query(&Statement::Select(select)).await?;
        Ok(rows.first().and_then(|row| row.get("result")).and_then(Value::as_i64).unwrap_or(0))
    }
}
