//! # Record Module
//!
//! Records are the in-memory rows of a [`Database`]. They live in an arena and
//! are addressed by [`RecordId`]; foreign keys hold either a scalar or a handle
//! to the referenced record, so a graph of new rows can be built before any of
//! them has a primary key.
//!
//! Each table keeps an identity map per unique key: appending data whose key is
//! already known returns (and updates) the existing record instead of creating
//! a second one.
//!
//! ```rust,ignore
//! let order = db.append("Order", json!({ "code": "A-1", "user": { "email": "a@b.c" } }))?;
//! let again = db.append("Order", json!({ "code": "A-1", "status": 2 }))?;
//! assert_eq!(order, again);
//! ```

// ============================================================================
// External Crate Imports
// ============================================================================

use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{
    database::Database,
    schema::{Field, ModelId, Schema},
    value::{is_value, normalize, Document, Value},
    Error, Result,
};

/// Handle of a record inside its [`Database`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub(crate) usize);

/// What a record field holds once assigned.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    /// A reference resolved to the record's primary key at write time.
    Record(RecordId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMethod {
    Insert,
    Update,
    Delete,
}

/// Pending work for a record.
#[derive(Debug, Clone)]
pub struct FlushState {
    pub method: FlushMethod,
    /// Fields assigned since the record was last written.
    pub dirty: BTreeSet<usize>,
    pub deleted: bool,
    /// Whether the row is known to exist in the database.
    pub selected: bool,
}

impl Default for FlushState {
    fn default() -> Self {
        Self { method: FlushMethod::Insert, dirty: BTreeSet::new(), deleted: false, selected: false }
    }
}

impl FlushState {
    fn json(&self, schema: &Schema, model: ModelId, merged: bool) -> JsonValue {
        let m = schema.model(model);
        json!({
            "method": format!("{:?}", self.method).to_lowercase(),
            "dirty": self.dirty.iter().map(|&f| m.fields[f].name().to_string()).collect::<Vec<_>>(),
            "deleted": self.deleted,
            "selected": self.selected,
            "merged": merged,
        })
    }
}

/// Whether every dirty field must be writable (`Perfect`) or only some (`Relaxed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perfection {
    Perfect,
    Relaxed,
}

#[derive(Debug, Clone)]
pub struct Record {
    pub(crate) table: ModelId,
    /// `None` means the field was never assigned.
    pub(crate) data: Vec<Option<FieldValue>>,
    pub(crate) related: BTreeMap<usize, Vec<RecordId>>,
    pub(crate) state: FlushState,
    pub(crate) inserted: bool,
}

impl Record {
    pub(crate) fn new(table: ModelId, width: usize) -> Self {
        Self { table, data: vec![None; width], related: BTreeMap::new(), state: FlushState::default(), inserted: false }
    }

    pub fn table(&self) -> ModelId {
        self.table
    }

    pub fn state(&self) -> &FlushState {
        &self.state
    }

    /// Whether the row was inserted by the last flush.
    pub fn inserted(&self) -> bool {
        self.inserted
    }

    pub fn is_dirty(&self) -> bool {
        !self.state.dirty.is_empty() || (self.state.method == FlushMethod::Delete && !self.state.deleted)
    }
}

/// Union-find over record handles. A merged record forwards every lookup to the
/// record that absorbed it.
#[derive(Debug, Clone, Default)]
pub(crate) struct MergeSet {
    parent: Vec<Option<RecordId>>,
}

impl MergeSet {
    pub(crate) fn push(&mut self) {
        self.parent.push(None);
    }

    pub(crate) fn find(&self, mut id: RecordId) -> RecordId {
        while let Some(next) = self.parent[id.0] {
            id = next;
        }
        id
    }

    pub(crate) fn is_merged(&self, id: RecordId) -> bool {
        self.parent[id.0].is_some()
    }

    /// Points `from` at the root of `into`, compressing the path from `from`.
    pub(crate) fn union(&mut self, from: RecordId, into: RecordId) {
        let root = self.find(into);
        let mut current = from;
        while current != root {
            let next = self.parent[current.0];
            self.parent[current.0] = Some(root);
            match next {
                Some(n) => current = n,
                None => break,
            }
        }
    }

    pub(crate) fn clear(&mut self, id: RecordId) {
        self.parent[id.0] = None;
    }
}

// ============================================================================
// Assignment Input
// ============================================================================

/// A value assigned to a record field.
#[derive(Debug, Clone)]
pub enum Input {
    Json(JsonValue),
    Record(RecordId),
}

impl From<JsonValue> for Input {
    fn from(v: JsonValue) -> Self {
        Input::Json(v)
    }
}

impl From<RecordId> for Input {
    fn from(v: RecordId) -> Self {
        Input::Record(v)
    }
}

impl From<Value> for Input {
    fn from(v: Value) -> Self {
        Input::Json(v.to_json())
    }
}

impl From<&str> for Input {
    fn from(v: &str) -> Self {
        Input::Json(JsonValue::String(v.to_string()))
    }
}

impl From<String> for Input {
    fn from(v: String) -> Self {
        Input::Json(JsonValue::String(v))
    }
}

impl From<i64> for Input {
    fn from(v: i64) -> Self {
        Input::Json(v.into())
    }
}

impl From<i32> for Input {
    fn from(v: i32) -> Self {
        Input::Json(v.into())
    }
}

impl From<f64> for Input {
    fn from(v: f64) -> Self {
        Input::from(Value::Float(v))
    }
}

impl From<bool> for Input {
    fn from(v: bool) -> Self {
        Input::Json(JsonValue::Bool(v))
    }
}

/// Named field assignments, applied in order.
///
/// ```rust,ignore
/// let data = Data::new().with("code", "A-1").with("user", user_id);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Data(pub(crate) Vec<(String, Input)>);

impl Data {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Input>) -> Self {
        self.0.push((name.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Document> for Data {
    fn from(doc: Document) -> Self {
        Data(doc.into_iter().map(|(k, v)| (k, Input::Json(v))).collect())
    }
}

impl From<JsonValue> for Data {
    /// Objects become one assignment per key; any other value is empty data.
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Object(doc) => Data::from(doc),
            _ => Data::default(),
        }
    }
}

// ============================================================================
// Record Operations
// ============================================================================

impl Database {
    /// Follows merges to the record that currently stands for `id`.
    pub fn resolve(&self, id: RecordId) -> RecordId {
        self.merged.find(id)
    }

    pub fn record(&self, id: RecordId) -> &Record {
        &self.records[self.resolve(id).0]
    }

    pub(crate) fn record_mut(&mut self, id: RecordId) -> &mut Record {
        let id = self.resolve(id);
        &mut self.records[id.0]
    }

    pub(crate) fn alloc(&mut self, model: ModelId) -> RecordId {
        let width = self.schema.model(model).fields.len();
        self.records.push(Record::new(model, width));
        self.merged.push();
        RecordId(self.records.len() - 1)
    }

    /// Adds a record to `table`, or updates the record that already holds one of
    /// its unique keys.
    pub fn append(&mut self, table: &str, data: impl Into<Data>) -> Result<RecordId> {
        let model = self.schema.model_by_name(table)?.id;
        self.append_to(model, data.into())
    }

    pub(crate) fn append_to(&mut self, model: ModelId, data: Data) -> Result<RecordId> {
        let temp = self.alloc(model);
        for (name, input) in data.0 {
            self.assign(temp, &name, input)?;
        }
        self.attach(temp)
    }

    /// Indexes a freshly built record, or folds it into an existing one.
    fn attach(&mut self, temp: RecordId) -> Result<RecordId> {
        match self.map_get(temp)? {
            Some(existing) => {
                self.merge_data(temp, existing)?;
                self.merged.union(temp, existing);
                Ok(existing)
            }
            None => {
                let model = self.records[temp.0].table;
                self.tables[model].records.push(temp);
                self.map_put(temp);
                Ok(temp)
            }
        }
    }

    /// A record naming an existing row by primary key. Its key is not dirty.
    pub(crate) fn append_reference(&mut self, model: ModelId, key: JsonValue) -> Result<RecordId> {
        let schema = Arc::clone(&self.schema);
        let m = schema.model(model);
        let key = match key {
            JsonValue::Object(mut doc) => doc.remove(m.key_name()).unwrap_or(JsonValue::Null),
            scalar => scalar,
        };
        let temp = self.alloc(model);
        self.assign(temp, m.key_name(), Input::Json(key))?;
        match self.map_get(temp)? {
            Some(existing) => {
                self.merged.union(temp, existing);
                Ok(existing)
            }
            None => {
                self.records[temp.0].state.dirty.clear();
                self.tables[model].records.push(temp);
                self.map_put(temp);
                Ok(temp)
            }
        }
    }

    /// Copies the assigned fields of `from` into `into`, skipping equal values.
    fn merge_data(&mut self, from: RecordId, into: RecordId) -> Result<()> {
        let width = self.records[from.0].data.len();
        for index in 0..width {
            let Some(value) = self.records[from.0].data[index].clone() else { continue };
            let dirty = self.records[from.0].state.dirty.contains(&index);
            let current = self.record(into).data[index].clone();
            if let Some(current) = current {
                if current == value || self.same_identity(&current, &value) {
                    continue;
                }
                let schema = Arc::clone(&self.schema);
                let model = schema.model(self.records[from.0].table);
                if let Field::ForeignKey(_) = &model.fields[index] {
                    return Err(Error::Reassignment { model: model.name.clone(), field: model.fields[index].name().into() });
                }
            }
            let record = self.record_mut(into);
            record.data[index] = Some(value);
            if dirty {
                record.state.dirty.insert(index);
            }
        }
        Ok(())
    }

    /// Whether two field values name the same row.
    fn same_identity(&self, a: &FieldValue, b: &FieldValue) -> bool {
        let key = |v: &FieldValue| match v {
            FieldValue::Value(v) => Some(v.clone()),
            FieldValue::Record(r) => self.primary_key(*r),
        };
        match (a, b) {
            (FieldValue::Record(x), FieldValue::Record(y)) if self.resolve(*x) == self.resolve(*y) => true,
            _ => matches!((key(a), key(b)), (Some(x), Some(y)) if !x.is_null() && x == y)
                || matches!((a, b), (FieldValue::Value(Value::Null), FieldValue::Value(Value::Null))),
        }
    }

    /// Assigns one field of a record by name.
    pub fn set(&mut self, id: RecordId, name: &str, value: impl Into<Input>) -> Result<()> {
        let id = self.resolve(id);
        self.assign(id, name, value.into())?;
        let model = self.records[id.0].table;
        if self.tables[model].records.contains(&id) {
            self.map_put(id);
        }
        Ok(())
    }

    pub(crate) fn assign(&mut self, id: RecordId, name: &str, input: Input) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let model = schema.model(self.records[id.0].table);
        let index = model.field_index(name).ok_or_else(|| Error::unknown_field(&model.name, name))?;

        let value = match &model.fields[index] {
            Field::Related(_) => {
                return Err(Error::NotAssignable { model: model.name.clone(), field: name.to_string() });
            }
            Field::Simple(field) => match input {
                Input::Record(r) => FieldValue::Record(self.resolve(r)),
                Input::Json(v) => {
                    let value = Value::from_json(&v)
                        .ok_or_else(|| Error::InvalidValue { field: field.name.clone(), value: v.to_string() })?;
                    FieldValue::Value(normalize(value, field)?)
                }
            },
            Field::ForeignKey(fk) => {
                let referenced = schema.model(fk.referenced.model);
                let value = match input {
                    Input::Record(r) => FieldValue::Record(self.resolve(r)),
                    Input::Json(JsonValue::Null) => FieldValue::Value(Value::Null),
                    Input::Json(JsonValue::Object(doc)) if doc.len() == 1 && doc.contains_key(referenced.key_name()) => {
                        FieldValue::Record(self.append_reference(referenced.id, JsonValue::Object(doc))?)
                    }
                    Input::Json(JsonValue::Object(doc)) => FieldValue::Record(self.append_to(referenced.id, doc.into())?),
                    Input::Json(v) if is_value(&v) => FieldValue::Record(self.append_reference(referenced.id, v)?),
                    Input::Json(v) => {
                        return Err(Error::InvalidValue { field: fk.simple.name.clone(), value: v.to_string() });
                    }
                };
                if let Some(current) = &self.records[id.0].data[index] {
                    if current == &value || self.same_identity(current, &value) {
                        return Ok(());
                    }
                    return Err(Error::Reassignment { model: model.name.clone(), field: name.to_string() });
                }
                value
            }
        };

        let record = &mut self.records[id.0];
        record.data[index] = Some(value);
        record.state.dirty.insert(index);
        Ok(())
    }

    /// The scalar value of a field; references resolve to the referenced key.
    pub(crate) fn get_value(&self, id: RecordId, field: usize) -> Option<Value> {
        match self.record(id).data[field].as_ref()? {
            FieldValue::Value(v) => Some(v.clone()),
            FieldValue::Record(r) => self.primary_key(*r),
        }
    }

    /// Reads one field of a record by name.
    pub fn get(&self, id: RecordId, name: &str) -> Result<Option<Value>> {
        let model = self.schema.model(self.record(id).table);
        let index = model.field_index(name).ok_or_else(|| Error::unknown_field(&model.name, name))?;
        Ok(self.get_value(id, index))
    }

    /// Records materialized for a related field by `replace`.
    pub fn related(&self, id: RecordId, name: &str) -> Result<&[RecordId]> {
        let model = self.schema.model(self.record(id).table);
        let index = model.field_index(name).ok_or_else(|| Error::unknown_field(&model.name, name))?;
        Ok(self.record(id).related.get(&index).map(Vec::as_slice).unwrap_or(&[]))
    }

    pub fn primary_key(&self, id: RecordId) -> Option<Value> {
        let record = self.record(id);
        let key = self.schema.model(record.table).key_field();
        self.get_value(id, key)
    }

    pub(crate) fn set_primary_key(&mut self, id: RecordId, value: Value) {
        let key = self.schema.model(self.record(id).table).key_field();
        self.record_mut(id).data[key] = Some(FieldValue::Value(value));
    }

    fn primary_key_dirty(&self, id: RecordId) -> bool {
        let record = self.record(id);
        let key = self.schema.model(record.table).key_field();
        record.state.dirty.contains(&key)
    }

    /// Undefined, or a reference to a record whose key cannot be written yet.
    pub(crate) fn is_empty(&self, value: &Option<FieldValue>) -> bool {
        match value {
            None => true,
            Some(FieldValue::Value(_)) => false,
            Some(FieldValue::Record(r)) => self.primary_key_dirty(*r) || self.primary_key(*r).is_none(),
        }
    }

    pub(crate) fn flushable(&self, id: RecordId, perfection: Perfection) -> bool {
        if self.merged.is_merged(id) {
            return false;
        }
        let record = &self.records[id.0];
        let model = self.schema.model(record.table);

        let has_key = model.unique_keys.iter().any(|uk| {
            uk.fields.iter().all(|&f| {
                !self.is_empty(&record.data[f]) && !matches!(record.data[f], Some(FieldValue::Value(Value::Null)))
            })
        });
        if !has_key {
            return false;
        }

        if record.state.method == FlushMethod::Delete {
            return true;
        }

        let writable = record.state.dirty.iter().filter(|&&f| !self.is_empty(&record.data[f])).count();
        if writable == 0 {
            return false;
        }

        if record.state.method == FlushMethod::Insert {
            let blocked = record.state.dirty.iter().any(|&f| {
                matches!(record.data[f], Some(FieldValue::Record(_)))
                    && self.is_empty(&record.data[f])
                    && model.fields[f].column().is_some_and(|c| !c.nullable)
            });
            if blocked {
                return false;
            }
        }

        match perfection {
            Perfection::Perfect => writable == record.state.dirty.len(),
            Perfection::Relaxed => true,
        }
    }

    /// The dirty fields that can be written now.
    pub(crate) fn fields(&self, id: RecordId) -> Vec<(usize, Value)> {
        let record = self.record(id);
        record
            .state
            .dirty
            .iter()
            .filter(|&&f| !self.is_empty(&record.data[f]))
            .filter_map(|&f| self.get_value(id, f).map(|v| (f, v)))
            .collect()
    }

    /// Every assigned field, references resolved, as a document.
    pub(crate) fn values_document(&self, id: RecordId) -> Document {
        let record = self.record(id);
        let model = self.schema.model(record.table);
        let mut doc = Document::new();
        for (index, _) in model.simple_fields() {
            if let Some(value) = self.get_value(id, index) {
                doc.insert(model.fields[index].name().to_string(), value.to_json());
            }
        }
        doc
    }

    /// The unique fields identifying the record's row.
    pub(crate) fn filter(&self, id: RecordId) -> Option<Document> {
        let record = self.record(id);
        self.schema.unique_fields(record.table, &self.values_document(id))
    }

    /// Key-only filter for a record: its primary key when known, otherwise its
    /// unique fields.
    pub fn plainify(&self, id: RecordId) -> JsonValue {
        let model = self.schema.model(self.record(id).table);
        match self.primary_key(id) {
            Some(key) if !key.is_null() => {
                let mut doc = Document::new();
                doc.insert(model.key_name().to_string(), key.to_json());
                JsonValue::Object(doc)
            }
            _ => self.filter(id).map(JsonValue::Object).unwrap_or(JsonValue::Null),
        }
    }

    /// Brings a record's state in line with the row found in the database.
    pub(crate) fn update_state(&mut self, id: RecordId, existing: &[Option<Value>]) {
        let key = self.schema.model(self.record(id).table).key_field();
        if self.primary_key(id).is_none() {
            if let Some(value) = existing[key].clone() {
                self.set_primary_key(id, value);
            }
        }
        let dirty: Vec<usize> = self.record(id).state.dirty.iter().copied().collect();
        for f in dirty {
            if existing[f].is_some() && self.get_value(id, f) == existing[f] {
                self.record_mut(id).state.dirty.remove(&f);
            }
        }
        let record = self.record_mut(id);
        if !record.state.dirty.is_empty() && record.state.method == FlushMethod::Insert {
            record.state.method = FlushMethod::Update;
        }
        record.state.selected = true;
    }

    /// Every field value of a record, by field index.
    pub(crate) fn field_values(&self, id: RecordId) -> Vec<Option<Value>> {
        (0..self.record(id).data.len()).map(|f| self.get_value(id, f)).collect()
    }

    /// JSON-encoded values of a unique key, or `None` when a value is missing or null.
    pub(crate) fn key_string(&self, id: RecordId, key: usize) -> Option<String> {
        let model = self.schema.model(self.records[id.0].table);
        let mut values = Vec::new();
        for &f in &model.unique_keys[key].fields {
            match self.get_value(id, f) {
                Some(v) if !v.is_null() => values.push(v.to_json()),
                _ => return None,
            }
        }
        Some(JsonValue::Array(values).to_string())
    }

    pub(crate) fn map_get(&self, id: RecordId) -> Result<Option<RecordId>> {
        let model = self.records[id.0].table;
        let mut found: Option<RecordId> = None;
        for key in 0..self.schema.model(model).unique_keys.len() {
            let Some(value) = self.key_string(id, key) else { continue };
            if let Some(&record) = self.tables[model].record_map[key].get(&value) {
                let record = self.resolve(record);
                if record == id {
                    continue;
                }
                match found {
                    Some(other) if other != record => return Err(Error::InconsistentUniqueKey),
                    _ => found = Some(record),
                }
            }
        }
        Ok(found)
    }

    pub(crate) fn map_put(&mut self, id: RecordId) {
        let model = self.records[id.0].table;
        for key in 0..self.schema.model(model).unique_keys.len() {
            if let Some(value) = self.key_string(id, key) {
                self.tables[model].record_map[key].insert(value, id);
            }
        }
    }

    /// Schedules the record's row for deletion on the next flush.
    pub fn mark_deleted(&mut self, id: RecordId) {
        let record = self.record_mut(id);
        record.state.method = FlushMethod::Delete;
        record.state.deleted = false;
    }

    /// The record's fields, references resolved, plus materialized related records.
    pub fn record_json(&self, id: RecordId) -> JsonValue {
        let mut doc = self.values_document(id);
        let model = self.schema.model(self.record(id).table);
        for (field, children) in &self.record(id).related {
            let items = children.iter().map(|&child| self.record_json(child)).collect();
            doc.insert(model.fields[*field].name().to_string(), JsonValue::Array(items));
        }
        JsonValue::Object(doc)
    }

    fn repr(&self, id: RecordId) -> String {
        let record = self.record(id);
        let model = self.schema.model(record.table);
        match &record.data[model.key_field()] {
            Some(FieldValue::Record(r)) => format!("{}({})", model.name, self.repr(*r)),
            Some(FieldValue::Value(v)) => format!("{}({})", model.name, v),
            None => format!("{}(undefined)", model.name),
        }
    }

    /// Debug view of a record: dirty fields are prefixed with `*`, fields of a
    /// merged record with `!`.
    pub fn dump(&self, id: RecordId) -> JsonValue {
        let record = &self.records[id.0];
        let merged = self.merged.is_merged(id);
        let model = self.schema.model(record.table);
        let mut doc = Document::new();
        doc.insert("__state".into(), record.state.json(&self.schema, record.table, merged));
        for (index, field) in model.fields.iter().enumerate() {
            let Some(value) = &record.data[index] else { continue };
            let name = if merged {
                format!("!{}", field.name())
            } else if record.state.dirty.contains(&index) {
                format!("*{}", field.name())
            } else {
                field.name().to_string()
            };
            let value = match value {
                FieldValue::Value(v) => v.to_json(),
                FieldValue::Record(r) => JsonValue::String(self.repr(*r)),
            };
            doc.insert(name, value);
        }
        JsonValue::Object(doc)
    }
}
