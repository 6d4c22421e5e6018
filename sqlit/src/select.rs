//! # Tree Select
//!
//! Breadth-first fan-out across the relational graph from a seed filter.
//!
//! [`Database::select_tree`] follows foreign keys and related fields as a
//! [`FieldOptions`] tree says, [`Database::select_tree2`] walks every table
//! reachable through foreign keys, nearest tables first. Both collect rows
//! into a [`TreeResult`], keyed by model name and then primary key, so a row
//! reached along two paths is stored once.

use futures::future::BoxFuture;
use indexmap::{IndexMap, IndexSet};
use serde_json::Value as JsonValue;
use std::collections::HashSet;

use crate::{
    connection::Connection,
    database::Database,
    query::Projection,
    schema::{Field, FieldRef, ModelId, Schema},
    table::{SelectOptions, TableOps},
    value::{Document, Value},
    Error, Result,
};

/// Selected rows per model name, keyed by primary key.
pub type TreeResult = IndexMap<String, IndexMap<Value, Document>>;

/// Which relations a tree select follows.
///
/// | JSON   | Variant                | Foreign keys | Related fields |
/// |--------|------------------------|--------------|----------------|
/// | `""`   | [`FieldOptions::None`] | no           | no             |
/// | `"*"`  | [`FieldOptions::Star`] | no           | yes            |
/// | `"**"` | [`FieldOptions::Deep`] | yes          | yes            |
/// | `{..}` | [`FieldOptions::Fields`] | named ones | all but those set to `""` |
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOptions {
    None,
    Star,
    Deep,
    Fields(IndexMap<String, FieldOptions>),
}

impl Default for FieldOptions {
    fn default() -> Self {
        FieldOptions::Fields(IndexMap::new())
    }
}

impl FieldOptions {
    pub fn from_json(value: &JsonValue) -> Result<Self> {
        match value {
            JsonValue::Null | JsonValue::Bool(false) => Ok(FieldOptions::None),
            JsonValue::Bool(true) => Ok(FieldOptions::Star),
            JsonValue::String(s) => match s.as_str() {
                "" => Ok(FieldOptions::None),
                "*" => Ok(FieldOptions::Star),
                "**" => Ok(FieldOptions::Deep),
                other => Err(Error::BadSelector(other.to_string())),
            },
            JsonValue::Object(map) => {
                let mut fields = IndexMap::new();
                for (name, option) in map {
                    fields.insert(name.clone(), FieldOptions::from_json(option)?);
                }
                Ok(FieldOptions::Fields(fields))
            }
            other => Err(Error::BadSelector(other.to_string())),
        }
    }

    /// Adds an option for one field.
    pub fn field(self, name: &str, option: FieldOptions) -> Self {
        let mut fields = match self {
            FieldOptions::Fields(fields) => fields,
            _ => IndexMap::new(),
        };
        fields.insert(name.to_string(), option);
        FieldOptions::Fields(fields)
    }

    fn foreign_key(&self, name: &str) -> Option<FieldOptions> {
        match self {
            FieldOptions::Deep => Some(FieldOptions::Deep),
            FieldOptions::Fields(fields) => fields.get(name).filter(|o| **o != FieldOptions::None).cloned(),
            _ => None,
        }
    }

    fn related(&self, name: &str) -> Option<FieldOptions> {
        match self {
            FieldOptions::None => None,
            FieldOptions::Fields(fields) => match fields.get(name) {
                Some(FieldOptions::None) => None,
                Some(option) => Some(option.clone()),
                None => Some(FieldOptions::default()),
            },
            other => Some(other.clone()),
        }
    }
}

fn key_filter(name: &str, values: &[Value]) -> JsonValue {
    let mut filter = Document::new();
    filter.insert(name.to_string(), JsonValue::Array(values.iter().map(Value::to_json).collect()));
    JsonValue::Object(filter)
}

struct TreeSelect<'s> {
    schema: &'s Schema,
    result: TreeResult,
    queries: HashSet<String>,
}

impl<'s> TreeSelect<'s> {
    fn new(schema: &'s Schema) -> Self {
        Self { schema, result: TreeResult::new(), queries: HashSet::new() }
    }

    async fn rows(&self, conn: &mut dyn Connection, model: ModelId, filter: JsonValue) -> Result<Vec<Document>> {
        let options = SelectOptions::new().filter(filter);
        TableOps::new(self.schema, model).query_documents(conn, Projection::All, &options).await
    }

    fn merge(&mut self, model: ModelId, rows: &[Document]) {
        let m = self.schema.model(model);
        let map = self.result.entry(m.name.clone()).or_default();
        for row in rows {
            if let Some(key) = self.schema.value_of(model, row, m.key_field()) {
                map.insert(key, row.clone());
            }
        }
    }

    fn is_known(&self, model: ModelId, key: &Value) -> bool {
        self.result.get(&self.schema.model(model).name).is_some_and(|map| map.contains_key(key))
    }

    /// Values of `field` in `rows` whose referenced rows are not selected yet.
    fn missing(&self, model: ModelId, field: usize, rows: &[Document], target: ModelId) -> Vec<Value> {
        let values: IndexSet<Value> = rows
            .iter()
            .filter_map(|row| self.schema.value_of(model, row, field))
            .filter(|value| !value.is_null() && !self.is_known(target, value))
            .collect();
        values.into_iter().collect()
    }

    /// Whether a query on `field` with `values` has not been issued before.
    fn may_query(&mut self, field: String, values: &[Value]) -> bool {
        let values: Vec<JsonValue> = values.iter().map(Value::to_json).collect();
        self.queries.insert(format!("{}{}", field, JsonValue::Array(values)))
    }

    fn select<'a>(
        &'a mut self,
        conn: &'a mut dyn Connection,
        model: ModelId,
        filter: JsonValue,
        options: FieldOptions,
        entry: Option<FieldRef>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let schema = self.schema;
            let m = schema.model(model);

            let rows = self.rows(conn, model, filter).await?;
            if rows.is_empty() {
                return Ok(());
            }
            self.merge(model, &rows);

            for (index, field) in m.fields.iter().enumerate() {
                let Field::ForeignKey(fk) = field else { continue };
                let Some(option) = options.foreign_key(&fk.simple.name) else { continue };
                let parent = fk.referenced.model;
                self.result.entry(schema.model(parent).name.clone()).or_default();

                let values = self.missing(model, index, &rows, parent);
                let pm = schema.model(parent);
                if !values.is_empty() && self.may_query(pm.display_name(pm.key_field()), &values) {
                    let filter = key_filter(pm.key_name(), &values);
                    self.select(conn, parent, filter, option, Some(FieldRef { model, field: index })).await?;
                }
            }

            let values: Vec<Value> = self.result.get(&m.name).map(|map| map.keys().cloned().collect()).unwrap_or_default();

            for child in 0..schema.models.len() {
                let cm = schema.model(child);
                let mut fields = Vec::new();
                let mut links = Vec::new();

                for (index, field) in cm.fields.iter().enumerate() {
                    let Field::ForeignKey(fk) = field else { continue };
                    let Some(related) = fk.related else { continue };
                    let here = FieldRef { model: child, field: index };
                    if fk.referenced.model != model || entry == Some(here) {
                        continue;
                    }
                    let Some(related) = schema.field(related).as_related() else { continue };
                    let Some(option) = options.related(&related.name) else { continue };
                    match related.through {
                        Some(through) => links.push((here, through, option)),
                        None => fields.push((here, option)),
                    }
                }

                if !links.is_empty() {
                    let filter = links
                        .iter()
                        .map(|(here, _, _)| key_filter(cm.fields[here.field].name(), &values))
                        .collect();
                    let rows = self.rows(conn, child, JsonValue::Array(filter)).await?;
                    self.merge(child, &rows);

                    for (_, through, option) in links {
                        let far = schema.foreign_key(through).referenced.model;
                        let fm = schema.model(far);
                        let values = self.missing(child, through.field, &rows, far);
                        if !values.is_empty() && self.may_query(fm.display_name(fm.key_field()), &values) {
                            let filter = key_filter(fm.key_name(), &values);
                            self.select(conn, far, filter, option, Some(through)).await?;
                        }
                    }
                }

                for (here, option) in fields {
                    if self.may_query(cm.display_name(here.field), &values) {
                        let filter = key_filter(cm.fields[here.field].name(), &values);
                        self.select(conn, child, filter, option, None).await?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Foreign keys of `child` referencing `parent`.
    fn foreign_keys(&self, child: ModelId, parent: ModelId) -> Vec<FieldRef> {
        self.schema
            .model(child)
            .fields
            .iter()
            .enumerate()
            .filter_map(|(index, field)| match field {
                Field::ForeignKey(fk) if fk.referenced.model == parent => Some(FieldRef { model: child, field: index }),
                _ => None,
            })
            .collect()
    }

    async fn select_by_distance(&mut self, conn: &mut dyn Connection, model: ModelId, filter: JsonValue) -> Result<()> {
        let schema = self.schema;
        let rows = self.rows(conn, model, filter).await?;
        self.merge(model, &rows);

        let mut selected: IndexMap<ModelId, usize> = IndexMap::from([(model, 0)]);

        loop {
            let mut next: Option<(ModelId, ModelId, Vec<FieldRef>, usize)> = None;
            for child in 0..schema.models.len() {
                if selected.contains_key(&child) {
                    continue;
                }
                for (&parent, &distance) in &selected {
                    let keys = self.foreign_keys(child, parent);
                    if !keys.is_empty() && next.as_ref().is_none_or(|(_, _, _, min)| distance < *min) {
                        next = Some((parent, child, keys, distance));
                    }
                }
            }
            let Some((parent, child, keys, distance)) = next else { break };

            let values: Vec<Value> = self
                .result
                .get(&schema.model(parent).name)
                .map(|map| map.keys().cloned().collect())
                .unwrap_or_default();

            if values.is_empty() {
                self.merge(child, &[]);
            } else {
                let cm = schema.model(child);
                let filter = keys.iter().map(|key| key_filter(cm.fields[key.field].name(), &values)).collect();
                let rows = self.rows(conn, child, JsonValue::Array(filter)).await?;
                self.merge(child, &rows);

                let link = match keys.as_slice() {
                    [key] => schema.foreign_key(*key).related.and_then(|r| schema.field(r).as_related()).and_then(|r| r.through),
                    _ => None,
                };
                if let Some(through) = link {
                    let far = schema.foreign_key(through).referenced.model;
                    let fm = schema.model(far);
                    let values = self.missing(child, through.field, &rows, far);
                    if !values.is_empty() {
                        let rows = self.rows(conn, far, key_filter(fm.key_name(), &values)).await?;
                        self.merge(far, &rows);
                        selected.insert(far, distance + 1);
                    }
                }
            }
            selected.insert(child, distance + 1);
        }
        Ok(())
    }
}

impl Database {
    /// Selects the rows matching `filter` and the rows related to them.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let options = FieldOptions::default().field("user", FieldOptions::default());
    /// let tree = db.select_tree("Order", &json!({ "code": "A-1" }), &options).await?;
    /// let users = &tree["User"];
    /// ```
    pub async fn select_tree(&self, table: &str, filter: &JsonValue, options: &FieldOptions) -> Result<TreeResult> {
        let model = self.model_id(table)?;
        let mut conn = self.pool.get_connection().await?;
        let mut tree = TreeSelect::new(&self.schema);
        tree.select(&mut *conn, model, filter.clone(), options.clone(), None).await?;
        Ok(tree.result)
    }

    /// Selects the rows matching `filter`, then every table whose foreign keys
    /// reach the selected tables, nearest first.
    pub async fn select_tree2(&self, table: &str, filter: &JsonValue) -> Result<TreeResult> {
        let model = self.model_id(table)?;
        let mut conn = self.pool.get_connection().await?;
        let mut tree = TreeSelect::new(&self.schema);
        tree.select_by_distance(&mut *conn, model, filter.clone()).await?;
        Ok(tree.result)
    }
}
