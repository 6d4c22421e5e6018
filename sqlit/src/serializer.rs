//! # Tree Serializers
//!
//! Turn a [`TreeResult`] into nested documents. Every row is written in full
//! the first time it is reached and as a reference after that, so shared rows
//! and cycles in the data never repeat.
//!
//! - [`JsonSerializer`] inlines first encounters breadth-first and writes
//!   later ones as `{ "<pk>": value }` stubs.
//! - [`XstreamSerializer`] writes XML in the XStream `ID_REFERENCES` form:
//!   `<name id="N">..</name>` first, `<name reference="N"/>` after.

use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};

use crate::{
    database::Database,
    schema::{lcfirst, Field, ModelId, Schema},
    select::{FieldOptions, TreeResult},
    value::{Document, Value},
    Result,
};

// ============================================================================
// Document Map
// ============================================================================

/// Numbers rows from 1 in the order they are first written.
#[derive(Debug, Default)]
struct DocumentMap {
    ids: HashMap<(ModelId, Value), usize>,
    next: usize,
}

impl DocumentMap {
    fn new() -> Self {
        Self { ids: HashMap::new(), next: 1 }
    }

    fn get(&self, model: ModelId, key: &Value) -> Option<usize> {
        self.ids.get(&(model, key.clone())).copied()
    }

    fn contains(&self, model: ModelId, key: &Value) -> bool {
        self.ids.contains_key(&(model, key.clone()))
    }

    fn add(&mut self, model: ModelId, key: Value) -> usize {
        let id = self.next;
        self.ids.insert((model, key), id);
        self.next += 1;
        id
    }
}

fn is_set(value: Option<&JsonValue>) -> bool {
    !matches!(value, None | Some(JsonValue::Null) | Some(JsonValue::Bool(false)))
}

fn stub(schema: &Schema, model: ModelId, key: &Value) -> JsonValue {
    let mut doc = Document::new();
    doc.insert(schema.model(model).key_name().to_string(), key.to_json());
    JsonValue::Object(doc)
}

/// A related row of `parent` in the tree: the child row, or for many-to-many
/// the far row, with its model and key.
struct Related<'t> {
    model: ModelId,
    key: Value,
    row: Option<&'t Document>,
}

/// The rows a related field of the row keyed `key` reaches in the tree.
fn related_rows<'t>(schema: &Schema, data: &'t TreeResult, model: ModelId, field: usize, key: &Value) -> Option<Vec<Related<'t>>> {
    let Field::Related(related) = &schema.model(model).fields[field] else { return None };
    let child = related.referencing.model;
    let rows = data.get(&schema.model(child).name)?;

    let mut out = Vec::new();
    for (child_key, doc) in rows {
        if schema.value_of(child, doc, related.referencing.field).as_ref() != Some(key) {
            continue;
        }
        match related.through {
            Some(through) => {
                let far = schema.foreign_key(through).referenced.model;
                let Some(far_key) = schema.value_of(child, doc, through.field) else { continue };
                let row = data.get(&schema.model(far).name).and_then(|map| map.get(&far_key));
                out.push(Related { model: far, key: far_key, row });
            }
            None => out.push(Related { model: child, key: child_key.clone(), row: Some(doc) }),
        }
    }
    Some(out)
}

// ============================================================================
// JSON
// ============================================================================

enum Slot {
    Node(usize),
    Value(JsonValue),
}

enum Link {
    One(Option<Slot>),
    Many(Vec<Slot>),
}

struct Node {
    model: ModelId,
    doc: Document,
    links: Vec<(String, Link)>,
}

/// Serializes a tree to JSON documents.
///
/// ```rust,ignore
/// let tree = db.select_tree("Order", &json!({ "code": "A-1" }), &FieldOptions::Deep).await?;
/// let orders = JsonSerializer::new(db.schema(), &tree).serialize("Order")?;
/// ```
pub struct JsonSerializer<'t> {
    schema: &'t Schema,
    data: &'t TreeResult,
    map: DocumentMap,
    nodes: Vec<Node>,
    tasks: VecDeque<usize>,
}

impl<'t> JsonSerializer<'t> {
    pub fn new(schema: &'t Schema, data: &'t TreeResult) -> Self {
        Self { schema, data, map: DocumentMap::new(), nodes: Vec::new(), tasks: VecDeque::new() }
    }

    /// The rows of `model` with their relations inlined, or `None` when the
    /// tree holds no rows of that model.
    pub fn serialize(mut self, model: &str) -> Result<Option<Vec<JsonValue>>> {
        let model = self.schema.model_by_name(model)?.id;
        let data = self.data;
        let Some(rows) = data.get(&self.schema.model(model).name) else { return Ok(None) };

        let mut roots = Vec::with_capacity(rows.len());
        for (key, doc) in rows {
            self.map.add(model, key.clone());
            roots.push(self.push(model, doc.clone()));
        }

        while let Some(node) = self.tasks.pop_front() {
            self.process(node);
        }
        Ok(Some(roots.into_iter().map(|node| self.assemble(node)).collect()))
    }

    fn push(&mut self, model: ModelId, doc: Document) -> usize {
        self.nodes.push(Node { model, doc, links: Vec::new() });
        let node = self.nodes.len() - 1;
        self.tasks.push_back(node);
        node
    }

    /// A slot for a row reached from another: a stub when already written,
    /// otherwise a new node.
    fn visit(&mut self, model: ModelId, key: Value, row: Option<&Document>) -> Option<Slot> {
        if self.map.contains(model, &key) {
            return Some(Slot::Value(stub(self.schema, model, &key)));
        }
        let row = row?.clone();
        self.map.add(model, key);
        Some(Slot::Node(self.push(model, row)))
    }

    fn process(&mut self, node: usize) {
        let schema = self.schema;
        let data = self.data;
        let model = self.nodes[node].model;
        let m = schema.model(model);
        let key = schema.value_of(model, &self.nodes[node].doc, m.key_field());

        for (index, field) in m.fields.iter().enumerate() {
            match field {
                Field::ForeignKey(fk) => {
                    let value = self.nodes[node].doc.get(&fk.simple.name);
                    if !is_set(value) {
                        continue;
                    }
                    let parent = fk.referenced.model;
                    let Some(parent_key) = value.and_then(|v| schema.key_value(parent, v)) else { continue };
                    let row = data.get(&schema.model(parent).name).and_then(|map| map.get(&parent_key));
                    if let Some(slot) = self.visit(parent, parent_key, row) {
                        self.nodes[node].links.push((fk.simple.name.clone(), Link::One(Some(slot))));
                    }
                }
                Field::Related(related) => {
                    let Some(key) = &key else { continue };
                    let Some(rows) = related_rows(schema, data, model, index, key) else { continue };
                    let slots: Vec<Slot> = rows.into_iter().filter_map(|r| self.visit(r.model, r.key, r.row)).collect();
                    let link = if schema.is_unique_reference(related.referencing) {
                        Link::One(slots.into_iter().next())
                    } else {
                        Link::Many(slots)
                    };
                    self.nodes[node].links.push((related.name.clone(), link));
                }
                Field::Simple(_) => {}
            }
        }
    }

    fn slot(&self, slot: &Slot) -> JsonValue {
        match slot {
            Slot::Node(node) => self.assemble(*node),
            Slot::Value(value) => value.clone(),
        }
    }

    fn assemble(&self, node: usize) -> JsonValue {
        let node = &self.nodes[node];
        let mut doc = node.doc.clone();
        for (name, link) in &node.links {
            let value = match link {
                Link::One(slot) => slot.as_ref().map(|s| self.slot(s)).unwrap_or(JsonValue::Null),
                Link::Many(slots) => JsonValue::Array(slots.iter().map(|s| self.slot(s)).collect()),
            };
            doc.insert(name.clone(), value);
        }
        JsonValue::Object(doc)
    }
}

// ============================================================================
// XStream XML
// ============================================================================

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => escape(s),
        other => escape(&other.to_string()),
    }
}

/// Serializes a tree to XStream-style XML, one element per line.
pub struct XstreamSerializer<'t> {
    schema: &'t Schema,
    data: &'t TreeResult,
    map: DocumentMap,
    lines: Vec<String>,
}

impl<'t> XstreamSerializer<'t> {
    pub fn new(schema: &'t Schema, data: &'t TreeResult) -> Self {
        Self { schema, data, map: DocumentMap::new(), lines: Vec::new() }
    }

    /// The rows of `model` as XML elements, or an empty string when the tree
    /// holds no rows of that model.
    pub fn serialize(mut self, model: &str) -> Result<String> {
        let model = self.schema.model_by_name(model)?.id;
        let data = self.data;
        let Some(rows) = data.get(&self.schema.model(model).name) else { return Ok(String::new()) };

        let tag = lcfirst(&self.schema.model(model).name);
        for (key, doc) in rows {
            let id = self.map.add(model, key.clone());
            self.lines.push(format!("<{} id=\"{}\">", tag, id));
            self.push_fields(model, doc);
            self.lines.push(format!("</{}>", tag));
        }
        Ok(self.lines.join("\n"))
    }

    fn push_element(&mut self, name: &str, model: ModelId, key: Value, row: Option<&'t Document>) {
        if let Some(id) = self.map.get(model, &key) {
            self.lines.push(format!("<{} reference=\"{}\"/>", name, id));
            return;
        }
        let Some(row) = row else { return };
        let id = self.map.add(model, key);
        self.lines.push(format!("<{} id=\"{}\">", name, id));
        self.push_fields(model, row);
        self.lines.push(format!("</{}>", name));
    }

    fn push_fields(&mut self, model: ModelId, root: &'t Document) {
        let schema = self.schema;
        let data = self.data;
        let m = schema.model(model);
        let key = schema.value_of(model, root, m.key_field());

        for (index, field) in m.fields.iter().enumerate() {
            match field {
                Field::ForeignKey(fk) => {
                    let value = root.get(&fk.simple.name);
                    if !is_set(value) {
                        continue;
                    }
                    let parent = fk.referenced.model;
                    let Some(parent_key) = value.and_then(|v| schema.key_value(parent, v)) else { continue };
                    let row = data.get(&schema.model(parent).name).and_then(|map| map.get(&parent_key));
                    self.push_element(&fk.simple.name, parent, parent_key, row);
                }
                Field::Related(related) => {
                    let Some(key) = &key else { continue };
                    let Some(rows) = related_rows(schema, data, model, index, key) else { continue };
                    let unique = schema.is_unique_reference(related.referencing);
                    if !unique {
                        self.lines.push(format!("<{}>", related.name));
                    }
                    for r in rows {
                        let name = if unique { related.name.clone() } else { lcfirst(&schema.model(r.model).name) };
                        self.push_element(&name, r.model, r.key, r.row);
                    }
                    if !unique {
                        self.lines.push(format!("</{}>", related.name));
                    }
                }
                Field::Simple(simple) => match root.get(&simple.name) {
                    None | Some(JsonValue::Null) => {}
                    Some(value) => self.lines.push(format!("<{0}>{1}</{0}>", simple.name, text(value))),
                },
            }
        }
    }
}

impl Database {
    /// Runs a tree select and serializes the rows of `table` to JSON.
    ///
    /// Without `options` every table reachable through foreign keys is
    /// selected ([`Database::select_tree2`]).
    pub async fn select_tree_json(&self, table: &str, filter: &JsonValue, options: Option<&FieldOptions>) -> Result<JsonValue> {
        let tree = match options {
            Some(options) => self.select_tree(table, filter, options).await?,
            None => self.select_tree2(table, filter).await?,
        };
        let docs = JsonSerializer::new(&self.schema, &tree).serialize(table)?;
        Ok(docs.map(JsonValue::Array).unwrap_or(JsonValue::Null))
    }
}
