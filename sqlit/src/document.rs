//! # Document Module
//!
//! Converts flat result rows into nested documents. Column aliases of the form
//! `user__email` become `{ "user": { "email": ... } }`, and foreign key columns
//! become key-only documents of the referenced model (`{ "user": { "id": 3 } }`).

use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::{
    connection::Row,
    schema::{Field, ForeignKeyField, ModelId, Schema},
    value::{normalize, Document, Value},
    Error, Result,
};

/// The key-only document naming the row a foreign key points at.
pub(crate) fn reference_document(schema: &Schema, fk: &ForeignKeyField, value: Value) -> JsonValue {
    if value.is_null() {
        return JsonValue::Null;
    }
    let referenced = schema.model(fk.referenced.model);
    let key = &referenced.fields[referenced.key_field()];
    let inner = match key {
        Field::ForeignKey(next) => reference_document(schema, next, value),
        _ => value.to_json(),
    };
    let mut doc = Document::new();
    doc.insert(key.name().to_string(), inner);
    JsonValue::Object(doc)
}

fn descend<'d>(current: &'d mut Document, name: &str) -> &'d mut Document {
    let slot = current.entry(name.to_string()).or_insert(JsonValue::Null);
    if !slot.is_object() {
        *slot = JsonValue::Object(Document::new());
    }
    match slot {
        JsonValue::Object(doc) => doc,
        _ => unreachable!("slot was just made an object"),
    }
}

/// Replaces nested documents whose key is null (an unmatched `LEFT JOIN`) by null.
fn collapse(schema: &Schema, model: ModelId, doc: &mut Document) {
    let m = schema.model(model);
    for (name, value) in doc.iter_mut() {
        let Some(Field::ForeignKey(fk)) = m.field(name) else { continue };
        if let JsonValue::Object(inner) = value {
            collapse(schema, fk.referenced.model, inner);
            let referenced = schema.model(fk.referenced.model);
            if matches!(inner.get(referenced.key_name()), Some(JsonValue::Null)) {
                *value = JsonValue::Null;
            }
        }
    }
}

/// Decodes one result row of `model`.
///
/// Returns `None` when the row's own key column is present but null, which is
/// how an unmatched outer row shows up.
pub fn to_document(
    schema: &Schema,
    model: ModelId,
    row: &Row,
    field_map: &HashMap<String, String>,
) -> Result<Option<Document>> {
    let mut doc = Document::new();

    for (key, value) in row {
        let segments: Vec<&str> = key.split("__").collect();
        let Some((leaf, path)) = segments.split_last() else { continue };

        let mut m = schema.model(model);
        let mut current = &mut doc;
        for segment in path {
            let Some(Field::ForeignKey(fk)) = m.field(segment) else {
                return Err(Error::NotForeignKey(key.clone()));
            };
            current = descend(current, &fk.simple.name);
            m = schema.model(fk.referenced.model);
        }

        let field = m.field_or_column(leaf).map(|i| &m.fields[i]).ok_or_else(|| Error::unknown_field(&m.name, key))?;
        let simple = field.as_simple().ok_or_else(|| Error::unknown_field(&m.name, key))?;
        let name = field_map.get(key).cloned().unwrap_or_else(|| simple.name.clone());
        let value = normalize(value.clone(), simple)?;

        match field {
            Field::ForeignKey(fk) => match reference_document(schema, fk, value) {
                JsonValue::Object(reference) => {
                    let target = descend(current, &name);
                    for (k, v) in reference {
                        target.insert(k, v);
                    }
                }
                _ => {
                    current.entry(name).or_insert(JsonValue::Null);
                }
            },
            _ => {
                current.insert(name, value.to_json());
            }
        }
    }

    collapse(schema, model, &mut doc);

    let key_name = schema.model(model).key_name();
    if matches!(doc.get(key_name), Some(JsonValue::Null)) {
        return Ok(None);
    }
    Ok(Some(doc))
}
