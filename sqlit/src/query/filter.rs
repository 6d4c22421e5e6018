//! # Filter Compilation
//!
//! Turns document-shaped filters into expression trees.
//!
//! ```json
//! { "email_like": "%@example.com", "orders_some": { "code": "A-1" } }
//! [ { "name": "Apple" }, { "category": { "name": "Fruit" } } ]
//! ```
//!
//! An object is the conjunction of its keys and an array the disjunction of its
//! elements. Keys name a field, optionally suffixed with an operator
//! (`lt le ge gt ne in like null some none`), or one of the combinators
//! `and`, `or`, `not`. Foreign keys are traversed with `LEFT JOIN`s when the
//! filter belongs to a `SELECT`, and with `IN (SELECT ...)` otherwise; related
//! fields become correlated `EXISTS` subqueries.

// ============================================================================
// External Crate Imports
// ============================================================================

use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};

// ============================================================================
// Internal Crate Imports
// ============================================================================

use super::{
    ast::{BinaryOp, Direction, Expr, Join, Select, SelectItem, TableRef},
    serializer::{Serializer, Sql},
};
use crate::{
    database::Drivers,
    schema::{Field, ForeignKeyField, Model, ModelId, RelatedField, Schema, SimpleField},
    value::{is_value, to_row, Document, Value},
    Error, Result,
};

/// What a `SELECT` projects.
#[derive(Debug, Clone, Copy)]
pub enum Projection<'a> {
    /// Every column-backed field of the model.
    All,
    /// A nested field shape such as `{ "code": true, "user": { "email": true } }`.
    Shape(&'a Document),
    /// The listed fields, by index.
    Fields(&'a [usize]),
    /// `COUNT(1)`, or `COUNT(field)`, as `result`.
    Count(Option<&'a str>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Cmp(BinaryOp),
    In,
    Null,
    Some,
    None,
}

/// Resolves a filter key to a field and operator. Exact field names win over
/// operator suffixes.
fn split_key(model: &Model, key: &str) -> Option<(usize, Operator)> {
    if let Some(index) = model.field_index(key) {
        return Some((index, Operator::Eq));
    }
    let (name, suffix) = key.rsplit_once('_')?;
    let op = match suffix {
        "in" => Operator::In,
        "null" => Operator::Null,
        "some" => Operator::Some,
        "none" => Operator::None,
        other => Operator::Cmp(BinaryOp::from_suffix(other)?),
    };
    model.field_index(name).map(|index| (index, op))
}

pub(crate) fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        _ => true,
    }
}

pub(crate) fn to_array(value: &JsonValue) -> Vec<&JsonValue> {
    match value {
        JsonValue::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

/// A scalar or a list of scalars.
fn is_plain(value: &JsonValue) -> bool {
    match value {
        JsonValue::Array(items) => items.iter().all(is_value),
        other => is_value(other),
    }
}

/// Whether a field shape asks for related fields of `model`, which cannot be
/// fetched through a join.
pub(crate) fn should_select_separately(schema: &Schema, model: ModelId, shape: &JsonValue) -> bool {
    let m = schema.model(model);
    shape.as_object().is_some_and(|doc| doc.keys().any(|name| matches!(m.field(name), Some(Field::Related(_)))))
}

fn pk_only(model: &Model, doc: &Document) -> bool {
    doc.len() == 1 && doc.contains_key(model.key_name())
}

/// Returns `filter[name]` as an object, wrapping a scalar into `{ pk: scalar }`.
fn ensure_object<'d>(filter: &'d mut Document, name: &str, key_name: &str) -> &'d mut Document {
    let slot = filter.entry(name.to_string()).or_insert_with(|| JsonValue::Object(Document::new()));
    if !slot.is_object() {
        let scalar = slot.take();
        let mut doc = Document::new();
        doc.insert(key_name.to_string(), scalar);
        *slot = JsonValue::Object(doc);
    }
    match slot {
        JsonValue::Object(doc) => doc,
        _ => unreachable!("slot was just made an object"),
    }
}

/// Adds empty join markers to the filter for every foreign key the shape nests into.
fn extend_filter(schema: &Schema, model: ModelId, filter: &mut Document, shape: &Document) {
    let m = schema.model(model);
    for (name, wanted) in shape {
        let star = wanted.as_str() == Some("*");
        let nested = match wanted {
            JsonValue::Object(doc) => doc.clone(),
            _ if star => Document::new(),
            _ => continue,
        };
        let Some(Field::ForeignKey(fk)) = m.field(name) else { continue };
        let referenced = schema.model(fk.referenced.model);
        let entry = ensure_object(filter, name, referenced.key_name());
        if star || !pk_only(referenced, &nested) {
            entry.insert("*".into(), JsonValue::Bool(true));
        }
        extend_filter(schema, referenced.id, entry, &nested);
    }
}

fn parse_order(entry: &str) -> (&str, Direction) {
    if let Some(path) = entry.strip_prefix('-') {
        return (path.trim(), Direction::Desc);
    }
    let mut parts = entry.split_whitespace();
    let path = parts.next().unwrap_or_default();
    match parts.next() {
        Some(dir) if dir.eq_ignore_ascii_case("desc") => (path, Direction::Desc),
        _ => (path, Direction::Asc),
    }
}

/// Adds join markers so that a dotted order path can be resolved.
fn extend_order(schema: &Schema, model: ModelId, filter: &mut Document, entry: &str) -> Result<()> {
    let (path, _) = parse_order(entry);
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = filter;
    let mut m = schema.model(model);
    for i in 0..segments.len().saturating_sub(1) {
        let name = segments[i];
        let Some(Field::ForeignKey(fk)) = m.field(name) else {
            return Err(Error::NotForeignKey(entry.to_string()));
        };
        let referenced = schema.model(fk.referenced.model);
        let is_last_hop = i == segments.len() - 2;
        if !is_last_hop || segments[i + 1] != referenced.key_name() {
            current = ensure_object(current, name, referenced.key_name());
            m = referenced;
        }
    }
    Ok(())
}

/// The dotted field paths a shape projects, starting with every column-backed field.
fn get_fields(
    schema: &Schema,
    model: ModelId,
    input: &JsonValue,
    prefix: Option<&str>,
    field_map: &mut HashMap<String, String>,
) -> Vec<String> {
    let m = schema.model(model);
    let key = |name: &str| prefix.map_or_else(|| name.to_string(), |p| format!("{}.{}", p, name));
    let mut result: Vec<String> = m.simple_fields().map(|(_, f)| key(&f.name)).collect();

    let JsonValue::Object(input) = input else { return result };

    for (name, value) in input {
        let k = key(name);
        if !truthy(value) {
            result.retain(|r| r != &k);
            continue;
        }
        match m.field(name) {
            Some(Field::ForeignKey(fk)) => {
                if !should_select_separately(schema, fk.referenced.model, value) {
                    result.extend(get_fields(schema, fk.referenced.model, value, Some(&k), field_map));
                }
            }
            _ => {
                if let JsonValue::String(alias) = value {
                    field_map.insert(k.replace('.', "__"), alias.clone());
                }
            }
        }
    }
    result
}

// ============================================================================
// Query Builder
// ============================================================================

#[derive(Debug, Clone)]
struct Scope {
    model: ModelId,
    /// Table name at the root, `tN` below it.
    qualifier: String,
    path: Vec<String>,
    /// Join list this scope may add to.
    from: Option<usize>,
}

/// Compiles filters and projections for one statement. Aliases (`t0`, `t1`, ...)
/// are unique across the whole statement, subqueries included.
pub struct QueryBuilder<'s> {
    schema: &'s Schema,
    counter: usize,
    aliases: HashMap<String, (String, ModelId)>,
    froms: Vec<Vec<Join>>,
    field_map: HashMap<String, String>,
}

impl<'s> QueryBuilder<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Self { schema, counter: 0, aliases: HashMap::new(), froms: Vec::new(), field_map: HashMap::new() }
    }

    /// Output renames requested by string values in a field shape.
    pub fn field_map(&self) -> &HashMap<String, String> {
        &self.field_map
    }

    /// Compiles a bare condition over `model`, qualified by its table name.
    pub fn where_clause(&mut self, model: ModelId, filter: &JsonValue) -> Result<Option<Expr>> {
        let scope = Scope {
            model,
            qualifier: self.schema.model(model).table_name.clone(),
            path: Vec::new(),
            from: None,
        };
        self.filter(&scope, filter)
    }

    /// Builds a `SELECT` over `model`.
    pub fn select(
        &mut self,
        model: ModelId,
        projection: Projection<'_>,
        filter: &JsonValue,
        order_by: &[String],
    ) -> Result<Select> {
        let schema = self.schema;
        let m = schema.model(model);
        let from = self.new_from();
        let root = Scope { model, qualifier: m.table_name.clone(), path: Vec::new(), from: Some(from) };

        let mut filter = match filter {
            JsonValue::Null => Document::new(),
            JsonValue::Object(doc) => doc.clone(),
            JsonValue::Array(_) => {
                let mut doc = Document::new();
                doc.insert("or".into(), filter.clone());
                doc
            }
            other => return Err(Error::BadFilter(other.to_string())),
        };
        if let Projection::Shape(shape) = projection {
            extend_filter(schema, model, &mut filter, shape);
        }
        for entry in order_by {
            extend_order(schema, model, &mut filter, entry)?;
        }

        let condition = self.and(&root, &filter)?;

        let mut items = Vec::new();
        let mut seen = HashSet::new();
        match projection {
            Projection::All => {
                for (_, field) in m.simple_fields() {
                    self.push_field(&root, &field.name, &mut items, &mut seen)?;
                }
            }
            Projection::Fields(fields) => {
                for &index in fields {
                    self.push_field(&root, m.fields[index].name(), &mut items, &mut seen)?;
                }
            }
            Projection::Shape(shape) => {
                let paths = get_fields(schema, model, &JsonValue::Object(shape.clone()), None, &mut self.field_map);
                for path in paths {
                    self.push_field(&root, &path, &mut items, &mut seen)?;
                }
            }
            Projection::Count(field) => {
                let inner = match field {
                    Some(name) => {
                        let f = m.field(name).and_then(Field::as_simple).ok_or_else(|| Error::unknown_field(&m.name, name))?;
                        Some(Box::new(Expr::column(&root.qualifier, &f.column.name)))
                    }
                    None => None,
                };
                items.push(SelectItem::Expr { expr: Expr::Count(inner), alias: Some("result".into()) });
            }
        }

        let mut order = Vec::new();
        for entry in order_by {
            let (path, direction) = parse_order(entry);
            let column = if matches!(projection, Projection::Count(_)) {
                self.resolve_field(&root, path)?.0
            } else {
                self.push_field(&root, path, &mut items, &mut seen)?
            };
            order.push((column, direction));
        }

        let mut select = Select::new(TableRef { name: m.table_name.clone(), alias: None });
        select.projection = items;
        select.joins = std::mem::take(&mut self.froms[from]);
        select.filter = condition;
        select.order_by = order;
        Ok(select)
    }

    fn new_from(&mut self) -> usize {
        self.froms.push(Vec::new());
        self.froms.len() - 1
    }

    fn next_alias(&mut self) -> String {
        let alias = format!("t{}", self.counter);
        self.counter += 1;
        alias
    }

    fn alias_key(from: usize, path: &str) -> String {
        format!("{}:{}", from, path)
    }

    fn child(&mut self, parent: &Scope, model: ModelId, segment: &str, from: Option<usize>) -> Scope {
        let mut path = parent.path.clone();
        path.push(segment.to_string());
        Scope { model, qualifier: self.next_alias(), path, from }
    }

    fn column(scope: &Scope, field: &SimpleField) -> Expr {
        Expr::column(&scope.qualifier, &field.column.name)
    }

    fn resolve_field(&self, root: &Scope, path: &str) -> Result<(Expr, String)> {
        let schema = self.schema;
        let (qualifier, model, name) = match path.rsplit_once('.') {
            Some((prefix, last)) => match root.from.and_then(|from| self.aliases.get(&Self::alias_key(from, prefix))) {
                Some((alias, model)) => (alias.clone(), *model, last),
                // `user.id` without a join reads the foreign key column itself
                None => (root.qualifier.clone(), root.model, path.split('.').next().unwrap_or(path)),
            },
            None => (root.qualifier.clone(), root.model, path),
        };
        let m = schema.model(model);
        let field = m.field(name).and_then(Field::as_simple).ok_or_else(|| Error::unknown_field(&m.name, path))?;
        Ok((Expr::column(&qualifier, &field.column.name), path.replace('.', "__")))
    }

    fn push_field(
        &mut self,
        root: &Scope,
        path: &str,
        items: &mut Vec<SelectItem>,
        seen: &mut HashSet<String>,
    ) -> Result<Expr> {
        let (expr, output) = self.resolve_field(root, path)?;
        if seen.insert(output.clone()) {
            items.push(SelectItem::Expr { expr: expr.clone(), alias: Some(output) });
        }
        Ok(expr)
    }

    fn filter(&mut self, scope: &Scope, filter: &JsonValue) -> Result<Option<Expr>> {
        match filter {
            JsonValue::Null => Ok(None),
            JsonValue::Object(doc) => self.and(scope, doc),
            JsonValue::Array(items) => {
                let mut exprs = Vec::with_capacity(items.len());
                for item in items {
                    exprs.push(self.filter(scope, item)?.unwrap_or(Expr::Bool(true)));
                }
                Ok(Some(Expr::or(exprs).unwrap_or(Expr::Bool(false))))
            }
            other => Err(Error::BadFilter(other.to_string())),
        }
    }

    fn and(&mut self, scope: &Scope, doc: &Document) -> Result<Option<Expr>> {
        let schema = self.schema;
        let model = schema.model(scope.model);
        let mut exprs = Vec::new();

        for (key, value) in doc {
            if key == "*" {
                continue;
            }

            let Some((index, op)) = split_key(model, key) else {
                match key.as_str() {
                    "and" => {
                        for item in to_array(value) {
                            if let Some(expr) = self.filter(scope, item)? {
                                exprs.push(expr);
                            }
                        }
                    }
                    "or" | "not" => {
                        let mut parts = Vec::new();
                        for item in to_array(value) {
                            parts.push(self.filter(scope, item)?.unwrap_or(Expr::Bool(true)));
                        }
                        let any = Expr::or(parts).unwrap_or(Expr::Bool(false));
                        exprs.push(if key == "not" { Expr::Not(Box::new(any)) } else { any });
                    }
                    _ => return Err(Error::unknown_field(&model.name, key)),
                }
                continue;
            };

            match &model.fields[index] {
                Field::Simple(field) => exprs.push(self.expr(scope, field, op, value)?),
                Field::ForeignKey(fk) => {
                    if let Some(expr) = self.foreign_key(scope, fk, op, value)? {
                        exprs.push(expr);
                    }
                }
                Field::Related(related) => {
                    let everything = JsonValue::Object(Document::new());
                    let filter = if value.as_str() == Some("*") { &everything } else { value };
                    exprs.push(self.exists(scope, related, op, filter)?);
                }
            }
        }

        Ok(Expr::and(exprs))
    }

    fn expr(&mut self, scope: &Scope, field: &SimpleField, op: Operator, value: &JsonValue) -> Result<Expr> {
        let lhs = Self::column(scope, field);

        if let JsonValue::Array(items) = value {
            if !matches!(op, Operator::Eq | Operator::In) {
                return Err(Error::BadFilter(format!("{}: {}", field.name, value)));
            }
            let mut has_null = false;
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                match Value::from_json(item) {
                    Some(Value::Null) => has_null = true,
                    Some(v) => list.push(to_row(&v, field)),
                    None => return Err(Error::BadFilter(format!("{}: {}", field.name, value))),
                }
            }
            let is_null = Expr::IsNull { expr: Box::new(lhs.clone()), negated: false };
            return Ok(match (has_null, list.is_empty()) {
                (true, true) => is_null,
                (true, false) => Expr::Or(vec![is_null, Expr::InList { expr: Box::new(lhs), list }]),
                (false, true) => Expr::Bool(false),
                (false, false) => Expr::InList { expr: Box::new(lhs), list },
            });
        }

        let scalar = Value::from_json(value).ok_or_else(|| Error::BadFilter(format!("{}: {}", field.name, value)))?;

        Ok(match op {
            Operator::Null => Expr::IsNull { expr: Box::new(lhs), negated: !truthy(value) },
            Operator::Eq | Operator::In if scalar.is_null() => Expr::IsNull { expr: Box::new(lhs), negated: false },
            Operator::Cmp(BinaryOp::Ne) if scalar.is_null() => Expr::IsNull { expr: Box::new(lhs), negated: true },
            Operator::Eq => Expr::binary(lhs, BinaryOp::Eq, Expr::Value(to_row(&scalar, field))),
            Operator::In => Expr::InList { expr: Box::new(lhs), list: vec![to_row(&scalar, field)] },
            Operator::Cmp(op) => Expr::binary(lhs, op, Expr::Value(to_row(&scalar, field))),
            Operator::Some | Operator::None => {
                return Err(Error::BadFilter(format!("{} is not a related field", field.name)));
            }
        })
    }

    fn foreign_key(
        &mut self,
        scope: &Scope,
        fk: &'s ForeignKeyField,
        op: Operator,
        value: &JsonValue,
    ) -> Result<Option<Expr>> {
        let schema = self.schema;
        match value {
            JsonValue::Array(items) => {
                let (values, filters): (Vec<JsonValue>, Vec<JsonValue>) = items.iter().cloned().partition(is_value);
                let mut parts = Vec::new();
                if !values.is_empty() {
                    parts.push(self.expr(scope, &fk.simple, Operator::In, &JsonValue::Array(values))?);
                }
                if !filters.is_empty() {
                    if let Some(expr) = self.join(scope, fk, &JsonValue::Array(filters))? {
                        parts.push(expr);
                    }
                }
                Ok(Some(Expr::or(parts).unwrap_or(Expr::Bool(false))))
            }
            JsonValue::Object(query) => {
                let referenced = schema.model(fk.referenced.model);
                if query.len() == 1 {
                    if let Some((key, inner)) = query.iter().next() {
                        if let Some((index, inner_op)) = split_key(referenced, key) {
                            if index == referenced.key_field() && is_plain(inner) {
                                return self.expr(scope, &fk.simple, inner_op, inner).map(Some);
                            }
                            if let Field::Related(related) = &referenced.fields[index] {
                                let child = schema.model(related.referencing.model);
                                let referencing = schema.foreign_key(related.referencing);
                                let filter = match related.through {
                                    Some(through) if key == &related.name => {
                                        let mut doc = Document::new();
                                        doc.insert(schema.field(through).name().to_string(), inner.clone());
                                        JsonValue::Object(doc)
                                    }
                                    _ => inner.clone(),
                                };
                                let sub = self.subselect(
                                    scope,
                                    &related.name,
                                    child.id,
                                    &referencing.simple.column.name,
                                    &filter,
                                )?;
                                return Ok(Some(Expr::InSubquery {
                                    expr: Box::new(Self::column(scope, &fk.simple)),
                                    query: Box::new(sub),
                                }));
                            }
                        }
                    }
                }
                self.join(scope, fk, value)
            }
            _ => self.expr(scope, &fk.simple, op, value).map(Some),
        }
    }

    fn subselect(
        &mut self,
        parent: &Scope,
        segment: &str,
        model: ModelId,
        column: &str,
        filter: &JsonValue,
    ) -> Result<Select> {
        let from = self.new_from();
        let scope = self.child(parent, model, segment, Some(from));
        let condition = self.filter(&scope, filter)?;
        let mut select = Select::new(TableRef {
            name: self.schema.model(model).table_name.clone(),
            alias: Some(scope.qualifier.clone()),
        });
        select.projection.push(SelectItem::Expr { expr: Expr::column(&scope.qualifier, column), alias: None });
        select.joins = std::mem::take(&mut self.froms[from]);
        select.filter = condition;
        Ok(select)
    }

    /// `fk IN (SELECT key FROM referenced WHERE ...)`
    fn in_subquery(&mut self, scope: &Scope, fk: &'s ForeignKeyField, filter: &JsonValue) -> Result<Expr> {
        let referenced = self.schema.model(fk.referenced.model);
        if let Some(doc) = filter.as_object() {
            if pk_only(referenced, doc) {
                if let Some(value) = doc.get(referenced.key_name()).filter(|v| is_plain(v)) {
                    return self.expr(scope, &fk.simple, Operator::Eq, value);
                }
            }
        }
        let key = referenced.key_column().name.clone();
        let sub = self.subselect(scope, &fk.simple.name, referenced.id, &key, filter)?;
        Ok(Expr::InSubquery { expr: Box::new(Self::column(scope, &fk.simple)), query: Box::new(sub) })
    }

    fn join(&mut self, scope: &Scope, fk: &'s ForeignKeyField, filter: &JsonValue) -> Result<Option<Expr>> {
        let Some(from) = scope.from else {
            return self.in_subquery(scope, fk, filter).map(Some);
        };

        let schema = self.schema;
        let referenced = schema.model(fk.referenced.model);

        if let Some(doc) = filter.as_object() {
            if pk_only(referenced, doc) {
                if let Some(value) = doc.get(referenced.key_name()).filter(|v| is_value(v)) {
                    return self.expr(scope, &fk.simple, Operator::Eq, value).map(Some);
                }
            }
        }

        let mut path = scope.path.clone();
        path.push(fk.simple.name.clone());
        let key = Self::alias_key(from, &path.join("."));

        let qualifier = match self.aliases.get(&key) {
            Some((alias, _)) => alias.clone(),
            None => {
                let alias = self.next_alias();
                let on = Expr::binary(
                    Self::column(scope, &fk.simple),
                    BinaryOp::Eq,
                    Expr::column(&alias, &referenced.key_column().name),
                );
                self.froms[from].push(Join {
                    table: TableRef { name: referenced.table_name.clone(), alias: Some(alias.clone()) },
                    on,
                });
                self.aliases.insert(key, (alias.clone(), referenced.id));
                alias
            }
        };

        let child = Scope { model: referenced.id, qualifier, path, from: Some(from) };
        self.filter(&child, filter)
    }

    fn exists(&mut self, scope: &Scope, related: &'s RelatedField, op: Operator, filter: &JsonValue) -> Result<Expr> {
        let schema = self.schema;
        let child_model = schema.model(related.referencing.model);
        let referencing = schema.foreign_key(related.referencing);

        let from = self.new_from();
        let child = self.child(scope, child_model.id, &related.name, Some(from));

        let condition = match related.through {
            Some(through) => Some(self.in_subquery(&child, schema.foreign_key(through), filter)?),
            None => self.filter(&child, filter)?,
        };

        let parent_key = &schema.model(scope.model).key_column().name;
        let link = Expr::binary(
            Self::column(&child, &referencing.simple),
            BinaryOp::Eq,
            Expr::column(&scope.qualifier, parent_key),
        );

        let mut select =
            Select::new(TableRef { name: child_model.table_name.clone(), alias: Some(child.qualifier.clone()) });
        select.projection.push(SelectItem::Wildcard(child.qualifier.clone()));
        select.joins = std::mem::take(&mut self.froms[from]);
        select.filter = Expr::and(std::iter::once(link).chain(condition).collect());

        Ok(Expr::Exists { query: Box::new(select), negated: op == Operator::None })
    }
}

/// Compiles `filter` over `model` into a SQL condition with bound parameters.
///
/// # Example
///
/// ```rust,ignore
/// let sql = encode_filter(&schema, "Product", &json!({ "categories": { "name": "Fruit" } }), Drivers::SQLite)?;
/// assert!(sql.text.starts_with("EXISTS"));
/// ```
pub fn encode_filter(schema: &Schema, model: &str, filter: &JsonValue, driver: Drivers) -> Result<Sql> {
    let model = schema.model_by_name(model)?.id;
    let mut builder = QueryBuilder::new(schema);
    let expr = builder.where_clause(model, filter)?.unwrap_or(Expr::Bool(true));
    Ok(Serializer::serialize_expr(driver, &expr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnInfo, TableInfo};
    use serde_json::json;

    fn schema() -> Result<Schema> {
        Schema::builder()
            .table(
                TableInfo::new("category")
                    .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
                    .column(ColumnInfo::new("name", "VARCHAR(64)").unique()),
            )
            .table(
                TableInfo::new("product")
                    .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
                    .column(ColumnInfo::new("name", "VARCHAR(64)").unique())
                    .column(ColumnInfo::new("price", "FLOAT"))
                    .column(ColumnInfo::new("category_id", "INTEGER").nullable().references("category", "id")),
            )
            .build()
    }

    #[test]
    fn test_split_key() -> Result<()> {
        let schema = schema()?;
        let product = schema.model_by_name("Product")?;
        assert_eq!(split_key(product, "price_lt"), Some((2, Operator::Cmp(BinaryOp::Lt))));
        assert_eq!(split_key(product, "category_null"), Some((3, Operator::Null)));
        assert_eq!(split_key(product, "name"), Some((1, Operator::Eq)));
        assert_eq!(split_key(product, "name_between"), None);
        Ok(())
    }

    #[test]
    fn test_scalar_operators() -> Result<()> {
        let schema = schema()?;
        let sql = encode_filter(&schema, "Product", &json!({ "name_like": "%pple", "price_ge": 2 }), Drivers::SQLite)?;
        assert_eq!(sql.text, "\"product\".\"name\" LIKE ? AND \"product\".\"price\" >= ?");
        assert_eq!(sql.params, vec![Value::from("%pple"), Value::Int(2)]);

        let sql = encode_filter(&schema, "Product", &json!({ "id": [1, null, 3] }), Drivers::SQLite)?;
        assert_eq!(sql.text, "\"product\".\"id\" IS NULL OR \"product\".\"id\" IN (?, ?)");
        assert_eq!(sql.params, vec![Value::Int(1), Value::Int(3)]);

        let sql = encode_filter(&schema, "Product", &json!({ "id": [] }), Drivers::SQLite)?;
        assert_eq!(sql.text, "1 = 0");
        Ok(())
    }

    #[test]
    fn test_or_and_not() -> Result<()> {
        let schema = schema()?;
        let filter = json!([{ "name": "Apple" }, { "not": { "price_gt": 5 } }]);
        let sql = encode_filter(&schema, "Product", &filter, Drivers::SQLite)?;
        assert_eq!(sql.text, "\"product\".\"name\" = ? OR NOT (\"product\".\"price\" > ?)");
        Ok(())
    }

    #[test]
    fn test_foreign_key_outside_select_uses_subquery() -> Result<()> {
        let schema = schema()?;
        let sql = encode_filter(&schema, "Product", &json!({ "category": { "name": "Fruit" } }), Drivers::SQLite)?;
        assert_eq!(
            sql.text,
            "\"product\".\"category_id\" IN (SELECT \"t0\".\"id\" FROM \"category\" \"t0\" WHERE \"t0\".\"name\" = ?)"
        );

        let sql = encode_filter(&schema, "Product", &json!({ "category": { "id": 4 } }), Drivers::SQLite)?;
        assert_eq!(sql.text, "\"product\".\"category_id\" = ?");
        Ok(())
    }

    #[test]
    fn test_related_field_uses_exists() -> Result<()> {
        let schema = schema()?;
        let sql = encode_filter(&schema, "Category", &json!({ "products_none": { "price_lt": 1 } }), Drivers::Postgres)?;
        assert_eq!(
            sql.text,
            "NOT EXISTS (SELECT \"t0\".* FROM \"product\" \"t0\" WHERE \"t0\".\"category_id\" = \"category\".\"id\" AND \"t0\".\"price\" < $1)"
        );
        Ok(())
    }

    #[test]
    fn test_related_some_joins_column_filters_with_and() -> Result<()> {
        let schema = schema()?;
        let filter = json!({ "name": "Apple", "products_some": { "price_gt": 5 } });
        let sql = encode_filter(&schema, "Category", &filter, Drivers::Postgres)?;
        assert_eq!(
            sql.text,
            "\"category\".\"name\" = $1 AND EXISTS (SELECT \"t0\".* FROM \"product\" \"t0\" \
             WHERE \"t0\".\"category_id\" = \"category\".\"id\" AND \"t0\".\"price\" > $2)"
        );
        assert_eq!(sql.params, vec![Value::from("Apple"), Value::Int(5)]);
        Ok(())
    }

    #[test]
    fn test_select_joins_and_reuses_alias() -> Result<()> {
        let schema = schema()?;
        let product = schema.model_id("Product").ok_or(Error::RowNotFound)?;
        let mut builder = QueryBuilder::new(&schema);
        let shape = json!({ "name": true, "category": { "name": "categoryName" } });
        let shape = shape.as_object().ok_or(Error::RowNotFound)?;
        let select = builder.select(
            product,
            Projection::Shape(shape),
            &json!({ "category": { "name": "Fruit" } }),
            &["-category.name".to_string()],
        )?;
        assert_eq!(select.joins.len(), 1);
        assert_eq!(select.order_by.len(), 1);
        assert_eq!(builder.field_map().get("category__name").map(String::as_str), Some("categoryName"));
        Ok(())
    }
}
