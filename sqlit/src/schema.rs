//! # Schema Module
//!
//! The immutable description of the mapped database: models, their fields and
//! unique keys. Schemas are assembled once from [`TableInfo`] / [`ColumnInfo`]
//! descriptions and then shared as `Arc<Schema>` by every `Database` and fork.
//!
//! Field naming follows the database layout:
//!
//! - models are the UpperCamelCase table name (`order_item` → `OrderItem`)
//! - columns become lowerCamelCase fields (`first_name` → `firstName`)
//! - foreign keys drop a trailing `_id` (`user_id` → `user`)
//! - each foreign key adds a related field on the referenced model
//!   (`User.orders`, `Order.orderShipping` when the key is unique)
//! - join tables (two foreign keys forming a unique key) add a many-to-many
//!   related field on each side (`Product.categories`)

// ============================================================================
// External Crate Imports
// ============================================================================

use heck::{ToLowerCamelCase, ToUpperCamelCase};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{
    value::{is_value, ColumnKind, Document, Value},
    Error, Result,
};

/// Index of a model inside its [`Schema`].
pub type ModelId = usize;

// ============================================================================
// Column Descriptions (input)
// ============================================================================

/// Metadata describing a database column, used to build a [`Schema`].
///
/// # Example
///
/// ```rust,ignore
/// let id = ColumnInfo::new("id", "INTEGER").primary_key().auto_increment();
/// let user = ColumnInfo::new("user_id", "INTEGER").nullable().references("user", "id");
/// ```
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// The column name in the database.
    pub name: String,
    /// The SQL type of the column (e.g., "VARCHAR(64)", "INTEGER", "DATETIME(3)").
    pub sql_type: String,
    /// Whether this column is (part of) the primary key.
    pub is_primary_key: bool,
    /// Whether this column allows NULL values.
    pub is_nullable: bool,
    /// Whether the database generates the value on insert.
    pub auto_increment: bool,
    /// Whether this column has a UNIQUE constraint on its own.
    pub unique: bool,
    /// Whether an index should be created for this column.
    pub index: bool,
    /// The referenced table, if this is a foreign key.
    pub foreign_table: Option<String>,
    /// The referenced column, if this is a foreign key.
    pub foreign_key: Option<String>,
    /// Overrides the name of the related field added to the referenced model.
    pub related_name: Option<String>,
}

impl ColumnInfo {
    pub fn new(name: &str, sql_type: &str) -> Self {
        Self {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            is_primary_key: false,
            is_nullable: false,
            auto_increment: false,
            unique: false,
            index: false,
            foreign_table: None,
            foreign_key: None,
            related_name: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.is_nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn references(mut self, table: &str, column: &str) -> Self {
        self.foreign_table = Some(table.to_string());
        self.foreign_key = Some(column.to_string());
        self
    }

    pub fn related_name(mut self, name: &str) -> Self {
        self.related_name = Some(name.to_string());
        self
    }
}

/// Metadata describing a table: its columns and composite unique keys.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub unique_keys: Vec<Vec<String>>,
}

impl TableInfo {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), columns: Vec::new(), unique_keys: Vec::new() }
    }

    pub fn column(mut self, column: ColumnInfo) -> Self {
        self.columns.push(column);
        self
    }

    /// Declares a (possibly composite) unique key by column names.
    pub fn unique(mut self, columns: &[&str]) -> Self {
        self.unique_keys.push(columns.iter().map(|c| c.to_string()).collect());
        self
    }
}

// ============================================================================
// Schema Types
// ============================================================================

/// A column as seen by the mapper.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    pub auto_increment: bool,
    pub indexed: bool,
    pub kind: ColumnKind,
}

impl Column {
    pub fn new(name: &str, sql_type: &str) -> Self {
        Self {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            nullable: false,
            auto_increment: false,
            indexed: false,
            kind: ColumnKind::classify(sql_type),
        }
    }
}

/// A field backed by a column.
#[derive(Debug, Clone)]
pub struct SimpleField {
    pub name: String,
    pub column: Column,
    /// Whether the field belongs to any unique key.
    pub unique: bool,
}

/// Addresses a field of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub model: ModelId,
    pub field: usize,
}

/// A column referencing the primary key of another model.
#[derive(Debug, Clone)]
pub struct ForeignKeyField {
    pub simple: SimpleField,
    pub referenced: FieldRef,
    /// The related field added to the referenced model for this key.
    pub related: Option<FieldRef>,
}

/// A virtual field listing the rows of another model that point back here.
#[derive(Debug, Clone)]
pub struct RelatedField {
    pub name: String,
    /// The foreign key on the child model.
    pub referencing: FieldRef,
    /// For many-to-many, the join table's other foreign key.
    pub through: Option<FieldRef>,
}

#[derive(Debug, Clone)]
pub enum Field {
    Simple(SimpleField),
    ForeignKey(ForeignKeyField),
    Related(RelatedField),
}

impl Field {
    pub fn name(&self) -> &str {
        match self {
            Field::Simple(f) => &f.name,
            Field::ForeignKey(f) => &f.simple.name,
            Field::Related(f) => &f.name,
        }
    }

    /// The column-backed view of the field; foreign keys are simple fields too.
    pub fn as_simple(&self) -> Option<&SimpleField> {
        match self {
            Field::Simple(f) => Some(f),
            Field::ForeignKey(f) => Some(&f.simple),
            Field::Related(_) => None,
        }
    }

    pub fn as_foreign_key(&self) -> Option<&ForeignKeyField> {
        match self {
            Field::ForeignKey(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_related(&self) -> Option<&RelatedField> {
        match self {
            Field::Related(f) => Some(f),
            _ => None,
        }
    }

    pub fn column(&self) -> Option<&Column> {
        self.as_simple().map(|f| &f.column)
    }
}

#[derive(Debug, Clone)]
pub struct UniqueKey {
    pub name: String,
    pub fields: Vec<usize>,
    pub primary: bool,
}

#[derive(Debug, Clone)]
pub struct Model {
    pub id: ModelId,
    pub name: String,
    pub table_name: String,
    pub fields: Vec<Field>,
    /// Unique key #0 is always the primary key.
    pub unique_keys: Vec<UniqueKey>,
    field_map: HashMap<String, usize>,
    column_map: HashMap<String, usize>,
}

impl Model {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.field_map.get(name).copied()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.field_index(name).map(|i| &self.fields[i])
    }

    /// Looks a field up by field name, falling back to the column name.
    pub fn field_or_column(&self, name: &str) -> Option<usize> {
        self.field_index(name).or_else(|| self.column_map.get(name).copied())
    }

    pub fn primary_key(&self) -> &UniqueKey {
        &self.unique_keys[0]
    }

    /// The first field of the primary key.
    pub fn key_field(&self) -> usize {
        self.unique_keys[0].fields[0]
    }

    pub fn key_name(&self) -> &str {
        self.fields[self.key_field()].name()
    }

    pub fn key_column(&self) -> &Column {
        match &self.fields[self.key_field()] {
            Field::Simple(f) => &f.column,
            Field::ForeignKey(f) => &f.simple.column,
            Field::Related(_) => unreachable!("primary keys are column-backed"),
        }
    }

    pub fn is_auto_increment(&self) -> bool {
        self.primary_key().fields.len() == 1 && self.key_column().auto_increment
    }

    /// Whether `field` alone forms a unique key.
    pub fn is_unique_field(&self, field: usize) -> bool {
        self.unique_keys.iter().any(|uk| uk.fields.len() == 1 && uk.fields[0] == field)
    }

    pub fn simple_fields(&self) -> impl Iterator<Item = (usize, &SimpleField)> {
        self.fields.iter().enumerate().filter_map(|(i, f)| f.as_simple().map(|s| (i, s)))
    }

    pub fn display_name(&self, field: usize) -> String {
        format!("{}.{}", self.name, self.fields[field].name())
    }
}

/// The immutable collection of models.
#[derive(Debug, Clone)]
pub struct Schema {
    pub models: Vec<Model>,
    model_map: HashMap<String, ModelId>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Looks up a model by model name or table name.
    pub fn model_id(&self, name: &str) -> Option<ModelId> {
        self.model_map.get(name).copied()
    }

    pub fn model(&self, id: ModelId) -> &Model {
        &self.models[id]
    }

    pub fn model_by_name(&self, name: &str) -> Result<&Model> {
        self.model_id(name).map(|id| &self.models[id]).ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    pub fn field(&self, r: FieldRef) -> &Field {
        &self.models[r.model].fields[r.field]
    }

    pub fn foreign_key(&self, r: FieldRef) -> &ForeignKeyField {
        match self.field(r) {
            Field::ForeignKey(f) => f,
            _ => unreachable!("field references always point at foreign keys"),
        }
    }

    /// The primary-key value of a document (or the scalar itself), following
    /// primary keys that are themselves foreign keys.
    pub fn key_value(&self, model: ModelId, data: &JsonValue) -> Option<Value> {
        if is_value(data) {
            return Value::from_json(data);
        }
        let doc = data.as_object()?;
        let m = &self.models[model];
        match &m.fields[m.key_field()] {
            Field::ForeignKey(fk) => self.key_value(fk.referenced.model, doc.get(&fk.simple.name)?),
            field => Value::from_json(doc.get(field.name())?),
        }
    }

    /// The scalar value of `field` in a document; foreign keys resolve to the referenced key.
    pub fn value_of(&self, model: ModelId, doc: &Document, field: usize) -> Option<Value> {
        let f = &self.models[model].fields[field];
        let value = doc.get(f.name())?;
        match f {
            Field::ForeignKey(fk) => self.key_value(fk.referenced.model, value),
            _ => Value::from_json(value),
        }
    }

    fn complete_key(&self, model: ModelId, doc: &Document) -> Option<&UniqueKey> {
        self.models[model].unique_keys.iter().find(|uk| {
            uk.fields.iter().all(|&f| matches!(self.value_of(model, doc, f), Some(v) if !v.is_null()))
        })
    }

    /// Whether the document carries every field of at least one unique key.
    pub fn check_unique_key(&self, model: ModelId, doc: &Document) -> bool {
        self.complete_key(model, doc).is_some()
    }

    /// The fields of the first complete unique key, as a filter document.
    pub fn unique_fields(&self, model: ModelId, doc: &Document) -> Option<Document> {
        let m = &self.models[model];
        let uk = self.complete_key(model, doc)?;
        let mut filter = Document::new();
        for &f in &uk.fields {
            let name = m.fields[f].name();
            if let Some(value) = doc.get(name) {
                filter.insert(name.to_string(), value.clone());
            }
        }
        Some(filter)
    }

    /// Whether a filter on the related field's child selects at most one row.
    pub fn is_unique_reference(&self, r: FieldRef) -> bool {
        self.models[r.model].is_unique_field(r.field)
    }
}

// ============================================================================
// Schema Builder
// ============================================================================

/// Assembles a [`Schema`] from table descriptions.
///
/// # Example
///
/// ```rust,ignore
/// let schema = Schema::builder()
///     .table(TableInfo::new("user")
///         .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
///         .column(ColumnInfo::new("email", "VARCHAR(255)").unique()))
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    tables: Vec<TableInfo>,
}

impl SchemaBuilder {
    pub fn table(mut self, table: TableInfo) -> Self {
        self.tables.push(table);
        self
    }

    pub fn build(self) -> Result<Schema> {
        let mut models = Vec::with_capacity(self.tables.len());
        let mut model_map = HashMap::new();
        // (model, field, table, column, related name)
        let mut pending = Vec::new();

        for (id, table) in self.tables.iter().enumerate() {
            let name = table.name.to_upper_camel_case();
            for key in [name.clone(), table.name.clone()] {
                if model_map.insert(key.clone(), id).is_some_and(|other| other != id) {
                    return Err(Error::Schema(format!("duplicate model name {}", key)));
                }
            }

            let mut fields = Vec::new();
            let mut field_map = HashMap::new();
            let mut column_map = HashMap::new();

            for info in &table.columns {
                let mut column = Column::new(&info.name, &info.sql_type);
                column.nullable = info.is_nullable && !info.is_primary_key;
                column.auto_increment = info.auto_increment;
                column.indexed = info.index;

                let field = match (&info.foreign_table, &info.foreign_key) {
                    (Some(f_table), Some(f_key)) => {
                        let stem = info.name.strip_suffix("_id").filter(|s| !s.is_empty()).unwrap_or(&info.name);
                        pending.push((id, fields.len(), f_table.clone(), f_key.clone(), info.related_name.clone()));
                        Field::ForeignKey(ForeignKeyField {
                            simple: SimpleField { name: stem.to_lower_camel_case(), column, unique: false },
                            referenced: FieldRef { model: usize::MAX, field: usize::MAX },
                            related: None,
                        })
                    }
                    _ => Field::Simple(SimpleField { name: info.name.to_lower_camel_case(), column, unique: false }),
                };

                if field_map.insert(field.name().to_string(), fields.len()).is_some() {
                    return Err(Error::Schema(format!("duplicate field {}.{}", name, field.name())));
                }
                column_map.insert(info.name.clone(), fields.len());
                fields.push(field);
            }

            let lookup = |column: &str| {
                column_map.get(column).copied().ok_or_else(|| Error::Schema(format!("unknown column {}.{}", table.name, column)))
            };

            let mut unique_keys: Vec<UniqueKey> = Vec::new();
            let primary: Vec<usize> = table
                .columns
                .iter()
                .filter(|c| c.is_primary_key)
                .map(|c| lookup(&c.name))
                .collect::<Result<_>>()?;
            if primary.is_empty() {
                return Err(Error::Schema(format!("table {} has no primary key", table.name)));
            }
            unique_keys.push(UniqueKey { name: "primary".into(), fields: primary, primary: true });

            let mut declared: Vec<Vec<String>> =
                table.columns.iter().filter(|c| c.unique && !c.is_primary_key).map(|c| vec![c.name.clone()]).collect();
            declared.extend(table.unique_keys.iter().cloned());

            for columns in declared {
                if columns.is_empty() {
                    return Err(Error::Schema(format!("empty unique key on {}", table.name)));
                }
                let key_fields = columns.iter().map(|c| lookup(c)).collect::<Result<Vec<_>>>()?;
                if unique_keys.iter().any(|uk| uk.fields == key_fields) {
                    continue;
                }
                unique_keys.push(UniqueKey { name: columns.join("_"), fields: key_fields, primary: false });
            }

            for uk in &unique_keys {
                for &f in &uk.fields {
                    match &mut fields[f] {
                        Field::Simple(s) => s.unique = true,
                        Field::ForeignKey(fk) => fk.simple.unique = true,
                        Field::Related(_) => {}
                    }
                }
            }

            models.push(Model { id, name, table_name: table.name.clone(), fields, unique_keys, field_map, column_map });
        }

        let mut schema = Schema { models, model_map };

        for (model, field, f_table, f_key, _) in &pending {
            let target = schema.model_id(f_table).ok_or_else(|| Error::UnknownTable(f_table.clone()))?;
            let target_field = schema.models[target]
                .column_map
                .get(f_key)
                .copied()
                .ok_or_else(|| Error::Schema(format!("unknown column {}.{}", f_table, f_key)))?;
            if let Field::ForeignKey(fk) = &mut schema.models[*model].fields[*field] {
                fk.referenced = FieldRef { model: target, field: target_field };
            }
        }

        for (model, field, _, _, related_name) in pending {
            add_related_field(&mut schema, FieldRef { model, field }, related_name)?;
        }

        Ok(schema)
    }
}

/// Returns the other foreign key when `model` is a join table.
fn join_partner(model: &Model, field: usize) -> Option<usize> {
    let keys: Vec<usize> =
        model.fields.iter().enumerate().filter(|(_, f)| f.as_foreign_key().is_some()).map(|(i, _)| i).collect();
    if keys.len() != 2 || !keys.contains(&field) {
        return None;
    }
    let forms_key = model.unique_keys.iter().any(|uk| {
        let mut fields = uk.fields.clone();
        fields.sort_unstable();
        fields == keys
    });
    if !forms_key {
        return None;
    }
    keys.into_iter().find(|&k| k != field)
}

fn add_related_field(schema: &mut Schema, fk_ref: FieldRef, related_name: Option<String>) -> Result<()> {
    let child = &schema.models[fk_ref.model];
    let fk = schema.foreign_key(fk_ref).clone();
    let target = fk.referenced.model;

    let through = join_partner(child, fk_ref.field).map(|field| FieldRef { model: fk_ref.model, field });

    let base = match (&related_name, through) {
        (Some(name), _) => name.clone(),
        (None, Some(partner)) => {
            let far = schema.foreign_key(partner).referenced.model;
            lcfirst(&pluralise(&schema.models[far].name))
        }
        (None, None) if child.is_unique_field(fk_ref.field) => lcfirst(&child.name),
        (None, None) => lcfirst(&pluralise(&child.name)),
    };

    let mut name = base;
    if schema.models[target].field_index(&name).is_some() {
        name = format!("{}{}", fk.simple.name, pluralise(&schema.models[fk_ref.model].name));
    }
    if schema.models[target].field_index(&name).is_some() {
        return Err(Error::Schema(format!("related field {}.{} already exists", schema.models[target].name, name)));
    }

    let model = &mut schema.models[target];
    let index = model.fields.len();
    model.field_map.insert(name.clone(), index);
    model.fields.push(Field::Related(RelatedField { name, referencing: fk_ref, through }));

    if let Field::ForeignKey(fk) = &mut schema.models[fk_ref.model].fields[fk_ref.field] {
        fk.related = Some(FieldRef { model: target, field: index });
    }
    Ok(())
}

// ============================================================================
// Naming Helpers
// ============================================================================

/// English plural of a model name.
pub fn pluralise(word: &str) -> String {
    let lower = word.to_ascii_lowercase();
    if ["s", "x", "z", "ch", "sh"].iter().any(|suffix| lower.ends_with(suffix)) {
        return format!("{}es", word);
    }
    let mut chars = lower.chars().rev();
    if let (Some('y'), Some(prev)) = (chars.next(), chars.next()) {
        if !"aeiou".contains(prev) {
            return format!("{}ies", &word[..word.len() - 1]);
        }
    }
    format!("{}s", word)
}

pub fn lcfirst(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shop() -> Result<Schema> {
        Schema::builder()
            .table(
                TableInfo::new("user")
                    .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
                    .column(ColumnInfo::new("email", "VARCHAR(255)").unique()),
            )
            .table(
                TableInfo::new("order")
                    .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
                    .column(ColumnInfo::new("code", "VARCHAR(32)").unique())
                    .column(ColumnInfo::new("user_id", "INTEGER").nullable().references("user", "id")),
            )
            .table(
                TableInfo::new("order_shipping")
                    .column(ColumnInfo::new("order_id", "INTEGER").primary_key().references("order", "id"))
                    .column(ColumnInfo::new("status", "INTEGER")),
            )
            .table(
                TableInfo::new("category")
                    .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
                    .column(ColumnInfo::new("name", "VARCHAR(64)"))
                    .column(ColumnInfo::new("parent_id", "INTEGER").nullable().references("category", "id"))
                    .unique(&["name", "parent_id"]),
            )
            .table(
                TableInfo::new("product")
                    .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
                    .column(ColumnInfo::new("name", "VARCHAR(64)").unique()),
            )
            .table(
                TableInfo::new("product_category")
                    .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
                    .column(ColumnInfo::new("product_id", "INTEGER").references("product", "id"))
                    .column(ColumnInfo::new("category_id", "INTEGER").references("category", "id"))
                    .unique(&["product_id", "category_id"]),
            )
            .build()
    }

    #[test]
    fn test_field_names() -> Result<()> {
        let schema = shop()?;
        let order = schema.model_by_name("order")?;
        assert_eq!(order.name, "Order");
        assert!(order.field("user").and_then(Field::as_foreign_key).is_some());
        assert!(order.field("orderShipping").and_then(Field::as_related).is_some());

        let user = schema.model_by_name("User")?;
        let orders = user.field("orders").and_then(Field::as_related).ok_or(Error::RowNotFound)?;
        assert_eq!(orders.referencing.model, order.id);
        assert!(orders.through.is_none());

        let category = schema.model_by_name("category")?;
        assert!(category.field("categories").is_some());
        assert_eq!(category.unique_keys.len(), 2);
        Ok(())
    }

    #[test]
    fn test_join_table() -> Result<()> {
        let schema = shop()?;
        let product = schema.model_by_name("Product")?;
        let categories = product.field("categories").and_then(Field::as_related).ok_or(Error::RowNotFound)?;
        let through = categories.through.ok_or(Error::RowNotFound)?;
        assert_eq!(schema.field(through).name(), "category");
        assert!(schema.model_by_name("Category")?.field("products").is_some());
        Ok(())
    }

    #[test]
    fn test_key_value_follows_foreign_key() -> Result<()> {
        let schema = shop()?;
        let shipping = schema.model_id("OrderShipping").ok_or(Error::RowNotFound)?;
        let doc = serde_json::json!({ "order": { "id": 7 }, "status": 1 });
        assert_eq!(schema.key_value(shipping, &doc), Some(Value::Int(7)));
        Ok(())
    }

    #[test]
    fn test_pluralise() {
        assert_eq!(pluralise("Category"), "Categories");
        assert_eq!(pluralise("OrderItem"), "OrderItems");
        assert_eq!(pluralise("Address"), "Addresses");
        assert_eq!(pluralise("Day"), "Days");
        assert_eq!(lcfirst("OrderItems"), "orderItems");
    }
}
