//! Renders statement trees into SQL text plus an ordered parameter list for one
//! driver dialect.

use super::ast::{Delete, Direction, Expr, Insert, Select, SelectItem, Statement, TableRef, Update};
use crate::{database::Drivers, value::Value};

/// SQL text and the values bound to its placeholders, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Sql {
    pub text: String,
    pub params: Vec<Value>,
}

pub struct Serializer {
    driver: Drivers,
    text: String,
    params: Vec<Value>,
}

impl Serializer {
    pub fn new(driver: Drivers) -> Self {
        Self { driver, text: String::new(), params: Vec::new() }
    }

    pub fn serialize(driver: Drivers, statement: &Statement) -> Sql {
        let mut s = Serializer::new(driver);
        match statement {
            Statement::Select(select) => s.select(select),
            Statement::Insert(insert) => s.insert(insert),
            Statement::Update(update) => s.update(update),
            Statement::Delete(delete) => s.delete(delete),
        }
        s.finish()
    }

    /// Renders a bare condition, as used for `WHERE` fragments.
    pub fn serialize_expr(driver: Drivers, expr: &Expr) -> Sql {
        let mut s = Serializer::new(driver);
        s.expr(expr);
        s.finish()
    }

    fn finish(self) -> Sql {
        Sql { text: self.text, params: self.params }
    }

    pub fn escape_id(driver: Drivers, name: &str) -> String {
        match driver {
            Drivers::MySQL => format!("`{}`", name.replace('`', "``")),
            _ => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    fn push_id(&mut self, name: &str) {
        let quoted = Self::escape_id(self.driver, name);
        self.text.push_str(&quoted);
    }

    /// Nulls are written inline so that the database types them from context.
    fn push_param(&mut self, value: &Value) {
        if value.is_null() {
            self.text.push_str("NULL");
            return;
        }
        self.params.push(value.clone());
        match self.driver {
            Drivers::Postgres => {
                let n = self.params.len();
                self.text.push_str(&format!("${}", n));
            }
            _ => self.text.push('?'),
        }
    }

    fn table_ref(&mut self, table: &TableRef) {
        self.push_id(&table.name);
        if let Some(alias) = &table.alias {
            self.text.push(' ');
            self.push_id(alias);
        }
    }

    fn select(&mut self, select: &Select) {
        self.text.push_str("SELECT ");
        for (i, item) in select.projection.iter().enumerate() {
            if i > 0 {
                self.text.push_str(", ");
            }
            match item {
                SelectItem::Wildcard(qualifier) => {
                    self.push_id(qualifier);
                    self.text.push_str(".*");
                }
                SelectItem::Expr { expr, alias } => {
                    self.expr(expr);
                    if let Some(alias) = alias {
                        self.text.push_str(" AS ");
                        self.push_id(alias);
                    }
                }
            }
        }
        self.text.push_str(" FROM ");
        self.table_ref(&select.from);
        for join in &select.joins {
            self.text.push_str(" LEFT JOIN ");
            self.table_ref(&join.table);
            self.text.push_str(" ON ");
            self.expr(&join.on);
        }
        if let Some(filter) = &select.filter {
            self.text.push_str(" WHERE ");
            self.expr(filter);
        }
        if !select.order_by.is_empty() {
            self.text.push_str(" ORDER BY ");
            for (i, (expr, direction)) in select.order_by.iter().enumerate() {
                if i > 0 {
                    self.text.push_str(", ");
                }
                self.expr(expr);
                self.text.push_str(match direction {
                    Direction::Asc => " ASC",
                    Direction::Desc => " DESC",
                });
            }
        }
        if let Some(limit) = select.limit {
            self.text.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = select.offset {
            self.text.push_str(&format!(" OFFSET {}", offset));
        }
    }

    fn insert(&mut self, insert: &Insert) {
        self.text.push_str("INSERT INTO ");
        self.push_id(&insert.table);
        if insert.columns.is_empty() {
            match self.driver {
                Drivers::MySQL => self.text.push_str(" () VALUES ()"),
                _ => self.text.push_str(" DEFAULT VALUES"),
            }
        } else {
            self.text.push_str(" (");
            for (i, column) in insert.columns.iter().enumerate() {
                if i > 0 {
                    self.text.push_str(", ");
                }
                self.push_id(column);
            }
            self.text.push_str(") VALUES ");
            for (i, row) in insert.rows.iter().enumerate() {
                if i > 0 {
                    self.text.push_str(", ");
                }
                self.text.push('(');
                for (j, value) in row.iter().enumerate() {
                    if j > 0 {
                        self.text.push_str(", ");
                    }
                    self.push_param(value);
                }
                self.text.push(')');
            }
        }
        if let (Some(column), Drivers::Postgres) = (&insert.returning, self.driver) {
            self.text.push_str(" RETURNING ");
            self.push_id(column);
        }
    }

    fn update(&mut self, update: &Update) {
        self.text.push_str("UPDATE ");
        self.push_id(&update.table);
        self.text.push_str(" SET ");
        for (i, (column, value)) in update.assignments.iter().enumerate() {
            if i > 0 {
                self.text.push_str(", ");
            }
            self.push_id(column);
            self.text.push_str(" = ");
            self.push_param(value);
        }
        if let Some(filter) = &update.filter {
            self.text.push_str(" WHERE ");
            self.expr(filter);
        }
    }

    fn delete(&mut self, delete: &Delete) {
        self.text.push_str("DELETE FROM ");
        self.push_id(&delete.table);
        if let Some(filter) = &delete.filter {
            self.text.push_str(" WHERE ");
            self.expr(filter);
        }
    }

    fn nested(&mut self, expr: &Expr) {
        match expr {
            Expr::And(_) | Expr::Or(_) => {
                self.text.push('(');
                self.expr(expr);
                self.text.push(')');
            }
            _ => self.expr(expr),
        }
    }

    fn join(&mut self, exprs: &[Expr], separator: &str) {
        for (i, expr) in exprs.iter().enumerate() {
            if i > 0 {
                self.text.push_str(separator);
            }
            self.nested(expr);
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Column { qualifier, name } => {
                if let Some(qualifier) = qualifier {
                    self.push_id(qualifier);
                    self.text.push('.');
                }
                self.push_id(name);
            }
            Expr::Value(value) => self.push_param(value),
            Expr::Binary { left, op, right } => {
                self.expr(left);
                self.text.push(' ');
                self.text.push_str(op.as_sql());
                self.text.push(' ');
                self.expr(right);
            }
            Expr::IsNull { expr, negated } => {
                self.expr(expr);
                self.text.push_str(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            Expr::InList { expr, list } => {
                if list.is_empty() {
                    self.text.push_str("1 = 0");
                    return;
                }
                self.expr(expr);
                self.text.push_str(" IN (");
                for (i, value) in list.iter().enumerate() {
                    if i > 0 {
                        self.text.push_str(", ");
                    }
                    self.push_param(value);
                }
                self.text.push(')');
            }
            Expr::InSubquery { expr, query } => {
                self.expr(expr);
                self.text.push_str(" IN (");
                self.select(query);
                self.text.push(')');
            }
            Expr::Exists { query, negated } => {
                self.text.push_str(if *negated { "NOT EXISTS (" } else { "EXISTS (" });
                self.select(query);
                self.text.push(')');
            }
            Expr::And(exprs) => self.join(exprs, " AND "),
            Expr::Or(exprs) => self.join(exprs, " OR "),
            Expr::Not(inner) => {
                self.text.push_str("NOT (");
                self.expr(inner);
                self.text.push(')');
            }
            Expr::Bool(true) => self.text.push_str("1 = 1"),
            Expr::Bool(false) => self.text.push_str("1 = 0"),
            Expr::Count(None) => self.text.push_str("COUNT(1)"),
            Expr::Count(Some(inner)) => {
                self.text.push_str("COUNT(");
                self.expr(inner);
                self.text.push(')');
            }
        }
    }
}
