//! # Flush Engine
//!
//! Writes the dirty records of a [`Database`] back in one transaction.
//!
//! Records are written table by table in fixed-point passes. A pass over a
//! table merges records sharing a unique key, looks up the rows
//! that already exist (one `SELECT` per table), inserts new rows (one
//! multi-row `INSERT` per set of written columns), then updates and deletes.
//! A record is only written once every record it references has a key, so
//! dependencies land first without any explicit ordering.
//!
//! The first passes are *perfect*: a record is written only when all of its
//! dirty fields can be written. Later *relaxed* passes also write partial
//! rows, which is how nullable reference cycles resolve: the row goes in with
//! a NULL and is updated once the other side has a key. Cycles through NOT NULL
//! columns end in [`Error::CircularReferences`].
//!
//! ```rust,ignore
//! let user = db.append("User", json!({ "email": "a@b.c" }))?;
//! db.append("Order", Data::new().with("code", "A-1").with("user", user))?;
//! db.flush().await?;
//! ```

// ============================================================================
// External Crate Imports
// ============================================================================

use futures::future::BoxFuture;
use indexmap::IndexMap;
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{
    connection::Connection,
    database::{Database, RetryPolicy},
    document::to_document,
    query::{ast::Statement, Projection, QueryBuilder},
    record::{Data, FieldValue, FlushMethod, Input, Perfection, Record, RecordId},
    schema::{Field, ModelId},
    table::TableOps,
    transaction::Transaction,
    value::{Document, Value},
    Error, Result,
};

const SAVEPOINT: &str = "sp";

/// A callback run on the flush transaction's connection.
pub type FlushHook = Box<dyn for<'c> Fn(&'c mut dyn Connection) -> BoxFuture<'c, Result<()>> + Send + Sync>;

/// Options of [`Database::flush_with`].
///
/// # Example
///
/// ```rust,ignore
/// fn lock(conn: &mut dyn Connection) -> BoxFuture<'_, Result<()>> {
///     Box::pin(async move { conn.execute_raw("LOCK TABLE \"order\"").await })
/// }
///
/// db.flush_with(FlushOptions::new().after_begin(lock).replace_records_in(&["Order", "OrderItem"])).await?;
/// ```
#[derive(Default)]
pub struct FlushOptions {
    pub after_begin: Option<FlushHook>,
    pub before_commit: Option<FlushHook>,
    /// A table chain: children of the first table's existing records that were
    /// not written by this flush are deleted, level by level.
    pub replace_records_in: Vec<String>,
    /// Overrides the database's retry policy.
    pub retry: Option<RetryPolicy>,
}

impl FlushOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn after_begin<F>(mut self, hook: F) -> Self
    where
        F: for<'c> Fn(&'c mut dyn Connection) -> BoxFuture<'c, Result<()>> + Send + Sync + 'static,
    {
        self.after_begin = Some(Box::new(hook));
        self
    }

    pub fn before_commit<F>(mut self, hook: F) -> Self
    where
        F: for<'c> Fn(&'c mut dyn Connection) -> BoxFuture<'c, Result<()>> + Send + Sync + 'static,
    {
        self.before_commit = Some(Box::new(hook));
        self
    }

    pub fn replace_records_in(mut self, tables: &[&str]) -> Self {
        self.replace_records_in = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Record state saved before a flush attempt.
struct Snapshot {
    records: Vec<Record>,
    merged: crate::record::MergeSet,
    tables: Vec<crate::table::Table>,
}

impl Database {
    fn snapshot(&self) -> Snapshot {
        Snapshot { records: self.records.clone(), merged: self.merged.clone(), tables: self.tables.clone() }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.records = snapshot.records;
        self.merged = snapshot.merged;
        self.tables = snapshot.tables;
    }

    /// Writes every dirty record.
    pub async fn flush(&mut self) -> Result<()> {
        self.flush_with(FlushOptions::default()).await
    }

    /// Writes every dirty record, retrying the whole transaction after
    /// integrity errors and deadlocks.
    pub async fn flush_with(&mut self, options: FlushOptions) -> Result<()> {
        let retry = options.retry.unwrap_or(self.retry);
        let mut conn = self.pool.get_connection().await?;
        let mut perfect = true;
        let mut retries = 0;

        loop {
            let snapshot = self.snapshot();
            log::info!("flush attempt {} ({} dirty records)", retries + 1, self.dirty_count());

            let mut tx = Transaction::begin(&mut *conn).await?;
            let result = self.flush_steps(tx.connection(), &options, perfect).await;
            let Err(e) = tx.finish(result).await else {
                return Ok(());
            };

            self.restore(snapshot);
            if !(e.is_integrity() || e.is_retryable()) || !retry.allows(retries) {
                return Err(e);
            }
            if e.is_integrity() && perfect {
                log::warn!("flush hit a constraint violation, retrying in relaxed mode: {}", e);
                perfect = false;
            } else {
                log::warn!("flush failed, retrying: {}", e);
            }
            retries += 1;

            let max = retry.max_delay.as_millis().max(1) as u64;
            let delay = rand::thread_rng().gen_range(0..max);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    async fn flush_steps(&mut self, conn: &mut dyn Connection, options: &FlushOptions, perfect: bool) -> Result<()> {
        if let Some(hook) = &options.after_begin {
            hook(&mut *conn).await?;
        }
        self.flush_database(conn, perfect).await?;
        if !options.replace_records_in.is_empty() {
            self.replace_records_in(conn, &options.replace_records_in).await?;
        }
        if let Some(hook) = &options.before_commit {
            hook(&mut *conn).await?;
        }
        Ok(())
    }

    /// Runs perfect passes until nothing is written, then relaxed passes until
    /// nothing is dirty.
    pub(crate) async fn flush_database(&mut self, conn: &mut dyn Connection, perfect: bool) -> Result<()> {
        let table_count = self.tables.len();

        if perfect {
            loop {
                let mut touched = 0;
                for table in 0..table_count {
                    touched += self.flush_table(conn, table, Perfection::Perfect).await?;
                }
                if touched == 0 {
                    break;
                }
            }
        }

        let mut waiting = 0;
        while self.dirty_count() > 0 {
            let mut touched = 0;
            for table in 0..table_count {
                touched += self.flush_table(conn, table, Perfection::Relaxed).await?;
            }
            if touched > 0 {
                waiting = 0;
                continue;
            }
            waiting += 1;
            if waiting > table_count {
                log::error!("circular references between dirty records: {}", self.dump_dirty_records());
                return Err(Error::CircularReferences);
            }
        }
        Ok(())
    }

    /// One pass over a table. Records that are still dirty when a statement
    /// fails get their pre-pass state back.
    pub(crate) async fn flush_table(&mut self, conn: &mut dyn Connection, model: ModelId, perfection: Perfection) -> Result<usize> {
        let snapshot: Vec<(RecordId, Record)> =
            self.tables[model].records.iter().map(|&id| (id, self.records[id.0].clone())).collect();

        match self.write_table(conn, model, perfection).await {
            Ok(touched) => Ok(touched),
            Err(e) => {
                for (id, mut record) in snapshot {
                    if self.records[id.0].is_dirty() {
                        record.state.selected = false;
                        self.records[id.0] = record;
                        self.merged.clear(id);
                    }
                }
                Err(e)
            }
        }
    }

    async fn write_table(&mut self, conn: &mut dyn Connection, model: ModelId, perfection: Perfection) -> Result<usize> {
        self.merge_records(model)?;
        let mut touched = self.adopt_existing_rows(conn, model, perfection).await?;
        touched += self.insert_records(conn, model, perfection).await?;
        touched += self.update_records(conn, model, perfection).await?;
        touched += self.delete_records(conn, model, perfection).await?;
        Ok(touched)
    }

    fn table_records(&self, model: ModelId) -> Vec<RecordId> {
        self.tables[model].records.iter().copied().filter(|&id| !self.merged.is_merged(id)).collect()
    }

    /// Folds records that now share a unique key into the first of them.
    fn merge_records(&mut self, model: ModelId) -> Result<()> {
        let keys = self.schema.model(model).unique_keys.len();
        let mut seen: Vec<std::collections::HashMap<String, RecordId>> = vec![Default::default(); keys];

        for id in self.table_records(model) {
            let mut target: Option<RecordId> = None;
            for (key, map) in seen.iter().enumerate() {
                let Some(value) = self.key_string(id, key) else { continue };
                if let Some(&other) = map.get(&value) {
                    match target {
                        Some(current) if current != other => return Err(Error::InconsistentUniqueKey),
                        _ => target = Some(other),
                    }
                }
            }

            let canonical = match target {
                Some(canonical) => {
                    let dirty: Vec<usize> = self.records[id.0].state.dirty.iter().copied().collect();
                    for field in dirty {
                        let value = self.records[id.0].data[field].clone();
                        let record = &mut self.records[canonical.0];
                        record.data[field] = value;
                        record.state.dirty.insert(field);
                    }
                    self.merged.union(id, canonical);
                    log::debug!("merged {} into {}", self.dump(id), self.dump(canonical));
                    canonical
                }
                None => id,
            };

            for (key, map) in seen.iter_mut().enumerate() {
                if let Some(value) = self.key_string(canonical, key) {
                    map.insert(value, canonical);
                }
            }
            self.map_put(canonical);
        }
        Ok(())
    }

    /// Reads the rows that already exist for new records and adopts their state.
    /// Returns the number of rows found.
    pub(crate) async fn adopt_existing_rows(&mut self, conn: &mut dyn Connection, model: ModelId, perfection: Perfection) -> Result<usize> {
        let schema = std::sync::Arc::clone(&self.schema);
        let m = schema.model(model);

        let mut filters = Vec::new();
        let mut fields: Vec<usize> = vec![m.key_field()];
        for id in self.table_records(model) {
            let record = &self.records[id.0];
            if !record.is_dirty()
                || record.state.selected
                || record.state.method == FlushMethod::Delete
                || !self.flushable(id, perfection)
            {
                continue;
            }
            let Some(filter) = self.filter(id) else { continue };
            for name in filter.keys() {
                if let Some(index) = m.field_index(name) {
                    fields.push(index);
                }
            }
            fields.extend(record.state.dirty.iter().copied());
            filters.push(serde_json::Value::Object(filter));
        }
        if filters.is_empty() {
            return Ok(0);
        }
        let mut unique_fields = Vec::new();
        for field in fields {
            if !unique_fields.contains(&field) {
                unique_fields.push(field);
            }
        }

        let mut builder = QueryBuilder::new(&schema);
        let select = builder.select(model, Projection::Fields(&unique_fields), &serde_json::Value::Array(filters), &[])?;
        let rows = conn.query(&Statement::Select(select)).await?;

        let mut found_rows = self.fork();
        for row in &rows {
            if let Some(doc) = to_document(&schema, model, row, builder.field_map())? {
                found_rows.append_to(model, Data::from(doc))?;
            }
        }

        for id in self.table_records(model) {
            let record = &self.records[id.0];
            if !record.is_dirty() || record.state.selected {
                continue;
            }
            let found = (0..m.unique_keys.len()).find_map(|key| {
                let value = self.key_string(id, key)?;
                found_rows.tables[model].record_map[key].get(&value).copied()
            });
            if let Some(existing) = found {
                let existing = found_rows.field_values(existing);
                self.update_state(id, &existing);
                self.map_put(id);
            }
        }
        Ok(rows.len())
    }

    /// One multi-row insert per set of written fields.
    async fn insert_records(&mut self, conn: &mut dyn Connection, model: ModelId, perfection: Perfection) -> Result<usize> {
        let schema = std::sync::Arc::clone(&self.schema);
        let m = schema.model(model);
        let ops = TableOps::new(&schema, model);

        let mut groups: IndexMap<Vec<usize>, Vec<(RecordId, Vec<Value>)>> = IndexMap::new();
        for id in self.table_records(model) {
            let record = &self.records[id.0];
            if record.state.method != FlushMethod::Insert
                || record.state.selected
                || !record.is_dirty()
                || !self.flushable(id, perfection)
            {
                continue;
            }
            let (fields, values): (Vec<usize>, Vec<Value>) = self.fields(id).into_iter().unzip();
            groups.entry(fields).or_default().push((id, values));
        }

        let mut touched = 0;
        for (fields, group) in groups {
            let rows = group.iter().map(|(_, values)| values.clone()).collect();
            let ids = ops.insert_batch(conn, &fields, rows).await?;
            log::debug!("{}: inserted {} rows", m.name, group.len());

            for (i, (id, _)) in group.iter().enumerate() {
                if m.is_auto_increment() && self.primary_key(*id).is_none() {
                    if let Some(key) = ids.get(i) {
                        self.set_primary_key(*id, key.clone());
                    }
                }
                let record = &mut self.records[id.0];
                for field in &fields {
                    record.state.dirty.remove(field);
                }
                record.state.method = FlushMethod::Update;
                record.state.selected = true;
                record.inserted = true;
                self.map_put(*id);
            }
            touched += group.len();
        }
        Ok(touched)
    }

    /// Writable dirty fields minus those the filter already pins to the same value.
    fn assignments(&self, model: ModelId, fields: Vec<(usize, Value)>, filter: &Document) -> Vec<(usize, Value)> {
        fields
            .into_iter()
            .filter(|(field, value)| self.schema.value_of(model, filter, *field).as_ref() != Some(value))
            .collect()
    }

    async fn update_records(&mut self, conn: &mut dyn Connection, model: ModelId, perfection: Perfection) -> Result<usize> {
        let schema = std::sync::Arc::clone(&self.schema);
        let ops = TableOps::new(&schema, model);
        let mut touched = 0;

        for id in self.table_records(model) {
            let record = &self.records[id.0];
            if record.state.method != FlushMethod::Update || !record.is_dirty() || !self.flushable(id, perfection) {
                continue;
            }
            let Some(filter) = self.filter(id) else { continue };
            let fields = self.fields(id);
            for (field, _) in &fields {
                self.records[id.0].state.dirty.remove(field);
            }
            let assignments = self.assignments(model, fields, &filter);
            if !assignments.is_empty() {
                let condition = QueryBuilder::new(&schema).where_clause(model, &serde_json::Value::Object(filter))?;
                ops.update_fields(conn, &assignments, condition).await?;
            }
            touched += 1;
        }
        Ok(touched)
    }

    async fn delete_records(&mut self, conn: &mut dyn Connection, model: ModelId, perfection: Perfection) -> Result<usize> {
        let schema = std::sync::Arc::clone(&self.schema);
        let ops = TableOps::new(&schema, model);
        let mut touched = 0;

        for id in self.table_records(model) {
            let record = &self.records[id.0];
            if record.state.method != FlushMethod::Delete || record.state.deleted || !self.flushable(id, perfection) {
                continue;
            }
            let Some(filter) = self.filter(id) else { continue };
            ops.delete(conn, &serde_json::Value::Object(filter)).await?;
            let record = &mut self.records[id.0];
            record.state.deleted = true;
            record.state.dirty.clear();
            touched += 1;
        }
        Ok(touched)
    }

    // ========================================================================
    // Single Record Path
    // ========================================================================

    /// Writes one record and, first, the records it depends on.
    ///
    /// On failure every record gets back the state it had before the call.
    pub async fn save(&mut self, id: RecordId) -> Result<()> {
        let mut conn = self.pool.get_connection().await?;
        let snapshot = self.snapshot();
        let mut tx = Transaction::begin(&mut *conn).await?;
        let result = self.flush_record(tx.connection(), id).await;
        let result = tx.finish(result).await;
        if result.is_err() {
            self.restore(snapshot);
        }
        result
    }

    /// Assigns `data` to a record and writes it as an update.
    pub async fn update_record(&mut self, id: RecordId, data: impl Into<Data>) -> Result<()> {
        let id = self.resolve(id);
        for (name, input) in data.into().0 {
            self.set(id, &name, input)?;
        }
        self.record_mut(id).state.method = FlushMethod::Update;
        self.save(id).await
    }

    /// Deletes a record's row now, by its unique fields.
    pub async fn delete_record(&mut self, id: RecordId) -> Result<()> {
        let id = self.resolve(id);
        let model = self.records[id.0].table;
        let filter = self.filter(id).ok_or_else(|| Error::BadFilter(self.plainify(id).to_string()))?;
        let mut conn = self.pool.get_connection().await?;
        TableOps::new(&self.schema, model).delete(&mut *conn, &serde_json::Value::Object(filter)).await?;
        let record = self.record_mut(id);
        record.state.method = FlushMethod::Delete;
        record.state.deleted = true;
        record.state.dirty.clear();
        Ok(())
    }

    fn collect_parents(&self, id: RecordId, perfection: Perfection, seen: &mut HashSet<RecordId>, out: &mut Vec<RecordId>) {
        let references: Vec<RecordId> = self
            .record(id)
            .data
            .iter()
            .filter_map(|value| match value {
                Some(FieldValue::Record(r)) => Some(self.resolve(*r)),
                _ => None,
            })
            .collect();

        for parent in references {
            if !seen.insert(parent) || !self.records[parent.0].is_dirty() {
                continue;
            }
            if self.flushable(parent, perfection) {
                out.push(parent);
            } else {
                self.collect_parents(parent, perfection, seen, out);
            }
        }
    }

    fn parents(&self, id: RecordId, perfection: Perfection) -> Vec<RecordId> {
        let mut seen = HashSet::from([id]);
        let mut out = Vec::new();
        self.collect_parents(id, perfection, &mut seen, &mut out);
        out
    }

    pub(crate) async fn flush_record(&mut self, conn: &mut dyn Connection, id: RecordId) -> Result<()> {
        let id = self.resolve(id);
        while self.records[id.0].is_dirty() {
            let mut parents = self.parents(id, Perfection::Perfect);
            if parents.is_empty() {
                if self.flushable(id, Perfection::Relaxed) {
                    self.persist(conn, id).await?;
                    continue;
                }
                parents = self.parents(id, Perfection::Relaxed);
                if parents.is_empty() {
                    log::error!("cannot save record: {}", self.dump(id));
                    return Err(Error::RecordLoop);
                }
            }
            for parent in parents {
                self.persist(conn, parent).await?;
            }
        }
        Ok(())
    }

    /// Writes one record. An insert that hits an existing row turns into an
    /// update of that row.
    async fn persist(&mut self, conn: &mut dyn Connection, id: RecordId) -> Result<()> {
        match self.records[id.0].state.method {
            FlushMethod::Insert => self.persist_insert(conn, id).await,
            FlushMethod::Update => self.persist_update(conn, id).await,
            FlushMethod::Delete => {
                let model = self.records[id.0].table;
                let filter = self.filter(id).ok_or(Error::RowNotFound)?;
                TableOps::new(&self.schema, model).delete(conn, &serde_json::Value::Object(filter)).await?;
                let record = &mut self.records[id.0];
                record.state.deleted = true;
                record.state.dirty.clear();
                Ok(())
            }
        }
    }

    async fn persist_insert(&mut self, conn: &mut dyn Connection, id: RecordId) -> Result<()> {
        let schema = std::sync::Arc::clone(&self.schema);
        let model = self.records[id.0].table;
        let m = schema.model(model);
        let ops = TableOps::new(&schema, model);
        let (fields, values): (Vec<usize>, Vec<Value>) = self.fields(id).into_iter().unzip();

        conn.savepoint(SAVEPOINT).await?;
        match ops.insert_batch(conn, &fields, vec![values]).await {
            Ok(ids) => {
                conn.release_savepoint(SAVEPOINT).await?;
                if m.is_auto_increment() && self.primary_key(id).is_none() {
                    if let Some(key) = ids.into_iter().next() {
                        self.set_primary_key(id, key);
                    }
                }
                let record = &mut self.records[id.0];
                for field in &fields {
                    record.state.dirty.remove(field);
                }
                record.state.method = FlushMethod::Update;
                record.state.selected = true;
                record.inserted = true;
                self.map_put(id);
                Ok(())
            }
            Err(e) if e.is_integrity() => {
                conn.rollback_to_savepoint(SAVEPOINT).await?;
                conn.release_savepoint(SAVEPOINT).await?;
                log::debug!("{}: row exists, updating instead: {}", m.name, e);

                if fields == [m.key_field()] {
                    self.records[id.0].state.dirty.remove(&m.key_field());
                    return Ok(());
                }
                let Some(filter) = self.filter(id) else { return Err(e) };
                let rows = ops
                    .query_documents(conn, Projection::All, &crate::table::SelectOptions::new().filter(serde_json::Value::Object(filter)))
                    .await?;
                let Some(row) = rows.first() else { return Err(e) };

                let existing: Vec<Option<Value>> = (0..m.fields.len())
                    .map(|field| match &m.fields[field] {
                        Field::Related(_) => None,
                        _ => schema.value_of(model, row, field),
                    })
                    .collect();
                self.update_state(id, &existing);
                self.map_put(id);
                self.persist_update(conn, id).await
            }
            Err(e) => {
                conn.rollback_to_savepoint(SAVEPOINT).await?;
                conn.release_savepoint(SAVEPOINT).await?;
                Err(e)
            }
        }
    }

    async fn persist_update(&mut self, conn: &mut dyn Connection, id: RecordId) -> Result<()> {
        let schema = std::sync::Arc::clone(&self.schema);
        let model = self.records[id.0].table;
        let filter = self.filter(id).ok_or(Error::RowNotFound)?;
        let fields = self.fields(id);
        for (field, _) in &fields {
            self.records[id.0].state.dirty.remove(field);
        }
        let assignments = self.assignments(model, fields, &filter);
        if assignments.is_empty() {
            return Ok(());
        }
        let condition = QueryBuilder::new(&schema).where_clause(model, &serde_json::Value::Object(filter))?;
        let affected = TableOps::new(&schema, model).update_fields(conn, &assignments, condition).await?;
        if affected == 0 {
            return Err(Error::RowNotFound);
        }
        Ok(())
    }

    // ========================================================================
    // Replacing Child Rows
    // ========================================================================

    /// Deletes the children of existing (not newly inserted) records along a
    /// table chain, keeping only the children this database holds.
    ///
    /// The first name is the root. From each table the walk follows the
    /// tables referencing it, as long as they are named in the rest of the
    /// chain, whatever their order there.
    pub(crate) async fn replace_records_in(&mut self, conn: &mut dyn Connection, names: &[String]) -> Result<()> {
        let Some((first, rest)) = names.split_first() else { return Ok(()) };
        let root = self.model_id(first)?;
        let chain = rest.iter().map(|name| self.model_id(name)).collect::<Result<Vec<_>>>()?;

        let keys = self.existing_keys(root);
        if keys.is_empty() {
            return Ok(());
        }
        let mut path = vec![root];
        self.delete_unheld_children(conn, root, keys, &chain, &mut path).await
    }

    /// Primary keys of the table's records that were already in the database.
    fn existing_keys(&self, model: ModelId) -> Vec<serde_json::Value> {
        self.table_records(model)
            .into_iter()
            .filter(|&id| !self.records[id.0].inserted)
            .filter_map(|id| self.primary_key(id))
            .filter(|key| !key.is_null())
            .map(|key| key.to_json())
            .collect()
    }

    fn delete_unheld_children<'a>(
        &'a mut self,
        conn: &'a mut dyn Connection,
        parent: ModelId,
        keys: Vec<serde_json::Value>,
        chain: &'a [ModelId],
        path: &'a mut Vec<ModelId>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let schema = std::sync::Arc::clone(&self.schema);

            for m in &schema.models {
                // path guards against reference cycles inside the chain
                if !chain.contains(&m.id) || path.contains(&m.id) {
                    continue;
                }
                let held: Vec<serde_json::Value> = self
                    .table_records(m.id)
                    .into_iter()
                    .filter_map(|id| self.primary_key(id))
                    .filter(|key| !key.is_null())
                    .map(|key| key.to_json())
                    .collect();

                let mut referencing = false;
                for field in &m.fields {
                    let Field::ForeignKey(fk) = field else { continue };
                    if fk.referenced.model != parent {
                        continue;
                    }
                    referencing = true;
                    let mut filter = Document::new();
                    filter.insert(fk.simple.name.clone(), serde_json::Value::Array(keys.clone()));
                    if !held.is_empty() {
                        let mut own = Document::new();
                        own.insert(m.key_name().to_string(), serde_json::Value::Array(held.clone()));
                        filter.insert("not".into(), serde_json::Value::Object(own));
                    }
                    let removed = TableOps::new(&schema, m.id).delete(conn, &serde_json::Value::Object(filter)).await?;
                    log::debug!("{}: removed {} replaced rows", m.name, removed);
                }
                if !referencing {
                    continue;
                }

                let child_keys = self.existing_keys(m.id);
                if child_keys.is_empty() {
                    continue;
                }
                path.push(m.id);
                let result = self.delete_unheld_children(conn, m.id, child_keys, chain, path).await;
                path.pop();
                result?;
            }
            Ok(())
        })
    }
}

/// The column-backed part of a document as record input.
pub(crate) fn column_data(db: &Database, model: ModelId, doc: &Document) -> Result<Data> {
    let m = db.schema.model(model);
    let mut data = Data::new();
    for (name, value) in doc {
        match m.field(name) {
            None => return Err(Error::unknown_field(&m.name, name)),
            Some(Field::Related(_)) => {}
            Some(_) => data.0.push((name.clone(), Input::Json(value.clone()))),
        }
    }
    Ok(data)
}
