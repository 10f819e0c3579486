//! Entity store contract and the SQLite-backed implementation.

use crate::ast::{Clause, FilterOp, FilterTerm, Literal, RawQuery, SimpleFilter};
use crate::error::StoreError;
use crate::schema::{EntitySchema, FieldDescriptor, FieldType};
use crate::sql_compiler::{literal_to_value, SqlCompiler};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// One stored record as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub id: i64,
    pub display_name: String,
    pub values: BTreeMap<String, Literal>,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&Literal> {
        self.values.get(field)
    }

    /// Identifier referenced by a linking field; empty and absent links yield `None`.
    pub fn link_target(&self, field: &str) -> Option<i64> {
        match self.values.get(field) {
            Some(Literal::Integer(id)) if *id > 0 => Some(*id),
            _ => None,
        }
    }
}

/// Everything the pipeline needs from the underlying data layer. The pipeline never writes.
pub trait EntityStore: Send + Sync {
    fn schema(&self, entity_type: &str) -> Option<&EntitySchema>;

    fn entity_types(&self) -> Vec<String>;

    fn has_entity(&self, entity_type: &str) -> bool {
        self.schema(entity_type).is_some()
    }

    fn fields_of(&self, entity_type: &str) -> Result<Vec<FieldDescriptor>, StoreError> {
        self.schema(entity_type)
            .map(|schema| schema.fields.clone())
            .ok_or_else(|| StoreError::UnknownEntity(entity_type.to_string()))
    }

    fn table_of(&self, entity_type: &str) -> Result<String, StoreError> {
        self.schema(entity_type)
            .map(|schema| schema.table.clone())
            .ok_or_else(|| StoreError::UnknownEntity(entity_type.to_string()))
    }

    fn search(&self, entity_type: &str, filter: &SimpleFilter) -> Result<Vec<Record>, StoreError>;

    /// Run a validated read-only statement and return the `id` column of at most `row_limit` rows.
    fn execute_read_only(&self, query: &RawQuery, row_limit: usize) -> Result<Vec<i64>, StoreError>;

    /// Fetch records by identifier, in batches of `batch_size`.
    fn fetch_by_ids(
        &self,
        entity_type: &str,
        ids: &[i64],
        batch_size: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let mut records = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(batch_size.max(1)) {
            let list = chunk.iter().map(|id| Literal::Integer(*id)).collect();
            let filter = SimpleFilter::new(vec![FilterTerm::Clause(Clause::new(
                "id",
                FilterOp::In,
                Literal::List(list),
            ))]);
            records.extend(self.search(entity_type, &filter)?);
        }
        Ok(records)
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    schemas: Vec<EntitySchema>,
    compiler: SqlCompiler,
}

impl SqliteStore {
    pub fn open_in_memory(schemas: Vec<EntitySchema>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, schemas)
    }

    pub fn open<P: AsRef<Path>>(path: P, schemas: Vec<EntitySchema>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?, schemas)
    }

    fn with_connection(conn: Connection, schemas: Vec<EntitySchema>) -> Result<Self, StoreError> {
        let mut compiler = SqlCompiler::new();
        compiler.set_schemas(&schemas);
        let store = Self {
            conn: Mutex::new(conn),
            schemas,
            compiler,
        };
        store.create_tables()?;
        Ok(store)
    }

    /// `CREATE TABLE IF NOT EXISTS` for every schema; computed fields get no column.
    fn create_tables(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        for schema in &self.schemas {
            let columns: Vec<String> = schema
                .fields
                .iter()
                .filter(|f| f.persisted && f.name != "id")
                .map(|f| format!("\"{}\" {}", f.name, column_affinity(f.field_type)))
                .collect();
            let mut ddl = format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (\"id\" INTEGER PRIMARY KEY",
                schema.table
            );
            for column in columns {
                ddl.push_str(", ");
                ddl.push_str(&column);
            }
            ddl.push(')');
            conn.execute(&ddl, [])?;
        }
        Ok(())
    }

    /// Insert one record and return its identifier.
    pub fn insert(&self, entity_type: &str, values: &[(&str, Literal)]) -> Result<i64, StoreError> {
        let schema = self
            .schema(entity_type)
            .ok_or_else(|| StoreError::UnknownEntity(entity_type.to_string()))?;
        let columns: Vec<String> = values.iter().map(|(name, _)| format!("\"{}\"", name)).collect();
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            schema.table,
            columns.join(", "),
            placeholders
        );
        let params = values
            .iter()
            .map(|(_, value)| to_sql_value(value))
            .collect::<Result<Vec<_>, _>>()?;

        let conn = self.conn.lock();
        conn.execute(&sql, params_from_iter(params))?;
        Ok(conn.last_insert_rowid())
    }

    fn read_records(
        &self,
        schema: &EntitySchema,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = stmt.query(params_from_iter(params))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = BTreeMap::new();
            for (index, name) in names.iter().enumerate() {
                let field_type = schema
                    .fields
                    .iter()
                    .find(|f| &f.name == name)
                    .map(|f| f.field_type);
                values.insert(name.clone(), from_sql_value(row.get_ref(index)?, field_type));
            }
            let id = values.get("id").and_then(Literal::as_i64).unwrap_or_default();
            let display_name = match values.get(&schema.display_field) {
                Some(Literal::String(name)) if !name.is_empty() => name.clone(),
                _ => format!("{} #{}", schema.entity_type, id),
            };
            records.push(Record {
                id,
                display_name,
                values,
            });
        }
        Ok(records)
    }
}

impl EntityStore for SqliteStore {
    fn schema(&self, entity_type: &str) -> Option<&EntitySchema> {
        self.schemas.iter().find(|s| s.entity_type == entity_type)
    }

    fn entity_types(&self) -> Vec<String> {
        self.schemas.iter().map(|s| s.entity_type.clone()).collect()
    }

    fn search(&self, entity_type: &str, filter: &SimpleFilter) -> Result<Vec<Record>, StoreError> {
        let schema = self
            .schema(entity_type)
            .ok_or_else(|| StoreError::UnknownEntity(entity_type.to_string()))?;
        let expr = filter
            .to_expr()
            .map_err(|e| StoreError::Compile(e.to_string()))?;
        let compiled = self
            .compiler
            .compile(entity_type, &expr, None)
            .map_err(|e| StoreError::Compile(e.message))?;
        if !compiled.optimizations.is_empty() {
            debug!(optimizations = ?compiled.optimizations, "filter optimized");
        }
        debug!(sql = %compiled.sql, "running search");

        let params = compiled
            .values
            .0
            .into_iter()
            .map(sea_to_sql_value)
            .collect::<Result<Vec<_>, _>>()?;
        self.read_records(schema, &compiled.sql, params)
    }

    fn execute_read_only(&self, query: &RawQuery, row_limit: usize) -> Result<Vec<i64>, StoreError> {
        let params = query
            .params
            .iter()
            .map(to_sql_value)
            .collect::<Result<Vec<_>, _>>()?;

        let conn = self.conn.lock();
        conn.pragma_update(None, "query_only", true)?;
        let result = run_read_only(&conn, &query.sql, params, row_limit);
        conn.pragma_update(None, "query_only", false)?;
        result
    }
}

fn run_read_only(
    conn: &Connection,
    sql: &str,
    params: Vec<SqlValue>,
    row_limit: usize,
) -> Result<Vec<i64>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    if !stmt.readonly() {
        return Err(StoreError::NotReadOnly);
    }
    let id_index = stmt
        .column_names()
        .iter()
        .position(|name| name.eq_ignore_ascii_case("id"))
        .unwrap_or(0);

    let mut rows = stmt.query(params_from_iter(params))?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        if ids.len() >= row_limit {
            break;
        }
        if let ValueRef::Integer(id) = row.get_ref(id_index)? {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn column_affinity(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Integer | FieldType::Boolean | FieldType::Many2one => "INTEGER",
        FieldType::Float | FieldType::Monetary => "REAL",
        _ => "TEXT",
    }
}

fn to_sql_value(literal: &Literal) -> Result<SqlValue, StoreError> {
    match literal {
        Literal::Null => Ok(SqlValue::Null),
        other => sea_to_sql_value(
            literal_to_value(other).map_err(|e| StoreError::Conversion(e.message))?,
        ),
    }
}

fn sea_to_sql_value(value: sea_query::Value) -> Result<SqlValue, StoreError> {
    use sea_query::Value;
    let converted = match value {
        Value::Bool(Some(b)) => SqlValue::Integer(i64::from(b)),
        Value::TinyInt(Some(n)) => SqlValue::Integer(i64::from(n)),
        Value::SmallInt(Some(n)) => SqlValue::Integer(i64::from(n)),
        Value::Int(Some(n)) => SqlValue::Integer(i64::from(n)),
        Value::BigInt(Some(n)) => SqlValue::Integer(n),
        Value::Float(Some(x)) => SqlValue::Real(f64::from(x)),
        Value::Double(Some(x)) => SqlValue::Real(x),
        Value::String(Some(s)) => SqlValue::Text(s.to_string()),
        Value::Bool(None)
        | Value::TinyInt(None)
        | Value::SmallInt(None)
        | Value::Int(None)
        | Value::BigInt(None)
        | Value::Float(None)
        | Value::Double(None)
        | Value::String(None) => SqlValue::Null,
        other => return Err(StoreError::Conversion(format!("{:?}", other))),
    };
    Ok(converted)
}

fn from_sql_value(value: ValueRef<'_>, field_type: Option<FieldType>) -> Literal {
    match value {
        ValueRef::Null => Literal::Null,
        ValueRef::Integer(n) if field_type == Some(FieldType::Boolean) => Literal::Bool(n != 0),
        ValueRef::Integer(n) => Literal::Integer(n),
        ValueRef::Real(x) => Literal::Float(x),
        ValueRef::Text(bytes) => Literal::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(_) => Literal::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory(vec![EntitySchema::new("contact", "contacts")
            .field(FieldDescriptor::new("name", FieldType::Char, "Name"))
            .field(FieldDescriptor::new("active", FieldType::Boolean, "Active"))
            .field(FieldDescriptor::new("score", FieldType::Float, "Score").computed())])
        .unwrap();
        for (name, active) in [("Ada", true), ("Bob", false), ("", true)] {
            store
                .insert(
                    "contact",
                    &[("name", Literal::String(name.into())), ("active", Literal::Bool(active))],
                )
                .unwrap();
        }
        store
    }

    fn active_filter(active: bool) -> SimpleFilter {
        SimpleFilter::new(vec![FilterTerm::Clause(Clause::new(
            "active",
            FilterOp::Eq,
            Literal::Bool(active),
        ))])
    }

    #[test]
    fn test_search_returns_typed_values() {
        let store = contact_store();
        let records = store.search("contact", &active_filter(true)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].display_name, "Ada");
        assert_eq!(records[0].get("active"), Some(&Literal::Bool(true)));
        // empty display field falls back to the entity label
        assert_eq!(records[1].display_name, "contact #3");
    }

    #[test]
    fn test_computed_field_has_no_column() {
        let store = contact_store();
        let records = store.search("contact", &SimpleFilter::match_all()).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[0].get("score").is_none());
    }

    #[test]
    fn test_fetch_by_ids_batches() {
        let store = contact_store();
        let records = store.fetch_by_ids("contact", &[1, 2, 3], 2).unwrap();
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(store.fetch_by_ids("contact", &[], 2).unwrap().is_empty());
    }

    #[test]
    fn test_read_only_execution() {
        let store = contact_store();
        let query = RawQuery {
            entity_type: "contact".into(),
            table: "contacts".into(),
            sql: "SELECT id FROM contacts WHERE active = ? ORDER BY id DESC;".into(),
            params: vec![Literal::Bool(true)],
        };
        assert_eq!(store.execute_read_only(&query, 1000).unwrap(), vec![3, 1]);
        assert_eq!(store.execute_read_only(&query, 1).unwrap(), vec![3]);
    }

    #[test]
    fn test_writes_are_refused() {
        let store = contact_store();
        let query = RawQuery {
            entity_type: "contact".into(),
            table: "contacts".into(),
            sql: "DELETE FROM contacts".into(),
            params: vec![],
        };
        assert!(store.execute_read_only(&query, 10).is_err());
        assert_eq!(store.search("contact", &SimpleFilter::match_all()).unwrap().len(), 3);
    }

    fn city_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory(vec![EntitySchema::new("contact", "contacts")
            .field(FieldDescriptor::new("name", FieldType::Char, "Name"))
            .field(FieldDescriptor::new("city", FieldType::Char, "City"))])
        .unwrap();
        for (name, city) in [
            ("100% cotton", Literal::String("Rome".into())),
            ("1000 units", Literal::Null),
            ("a_b", Literal::String("Milan".into())),
            ("axb", Literal::Null),
        ] {
            store
                .insert("contact", &[("name", Literal::String(name.into())), ("city", city)])
                .unwrap();
        }
        store
    }

    fn names(store: &SqliteStore, field: &str, op: FilterOp, value: Literal) -> Vec<String> {
        let filter = SimpleFilter::new(vec![FilterTerm::Clause(Clause::new(field, op, value))]);
        store
            .search("contact", &filter)
            .unwrap()
            .into_iter()
            .map(|r| r.display_name)
            .collect()
    }

    #[test]
    fn test_icontains_treats_wildcards_literally() {
        let store = city_store();
        assert_eq!(
            names(&store, "name", FilterOp::IContains, Literal::String("100%".into())),
            vec!["100% cotton"]
        );
        assert_eq!(
            names(&store, "name", FilterOp::IContains, Literal::String("A_B".into())),
            vec!["a_b"]
        );
    }

    #[test]
    fn test_negative_operators_match_null_columns() {
        let store = city_store();
        let rome = || Literal::String("Rome".into());
        assert_eq!(
            names(&store, "city", FilterOp::NotEq, rome()),
            vec!["1000 units", "a_b", "axb"]
        );
        assert_eq!(
            names(&store, "city", FilterOp::NotIn, Literal::List(vec![rome()])),
            vec!["1000 units", "a_b", "axb"]
        );

        let not_rome = SimpleFilter::new(vec![
            FilterTerm::Not,
            FilterTerm::Clause(Clause::new("city", FilterOp::Eq, rome())),
        ]);
        assert_eq!(store.search("contact", &not_rome).unwrap().len(), 3);
    }

    #[test]
    fn test_unknown_entity() {
        let store = contact_store();
        assert!(matches!(
            store.search("ghost", &SimpleFilter::match_all()),
            Err(StoreError::UnknownEntity(_))
        ));
        assert!(!store.has_entity("ghost"));
        assert_eq!(store.table_of("contact").unwrap(), "contacts");
    }
}
