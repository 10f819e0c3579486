//! SQL compiler that converts a validated filter tree to a parameterised SQLite query using sea-query.

use crate::ast::{Clause, FilterExpr, FilterOp, Literal};
use crate::schema::EntitySchema;
use sea_query::{Expr, Func, Iden, Order, Query, SelectStatement, SimpleExpr, SqliteQueryBuilder, Value, Values};
use std::collections::HashMap;
use std::fmt;

/// Configuration for SQL optimization
#[derive(Debug, Clone)]
pub struct OptimizationConfig {
    /// Minimum number of OR'ed equalities on one field before converting to an IN clause
    pub max_or_conditions_for_in: usize,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            max_or_conditions_for_in: 3,
        }
    }
}

/// Table identifier wrapper
#[derive(Debug, Clone)]
pub struct TableName(pub String);

impl Iden for TableName {
    fn unquoted(&self, s: &mut dyn fmt::Write) {
        let _ = write!(s, "{}", self.0);
    }
}

/// Column identifier wrapper
#[derive(Debug, Clone)]
pub struct ColumnName(pub String);

impl Iden for ColumnName {
    fn unquoted(&self, s: &mut dyn fmt::Write) {
        let _ = write!(s, "{}", self.0);
    }
}

/// SQL Compiler that converts filter trees to SQL queries
pub struct SqlCompiler {
    config: OptimizationConfig,
    /// Maps entity types to table names for schema resolution
    table_mapping: HashMap<String, String>,
    /// (entity type, link field) -> target entity type
    relations: HashMap<(String, String), String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub message: String,
}

impl CompileError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CompileError {}

/// Represents an optimization applied during compilation
#[derive(Debug, Clone, PartialEq)]
pub enum Optimization {
    OrToIn { field: String, value_count: usize },
}

/// Result of SQL compilation with optimization information
#[derive(Debug)]
pub struct CompileResult {
    pub sql: String,
    pub values: Values,
    pub optimizations: Vec<Optimization>,
}

impl Default for SqlCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlCompiler {
    pub fn new() -> Self {
        Self::with_config(OptimizationConfig::default())
    }

    pub fn with_config(config: OptimizationConfig) -> Self {
        Self {
            config,
            table_mapping: HashMap::new(),
            relations: HashMap::new(),
        }
    }

    /// Register tables and link fields for every entity type.
    pub fn set_schemas(&mut self, schemas: &[EntitySchema]) {
        self.table_mapping.clear();
        self.relations.clear();
        for schema in schemas {
            self.table_mapping
                .insert(schema.entity_type.clone(), schema.table.clone());
            for field in &schema.fields {
                if let Some(target) = &field.relation {
                    self.relations.insert(
                        (schema.entity_type.clone(), field.name.clone()),
                        target.clone(),
                    );
                }
            }
        }
    }

    /// Get the actual table name for an entity
    fn get_table_name(&self, entity: &str) -> Result<String, CompileError> {
        self.table_mapping
            .get(entity)
            .cloned()
            .ok_or_else(|| CompileError::new(format!("no table registered for entity '{}'", entity)))
    }

    /// Compile a filter tree into `SELECT * FROM <table> WHERE ... ORDER BY id`
    pub fn compile(
        &self,
        entity: &str,
        filter: &FilterExpr,
        limit: Option<u64>,
    ) -> Result<CompileResult, CompileError> {
        let mut optimizations = Vec::new();
        let mut select = Query::select();
        select
            .from(TableName(self.get_table_name(entity)?))
            .column(sea_query::Asterisk);

        if *filter != FilterExpr::All {
            let condition = self.compile_expr(entity, filter, &mut optimizations)?;
            select.and_where(condition);
        }

        select.order_by(ColumnName("id".to_string()), Order::Asc);
        if let Some(limit) = limit {
            select.limit(limit);
        }

        let (sql, values) = select.build(SqliteQueryBuilder);
        Ok(CompileResult {
            sql,
            values,
            optimizations,
        })
    }

    fn compile_expr(
        &self,
        entity: &str,
        expr: &FilterExpr,
        optimizations: &mut Vec<Optimization>,
    ) -> Result<SimpleExpr, CompileError> {
        let compiled = match expr {
            FilterExpr::All => Expr::val(true).into(),
            FilterExpr::Clause(clause) => self.compile_clause(entity, clause, false, optimizations)?,
            FilterExpr::And(left, right) => {
                let left = self.compile_expr(entity, left, optimizations)?;
                let right = self.compile_expr(entity, right, optimizations)?;
                left.and(right)
            }
            FilterExpr::Or(left, right) => {
                // Check for OR optimization opportunities
                if let Some((in_expr, opt)) = self.try_optimize_or_to_in(expr)? {
                    optimizations.push(opt);
                    in_expr
                } else {
                    let left = self.compile_expr(entity, left, optimizations)?;
                    let right = self.compile_expr(entity, right, optimizations)?;
                    left.or(right)
                }
            }
            FilterExpr::Not(inner) => self.compile_negated(entity, inner, optimizations)?,
        };
        Ok(compiled)
    }

    /// `!` is pushed down to the leaves, so a negated comparison still matches rows where the column is NULL.
    fn compile_negated(
        &self,
        entity: &str,
        expr: &FilterExpr,
        optimizations: &mut Vec<Optimization>,
    ) -> Result<SimpleExpr, CompileError> {
        let compiled = match expr {
            FilterExpr::All => Expr::val(false).into(),
            FilterExpr::Clause(clause) => self.compile_clause(entity, clause, true, optimizations)?,
            FilterExpr::And(left, right) => {
                let left = self.compile_negated(entity, left, optimizations)?;
                let right = self.compile_negated(entity, right, optimizations)?;
                left.or(right)
            }
            FilterExpr::Or(left, right) => {
                let left = self.compile_negated(entity, left, optimizations)?;
                let right = self.compile_negated(entity, right, optimizations)?;
                left.and(right)
            }
            FilterExpr::Not(inner) => self.compile_expr(entity, inner, optimizations)?,
        };
        Ok(compiled)
    }

    /// A `link.field` path becomes `link IN (SELECT id FROM target WHERE field ...)`;
    /// negated, `link NOT IN (...) OR link IS NULL`.
    fn compile_clause(
        &self,
        entity: &str,
        clause: &Clause,
        negated: bool,
        optimizations: &mut Vec<Optimization>,
    ) -> Result<SimpleExpr, CompileError> {
        let Some(tail) = clause.relation_tail() else {
            return self.compile_comparison(&clause.field, clause.op, &clause.value, negated);
        };

        let link = clause.base_field();
        let target = self
            .relations
            .get(&(entity.to_string(), link.to_string()))
            .ok_or_else(|| {
                CompileError::new(format!("field '{}' on '{}' is not a link", link, entity))
            })?;

        let inner = Clause::new(tail, clause.op, clause.value.clone());
        let condition = self.compile_clause(target, &inner, false, optimizations)?;
        let mut subquery = SelectStatement::new();
        subquery
            .column(ColumnName("id".to_string()))
            .from(TableName(self.get_table_name(target)?))
            .and_where(condition);

        let link_col = || Expr::col(ColumnName(link.to_string()));
        if negated {
            Ok(link_col().not_in_subquery(subquery).or(link_col().is_null()))
        } else {
            Ok(link_col().in_subquery(subquery))
        }
    }

    /// Try to optimize OR'ed equalities on one field to an IN clause
    fn try_optimize_or_to_in(
        &self,
        expr: &FilterExpr,
    ) -> Result<Option<(SimpleExpr, Optimization)>, CompileError> {
        let mut field = None;
        let mut values = Vec::new();
        if !collect_equality_values(expr, &mut field, &mut values) {
            return Ok(None);
        }
        let Some(field) = field else {
            return Ok(None);
        };
        if values.len() < self.config.max_or_conditions_for_in {
            return Ok(None);
        }

        let in_values = values
            .iter()
            .map(|v| literal_to_value(v))
            .collect::<Result<Vec<_>, _>>()?;
        let in_expr = Expr::col(ColumnName(field.to_string())).is_in(in_values);
        let optimization = Optimization::OrToIn {
            field: field.to_string(),
            value_count: values.len(),
        };
        Ok(Some((in_expr, optimization)))
    }

    /// Compile a single comparison on a local column.
    /// `!=` and `not_in` also match NULL, so "not Rome" keeps rows without a city.
    fn compile_comparison(
        &self,
        field: &str,
        op: FilterOp,
        value: &Literal,
        negated: bool,
    ) -> Result<SimpleExpr, CompileError> {
        let col = || Expr::col(ColumnName(field.to_string()));
        let (op, negated) = match op.negated().filter(|_| negated) {
            Some(flipped) => (flipped, false),
            None => (op, negated),
        };

        let expr = match (op, value) {
            (FilterOp::Eq, Literal::Null) => col().is_null(),
            (FilterOp::NotEq, Literal::Null) => col().is_not_null(),
            (_, Literal::Null) => {
                return Err(CompileError::new(format!(
                    "operator '{}' cannot compare '{}' with None",
                    op.as_str(),
                    field
                )))
            }
            (FilterOp::In, Literal::List(items)) => col().is_in(list_values(items)?),
            (FilterOp::NotIn, Literal::List(items)) => {
                col().is_not_in(list_values(items)?).or(col().is_null())
            }
            (FilterOp::In | FilterOp::NotIn, _) => {
                return Err(CompileError::new(format!(
                    "operator '{}' on '{}' requires a list",
                    op.as_str(),
                    field
                )))
            }
            (FilterOp::Contains, Literal::String(s)) => {
                let position = Func::cust(ColumnName("instr".to_string()))
                    .arg(col())
                    .arg(Expr::val(s.clone()));
                Expr::expr(position).gt(0)
            }
            // instr rather than LIKE: '%' and '_' in the value stay literal
            (FilterOp::IContains, Literal::String(s)) => {
                let position = Func::cust(ColumnName("instr".to_string()))
                    .arg(Func::lower(col()))
                    .arg(Expr::val(s.to_lowercase()));
                Expr::expr(position).gt(0)
            }
            (FilterOp::Contains | FilterOp::IContains, _) => {
                return Err(CompileError::new(format!(
                    "operator '{}' on '{}' requires a string",
                    op.as_str(),
                    field
                )))
            }
            (op, value) => {
                let val = literal_to_value(value)?;
                match op {
                    FilterOp::Eq => col().eq(val),
                    FilterOp::NotEq => col().ne(val).or(col().is_null()),
                    FilterOp::Gt => col().gt(val),
                    FilterOp::Lt => col().lt(val),
                    FilterOp::Gte => col().gte(val),
                    _ => col().lte(val),
                }
            }
        };

        if negated {
            Ok(expr.not().or(col().is_null()))
        } else {
            Ok(expr)
        }
    }
}

/// Recursively collect equality values from OR'ed clauses on the same local field.
/// Returns false as soon as anything breaks the pattern.
fn collect_equality_values<'a>(
    expr: &'a FilterExpr,
    field: &mut Option<&'a str>,
    values: &mut Vec<&'a Literal>,
) -> bool {
    match expr {
        FilterExpr::Clause(clause)
            if clause.op == FilterOp::Eq
                && clause.relation_tail().is_none()
                && !matches!(clause.value, Literal::Null | Literal::List(_)) =>
        {
            match field {
                Some(existing) if *existing != clause.field => false,
                _ => {
                    *field = Some(&clause.field);
                    values.push(&clause.value);
                    true
                }
            }
        }
        FilterExpr::Or(left, right) => {
            collect_equality_values(left, field, values) && collect_equality_values(right, field, values)
        }
        _ => false,
    }
}

fn list_values(items: &[Literal]) -> Result<Vec<Value>, CompileError> {
    items.iter().map(literal_to_value).collect()
}

/// Convert an AST Literal to a sea-query Value
pub fn literal_to_value(literal: &Literal) -> Result<Value, CompileError> {
    match literal {
        Literal::Null => Ok(Value::String(None)),
        Literal::Bool(b) => Ok(Value::from(*b)),
        Literal::Integer(n) => Ok(Value::from(*n)),
        Literal::Float(x) => Ok(Value::from(*x)),
        Literal::String(s) => Ok(Value::from(s.clone())),
        Literal::List(_) => Err(CompileError::new("nested lists are not supported")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FilterTerm, SimpleFilter};
    use crate::schema::{FieldDescriptor, FieldType};

    fn create_test_compiler() -> SqlCompiler {
        let mut compiler = SqlCompiler::new();
        compiler.set_schemas(&[
            EntitySchema::new("product", "products")
                .field(FieldDescriptor::new("name", FieldType::Char, "Name"))
                .field(FieldDescriptor::link("categ_ref", "category", "Category")),
            EntitySchema::new("category", "categories")
                .field(FieldDescriptor::new("name", FieldType::Char, "Name")),
        ]);
        compiler
    }

    fn expr(terms: Vec<FilterTerm>) -> FilterExpr {
        SimpleFilter::new(terms).to_expr().unwrap()
    }

    fn eq(field: &str, value: Literal) -> FilterTerm {
        FilterTerm::Clause(Clause::new(field, FilterOp::Eq, value))
    }

    #[test]
    fn test_simple_filter_compilation() {
        let compiler = create_test_compiler();
        let filter = expr(vec![eq("name", Literal::String("Desk".into()))]);

        let result = compiler.compile("product", &filter, None).unwrap();
        assert_eq!(
            result.sql,
            r#"SELECT * FROM "products" WHERE "name" = ? ORDER BY "id" ASC"#
        );
        assert_eq!(result.values.0, vec![Value::from("Desk".to_string())]);
    }

    #[test]
    fn test_match_all_has_no_where_clause() {
        let compiler = create_test_compiler();
        let result = compiler.compile("product", &FilterExpr::All, Some(10)).unwrap();
        assert!(!result.sql.contains("WHERE"));
        assert!(result.sql.contains("LIMIT"));
    }

    #[test]
    fn test_or_to_in_optimization() {
        let compiler = create_test_compiler();
        let filter = expr(vec![
            FilterTerm::Or,
            eq("name", Literal::String("A".into())),
            FilterTerm::Or,
            eq("name", Literal::String("B".into())),
            eq("name", Literal::String("C".into())),
        ]);

        let result = compiler.compile("product", &filter, None).unwrap();
        assert_eq!(
            result.optimizations,
            vec![Optimization::OrToIn {
                field: "name".into(),
                value_count: 3
            }]
        );
        assert!(result.sql.contains(r#""name" IN (?, ?, ?)"#));
    }

    #[test]
    fn test_or_on_different_fields_is_not_collapsed() {
        let compiler = create_test_compiler();
        let filter = expr(vec![
            FilterTerm::Or,
            eq("name", Literal::String("A".into())),
            FilterTerm::Or,
            eq("id", Literal::Integer(1)),
            eq("name", Literal::String("C".into())),
        ]);

        let result = compiler.compile("product", &filter, None).unwrap();
        assert!(result.optimizations.is_empty());
        assert!(result.sql.contains(" OR "));
    }

    #[test]
    fn test_null_comparisons() {
        let compiler = create_test_compiler();
        let filter = expr(vec![
            eq("categ_ref", Literal::Null),
            FilterTerm::Clause(Clause::new("name", FilterOp::NotEq, Literal::Null)),
        ]);
        let result = compiler.compile("product", &filter, None).unwrap();
        assert!(result.sql.contains(r#""categ_ref" IS NULL"#));
        assert!(result.sql.contains(r#""name" IS NOT NULL"#));

        let bad = expr(vec![FilterTerm::Clause(Clause::new("id", FilterOp::Gt, Literal::Null))]);
        assert!(compiler.compile("product", &bad, None).is_err());
    }

    #[test]
    fn test_icontains_is_a_literal_substring_match() {
        let compiler = create_test_compiler();
        let filter = expr(vec![FilterTerm::Clause(Clause::new(
            "name",
            FilterOp::IContains,
            Literal::String("100%_DeSk".into()),
        ))]);
        let result = compiler.compile("product", &filter, None).unwrap();
        assert!(result.sql.contains(r#"LOWER("name")"#));
        assert!(!result.sql.contains("LIKE"));
        assert_eq!(result.values.0[0], Value::from("100%_desk".to_string()));
    }

    #[test]
    fn test_inequality_keeps_null_rows() {
        let compiler = create_test_compiler();
        let filter = expr(vec![
            FilterTerm::Clause(Clause::new("name", FilterOp::NotEq, Literal::String("Desk".into()))),
            FilterTerm::Clause(Clause::new(
                "id",
                FilterOp::NotIn,
                Literal::List(vec![Literal::Integer(1), Literal::Integer(2)]),
            )),
        ]);
        let result = compiler.compile("product", &filter, None).unwrap();
        assert!(result.sql.contains(r#""name" <> ? OR "name" IS NULL"#));
        assert!(result.sql.contains(r#""id" NOT IN (?, ?) OR "id" IS NULL"#));
    }

    #[test]
    fn test_not_marker_is_pushed_to_the_leaves() {
        let compiler = create_test_compiler();
        let filter = expr(vec![
            FilterTerm::Not,
            FilterTerm::Or,
            eq("name", Literal::String("Desk".into())),
            FilterTerm::Clause(Clause::new("id", FilterOp::Gt, Literal::Integer(5))),
        ]);
        let result = compiler.compile("product", &filter, None).unwrap();
        assert!(result.sql.contains(r#""name" <> ? OR "name" IS NULL"#));
        assert!(result.sql.contains(r#""id" <= ?"#));
        assert!(!result.sql.contains("NOT ("));

        let related = expr(vec![
            FilterTerm::Not,
            FilterTerm::Clause(Clause::new("categ_ref.name", FilterOp::Eq, Literal::String("Office".into()))),
        ]);
        let result = compiler.compile("product", &related, None).unwrap();
        assert!(result.sql.contains(r#""categ_ref" NOT IN (SELECT "id" FROM "categories" WHERE "name" = ?)"#));
        assert!(result.sql.contains(r#""categ_ref" IS NULL"#));
    }

    #[test]
    fn test_relation_path_compiles_to_subquery() {
        let compiler = create_test_compiler();
        let filter = expr(vec![FilterTerm::Clause(Clause::new(
            "categ_ref.name",
            FilterOp::Eq,
            Literal::String("Office".into()),
        ))]);
        let result = compiler.compile("product", &filter, None).unwrap();
        assert!(result
            .sql
            .contains(r#""categ_ref" IN (SELECT "id" FROM "categories" WHERE "name" = ?)"#));

        let not_a_link = expr(vec![FilterTerm::Clause(Clause::new(
            "name.id",
            FilterOp::Eq,
            Literal::Integer(1),
        ))]);
        assert!(compiler.compile("product", &not_a_link, None).is_err());
    }

    #[test]
    fn test_unknown_entity() {
        let compiler = create_test_compiler();
        let err = compiler.compile("ghost", &FilterExpr::All, None).unwrap_err();
        assert!(err.message.contains("ghost"));
    }
}
