//! Raw SQL fallback for requests that neither a filter nor a structured
//! aggregation can express.
//!
//! The statement comes from the LLM, so validation is keyword based and fails
//! closed: anything suspicious is rejected, never rewritten.

use crate::ast::{Literal, RawQuery};
use crate::classifier::strip_code_fence;
use crate::config::LlmSettings;
use crate::error::{excerpt, Result, SearchError};
use crate::llm::{CompletionParams, CompletionProvider};
use crate::schema::{FieldSet, SchemaIntrospector, MAX_PROMPT_FIELDS};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::fmt::Write;
use tracing::{info, warn};

pub const SQL_SYSTEM_INSTRUCTION: &str = "You generate read-only SQLite SELECT statements. \
Use ? placeholders for every value and respond only with the requested JSON object.";

/// Any of these anywhere in a candidate statement rejects it.
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "alter", "drop", "truncate", "create", "attach", "detach",
    "pragma", "vacuum",
];

/// Row cap the model is asked to apply; execution enforces its own limit as well.
pub const PROMPT_ROW_LIMIT: usize = 1000;

lazy_static! {
    static ref COMPLEX_KEYWORDS: Regex = Regex::new(
        r"(?i)\b(top|bottom|rank|ranked|ranking|percentile|between|range|average|avg|sum|total of|group|grouped|distinct|having|partition|union|intersect|except|join|maximum|minimum|highest|lowest|median)\b"
    )
    .unwrap();
    // a CTE can recurse without bound while holding the store's connection
    static ref COMMON_TABLE_EXPRESSION: Regex = Regex::new(r"(?i)\b(with|recursive)\b").unwrap();
    static ref WRAPPER_PROSE: Regex =
        Regex::new(r"(?i)^(here(?:'s| is) the (?:sql )?query|sql query|sql)\s*:?\s*").unwrap();
}

/// The keyword that makes this request a candidate for SQL generation, if any.
pub fn complex_keyword(query_text: &str) -> Option<String> {
    COMPLEX_KEYWORDS
        .find(query_text)
        .map(|m| m.as_str().to_lowercase())
}

/// A validated statement together with the text the model produced.
#[derive(Debug, Clone)]
pub struct GeneratedQuery {
    pub query: RawQuery,
    pub raw_response: String,
}

/// Ask the model for a statement over `entity_type`'s table and validate it.
pub async fn generate(
    provider: &dyn CompletionProvider,
    settings: &LlmSettings,
    schema: &SchemaIntrospector<'_>,
    entity_type: &str,
    query_text: &str,
) -> Result<GeneratedQuery> {
    let table = schema.store().table_of(entity_type)?;
    let fields = schema.fields_of(entity_type)?;
    let prompt = build_sql_prompt(&table, &fields, query_text);

    info!(entity_type, table = %table, "generating SQL fallback");
    let raw_response = provider
        .complete(settings, SQL_SYSTEM_INSTRUCTION, &prompt, CompletionParams::for_sql(settings))
        .await?;

    let (statement, params) = extract_statement(&raw_response)?;
    let sql = validate_statement(&statement, &params, &table).map_err(|err| {
        warn!(error = %err, "generated SQL rejected");
        err
    })?;

    Ok(GeneratedQuery {
        query: RawQuery {
            entity_type: entity_type.to_string(),
            table,
            sql,
            params,
        },
        raw_response,
    })
}

pub fn build_sql_prompt(table: &str, fields: &FieldSet, query_text: &str) -> String {
    let mut columns = String::new();
    // columns whose names contain a forbidden word would fail validation anyway
    for field in fields
        .persisted()
        .filter(|f| contains_forbidden(&f.name).is_none())
        .take(MAX_PROMPT_FIELDS)
    {
        let _ = writeln!(columns, "- {} ({}): {}", field.name, field.field_type.as_str(), field.label);
    }

    format!(
        r#"Task: convert the request into one SQLite SELECT statement.

TABLE: {table}
Columns:
{columns}
RULES:
1. Select only the id column: SELECT id FROM {table} ...
2. Read from {table}; subqueries on other tables are allowed only inside WHERE
3. Use ? placeholders for every literal value and list the values in "params"
4. Always ORDER BY a deterministic expression ending with id DESC
5. Always end with LIMIT {limit}
6. Never modify data; no comments; no WITH clauses; exactly one statement

EXAMPLES:
{{"sql": "SELECT id FROM {table} WHERE state = ? ORDER BY id DESC LIMIT {limit}", "params": ["draft"]}}
{{"sql": "SELECT id FROM {table} ORDER BY amount_total DESC, id DESC LIMIT ?", "params": [5]}}

QUERY: "{query}"

Respond with only the JSON object:"#,
        table = table,
        columns = columns,
        limit = PROMPT_ROW_LIMIT,
        query = query_text.trim(),
    )
}

#[derive(Deserialize)]
struct StatementResponse {
    sql: String,
    #[serde(default)]
    params: Vec<Literal>,
}

/// Isolate the statement (and its parameters) from the model's response.
pub fn extract_statement(raw: &str) -> Result<(String, Vec<Literal>)> {
    let text = strip_code_fence(raw);

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(parsed) = serde_json::from_str::<StatementResponse>(&text[start..=end]) {
                return Ok((parsed.sql.trim().to_string(), parsed.params));
            }
        }
    }

    let text = WRAPPER_PROSE.replace(text, "");
    let lower = text.to_ascii_lowercase();
    let Some(start) = lower.find("select") else {
        return Err(SearchError::SqlGeneration(format!(
            "no SELECT statement in response: {}",
            excerpt(raw)
        )));
    };
    let statement = &text[start..];
    // prose after a blank line is commentary, not SQL
    let statement = statement.split("\n\n").next().unwrap_or(statement);
    Ok((statement.trim().to_string(), Vec::new()))
}

fn contains_forbidden(text: &str) -> Option<&'static str> {
    let lower = text.to_ascii_lowercase();
    FORBIDDEN_KEYWORDS.iter().copied().find(|k| lower.contains(k))
}

/// Fail-closed safety checks. Returns the statement with exactly one terminating `;`.
pub fn validate_statement(statement: &str, params: &[Literal], table: &str) -> Result<String> {
    let sql = statement.trim();
    let reject = |reason: String| Err(SearchError::unsafe_query(reason, statement));

    if !sql.to_ascii_lowercase().starts_with("select") {
        return reject("only SELECT statements are allowed".to_string());
    }
    if let Some(keyword) = contains_forbidden(sql) {
        return reject(format!("forbidden keyword '{}'", keyword.to_uppercase()));
    }
    if let Some(m) = COMMON_TABLE_EXPRESSION.find(sql) {
        return reject(format!("common table expressions are not allowed ('{}')", m.as_str().to_uppercase()));
    }
    if sql.contains("--") || sql.contains("/*") {
        return reject("comments are not allowed".to_string());
    }

    let body = sql.trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if body.contains(';') {
        return reject("multiple statements are not allowed".to_string());
    }
    if !references_table(body, table) {
        return reject(format!("statement must read from table '{}'", table));
    }

    let placeholders = count_placeholders(body);
    if placeholders != params.len() {
        return reject(format!(
            "{} placeholders but {} parameters",
            placeholders,
            params.len()
        ));
    }
    if params.iter().any(|p| matches!(p, Literal::List(_))) {
        return reject("list parameters are not allowed".to_string());
    }

    Ok(format!("{};", body))
}

fn references_table(sql: &str, table: &str) -> bool {
    match Regex::new(&format!(r#"(?i)(^|[^A-Za-z0-9_]){}([^A-Za-z0-9_]|$)"#, regex::escape(table))) {
        Ok(pattern) => pattern.is_match(sql),
        Err(_) => false,
    }
}

/// `?` placeholders outside of quoted literals and identifiers.
fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' || c == '`' => quote = Some(c),
            None if c == '?' => count += 1,
            None => {}
        }
    }
    count
}
