//! Response classification: raw LLM text -> canonical query.
//!
//! Order of attempts:
//! 1. strip a surrounding code fence
//! 2. a JSON object carrying `query_type` (count_aggregate / exclusion / unsupported)
//! 3. the outermost `[...]` substring parsed as a clause list, with one
//!    round of enumerated textual repairs if the strict parse fails
//!
//! Nothing is ever evaluated; the only parser is the literal-only one in `parser`.

use crate::ast::{CanonicalQuery, CountAggregate, CountComparison, Exclusion, SimpleFilter};
use crate::error::{Result, SearchError};
use crate::parser::parse_filter;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Threshold used when a count aggregate leaves it out ("clients with invoices").
pub const DEFAULT_THRESHOLD: u64 = 1;

lazy_static! {
    static ref CODE_FENCE: Regex = Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").unwrap();
    static ref DISCRIMINATOR_KEY: Regex = Regex::new(r#"["']?\b(query_type|type)\b["']?\s*:"#).unwrap();
}

pub fn classify(raw: &str) -> Result<CanonicalQuery> {
    let text = strip_code_fence(raw);

    match structured_object(text) {
        Some(object) => {
            if let Some(kind) = discriminator(&object) {
                let query = structured_query(&kind, &object, raw)?;
                info!(kind = query.kind(), "classified structured response");
                return Ok(query);
            }
            debug!("JSON object without query_type; trying clause list");
        }
        None if names_query_type(text) => {
            return Err(malformed("the object naming a query_type is not valid JSON".to_string(), raw));
        }
        None => {}
    }

    let filter = classify_filter(text, raw)?;
    info!(clauses = filter.clauses().count(), "classified simple filter");
    Ok(CanonicalQuery::SimpleFilter(filter))
}

/// Remove a markdown code fence around (or inside) the response.
pub fn strip_code_fence(raw: &str) -> &str {
    match CODE_FENCE.captures(raw).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => raw.trim(),
    }
}

fn structured_object(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    // prose around the object is tolerated; a list that merely contains braces is not an object
    if text[..start].contains('[') {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// A `{...}` span, not preceded by a list, that names a query type but failed to parse.
fn names_query_type(text: &str) -> bool {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return false;
    };
    end > start && !text[..start].contains('[') && DISCRIMINATOR_KEY.is_match(&text[start..=end])
}

fn discriminator(object: &Map<String, Value>) -> Option<String> {
    ["query_type", "type"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(|kind| kind.trim().to_ascii_lowercase())
}

fn structured_query(kind: &str, object: &Map<String, Value>, raw: &str) -> Result<CanonicalQuery> {
    match kind {
        "count_aggregate" | "count" => {
            let comparison = match object.get("operator").or_else(|| object.get("comparison")) {
                None | Some(Value::Null) => CountComparison::DEFAULT,
                Some(value) => value
                    .as_str()
                    .and_then(CountComparison::parse)
                    .ok_or_else(|| malformed(format!("unsupported count operator {}", value), raw))?,
            };
            let threshold = match object.get("threshold") {
                None | Some(Value::Null) => DEFAULT_THRESHOLD,
                Some(value) => threshold_of(value)
                    .ok_or_else(|| malformed(format!("invalid threshold {}", value), raw))?,
            };
            Ok(CanonicalQuery::CountAggregate(CountAggregate {
                primary_model: required(object, "primary_model", raw)?,
                secondary_model: required(object, "secondary_model", raw)?,
                link_field: required(object, "link_field", raw)?,
                threshold,
                comparison,
            }))
        }
        "exclusion" => Ok(CanonicalQuery::Exclusion(Exclusion {
            primary_model: required(object, "primary_model", raw)?,
            secondary_model: required(object, "secondary_model", raw)?,
            link_field: required(object, "link_field", raw)?,
        })),
        "unsupported" => {
            let reason = object
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("no reason given");
            Err(SearchError::parse_failure(
                format!("the model could not express the request: {}", reason),
                raw,
            ))
        }
        other => Err(malformed(format!("unknown query_type '{}'", other), raw)),
    }
}

fn malformed(detail: String, raw: &str) -> SearchError {
    SearchError::parse_failure(format!("malformed structured query: {}", detail), raw)
}

fn required(object: &Map<String, Value>, key: &str, raw: &str) -> Result<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| malformed(format!("missing required key '{}'", key), raw))
}

fn threshold_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|x| *x >= 0.0 && x.fract() == 0.0 && *x <= u32::MAX as f64)
                .map(|x| x as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn classify_filter(text: &str, raw: &str) -> Result<SimpleFilter> {
    let Some(start) = text.find('[') else {
        debug!("no clause list in response; matching all records");
        return Ok(SimpleFilter::match_all());
    };
    let Some(end) = text.rfind(']').filter(|end| *end > start) else {
        return Err(SearchError::parse_failure("unterminated clause list", raw));
    };
    let candidate = &text[start..=end];

    let strict_err = match parse_filter(candidate) {
        Ok(filter) => return Ok(filter),
        Err(err) => err,
    };

    let repaired = repair(candidate);
    if repaired == candidate {
        return Err(SearchError::parse_failure(strict_err.to_string(), raw));
    }
    warn!(error = %strict_err, "strict parse failed; retrying after repairs");
    parse_filter(&repaired).map_err(|err| {
        SearchError::parse_failure(format!("{} (after repair: {})", strict_err, err), raw)
    })
}

/// The enumerated repairs: quote-style normalisation and literal-keyword normalisation.
pub fn repair(candidate: &str) -> String {
    let quotes = candidate
        .replace(['\u{2018}', '\u{2019}', '\u{201B}', '\u{2032}'], "'")
        .replace(['\u{201C}', '\u{201D}', '\u{201F}', '\u{2033}'], "'")
        .replace('"', "'");
    normalize_keywords(&quotes)
}

/// Rewrite bare `TRUE`/`false`/`NULL`/`none`... outside quotes to `True`/`False`/`None`.
fn normalize_keywords(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut word = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    let flush = |word: &mut String, out: &mut String| {
        if !word.is_empty() {
            let replacement = match word.to_ascii_lowercase().as_str() {
                "true" => "True",
                "false" => "False",
                "none" | "null" => "None",
                _ => word.as_str(),
            };
            out.push_str(replacement);
            word.clear();
        }
    };

    for c in text.chars() {
        if let Some(q) = quote {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
            continue;
        }
        flush(&mut word, &mut out);
        if c == '\'' || c == '"' {
            quote = Some(c);
        }
        out.push(c);
    }
    flush(&mut word, &mut out);
    out
}
