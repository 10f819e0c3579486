//! Query execution and the per-request result record.
//!
//! A request starts as a [`DraftExecution`]; `succeed` or `fail` consume it and
//! produce the terminal [`ExecutionResult`]. A terminal result has no further
//! transitions, so a retry always starts from a fresh draft.

use crate::ast::{CanonicalQuery, CountAggregate, Exclusion, RawQuery, SimpleFilter};
use crate::config::ExecutorLimits;
use crate::error::{Result, SearchError};
use crate::store::{EntityStore, Record};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
}

/// Lightweight reference to a matched record, for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordRef {
    pub id: i64,
    pub display_name: String,
    pub entity_type: String,
}

/// Terminal outcome of one query request.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub query_text: String,
    pub entity_type: String,
    pub status: ExecutionStatus,
    pub count: usize,
    /// At most `display_limit` entries.
    pub records: Vec<RecordRef>,
    /// Every matching identifier, in result order.
    pub matched_ids: Vec<i64>,
    pub raw_response: Option<String>,
    pub canonical_query: Option<CanonicalQuery>,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// A request in flight.
#[derive(Debug, Clone)]
pub struct DraftExecution {
    query_text: String,
    entity_type: String,
    raw_response: Option<String>,
    canonical_query: Option<CanonicalQuery>,
}

impl DraftExecution {
    pub fn new(query_text: &str, entity_type: &str) -> Self {
        Self {
            query_text: query_text.to_string(),
            entity_type: entity_type.to_string(),
            raw_response: None,
            canonical_query: None,
        }
    }

    /// Keeps every model response seen so far, separated by a blank line.
    pub fn record_response(&mut self, raw: &str) {
        match &mut self.raw_response {
            Some(existing) => {
                existing.push_str("\n\n");
                existing.push_str(raw);
            }
            None => self.raw_response = Some(raw.to_string()),
        }
    }

    pub fn record_query(&mut self, query: CanonicalQuery) {
        self.canonical_query = Some(query);
    }

    pub fn canonical_query(&self) -> Option<&CanonicalQuery> {
        self.canonical_query.as_ref()
    }

    pub fn succeed(self, outcome: Outcome, display_limit: usize) -> ExecutionResult {
        let records = outcome
            .records
            .iter()
            .take(display_limit)
            .map(|record| RecordRef {
                id: record.id,
                display_name: record.display_name.clone(),
                entity_type: outcome.entity_type.clone(),
            })
            .collect();
        ExecutionResult {
            query_text: self.query_text,
            entity_type: outcome.entity_type,
            status: ExecutionStatus::Success,
            count: outcome.matched_ids.len(),
            records,
            matched_ids: outcome.matched_ids,
            raw_response: self.raw_response,
            canonical_query: self.canonical_query,
            error: None,
            error_kind: None,
        }
    }

    pub fn fail(self, err: &SearchError) -> ExecutionResult {
        ExecutionResult {
            query_text: self.query_text,
            entity_type: self.entity_type,
            status: ExecutionStatus::Error,
            count: 0,
            records: Vec::new(),
            matched_ids: Vec::new(),
            raw_response: self.raw_response,
            canonical_query: self.canonical_query,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
        }
    }
}

/// Records matched by one canonical query.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub entity_type: String,
    pub records: Vec<Record>,
    pub matched_ids: Vec<i64>,
}

impl Outcome {
    fn new(entity_type: &str, records: Vec<Record>) -> Self {
        let matched_ids = records.iter().map(|r| r.id).collect();
        Self {
            entity_type: entity_type.to_string(),
            records,
            matched_ids,
        }
    }

    fn empty(entity_type: &str) -> Self {
        Self::new(entity_type, Vec::new())
    }
}

pub struct QueryExecutor<'s> {
    store: &'s dyn EntityStore,
    limits: ExecutorLimits,
}

impl<'s> QueryExecutor<'s> {
    pub fn new(store: &'s dyn EntityStore, limits: ExecutorLimits) -> Self {
        Self { store, limits }
    }

    /// Run a validated query. `entity_type` is the searched entity for filters.
    pub fn execute(&self, query: &CanonicalQuery, entity_type: &str) -> Result<Outcome> {
        let outcome = match query {
            CanonicalQuery::SimpleFilter(filter) => self.run_filter(entity_type, filter)?,
            CanonicalQuery::CountAggregate(agg) => self.run_count_aggregate(agg)?,
            CanonicalQuery::Exclusion(ex) => self.run_exclusion(ex)?,
            CanonicalQuery::RawQuery(raw) => self.run_raw(raw)?,
        };
        info!(
            kind = query.kind(),
            entity_type = %outcome.entity_type,
            count = outcome.matched_ids.len(),
            "query executed"
        );
        Ok(outcome)
    }

    fn run_filter(&self, entity_type: &str, filter: &SimpleFilter) -> Result<Outcome> {
        let records = self.store.search(entity_type, filter)?;
        Ok(Outcome::new(entity_type, records))
    }

    /// Number of secondary records per referenced primary identifier.
    /// Empty links are not counted under any identifier.
    fn link_counts(&self, secondary: &str, link_field: &str) -> Result<HashMap<i64, u64>> {
        let rows = self.store.search(secondary, &SimpleFilter::match_all())?;
        debug!(secondary, rows = rows.len(), "scanned secondary relation");
        let mut counts = HashMap::new();
        for row in &rows {
            if let Some(target) = row.link_target(link_field) {
                *counts.entry(target).or_insert(0u64) += 1;
            }
        }
        Ok(counts)
    }

    fn run_count_aggregate(&self, agg: &CountAggregate) -> Result<Outcome> {
        let counts = self.link_counts(&agg.secondary_model, &agg.link_field)?;
        let primary = agg.primary_model.as_str();

        // records with no links at all can only match when zero satisfies the comparison
        if agg.comparison.matches(0, agg.threshold) {
            let records = self
                .store
                .search(primary, &SimpleFilter::match_all())?
                .into_iter()
                .filter(|r| {
                    let count = counts.get(&r.id).copied().unwrap_or(0);
                    agg.comparison.matches(count, agg.threshold)
                })
                .collect();
            return Ok(Outcome::new(primary, records));
        }

        let ids: Vec<i64> = counts
            .iter()
            .filter(|(_, count)| agg.comparison.matches(**count, agg.threshold))
            .map(|(id, _)| *id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            info!(primary, "no primary record satisfies the count condition");
            return Ok(Outcome::empty(primary));
        }

        let records = self
            .store
            .fetch_by_ids(primary, &ids, self.limits.id_batch_size)?;
        Ok(Outcome::new(primary, records))
    }

    fn run_exclusion(&self, ex: &Exclusion) -> Result<Outcome> {
        let counts = self.link_counts(&ex.secondary_model, &ex.link_field)?;
        let primary = ex.primary_model.as_str();
        let all = self.store.search(primary, &SimpleFilter::match_all())?;

        if counts.is_empty() {
            info!(primary, secondary = %ex.secondary_model, "no links found; every primary record matches");
            return Ok(Outcome::new(primary, all));
        }

        let records = all
            .into_iter()
            .filter(|r| !counts.contains_key(&r.id))
            .collect();
        Ok(Outcome::new(primary, records))
    }

    /// Keeps the statement's row order.
    fn run_raw(&self, raw: &RawQuery) -> Result<Outcome> {
        let mut seen = BTreeSet::new();
        let ids: Vec<i64> = self
            .store
            .execute_read_only(raw, self.limits.raw_row_limit)?
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();
        if ids.is_empty() {
            return Ok(Outcome::empty(&raw.entity_type));
        }

        let mut by_id: HashMap<i64, Record> = self
            .store
            .fetch_by_ids(&raw.entity_type, &ids, self.limits.id_batch_size)?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();
        let records = ids.iter().filter_map(|id| by_id.remove(id)).collect();
        Ok(Outcome::new(&raw.entity_type, records))
    }
}
