//! The caller-facing search operation.
//!
//! `execute_search` resolves the entity type, runs the interpretation pipeline
//! and always returns a terminal [`ExecutionResult`]; errors become results
//! with status `error`.

use crate::ast::CanonicalQuery;
use crate::classifier::classify;
use crate::config::SearchConfig;
use crate::error::{Result, SearchError, ValidationError};
use crate::executor::{DraftExecution, ExecutionResult, Outcome, QueryExecutor};
use crate::llm::{CompletionParams, CompletionProvider};
use crate::prompt::{build_filter_prompt, PromptContext, SYSTEM_INSTRUCTION};
use crate::schema::SchemaIntrospector;
use crate::sql_fallback::{self, complex_keyword};
use crate::store::EntityStore;
use crate::validator::validate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Immutable input of one search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    pub category: Option<String>,
    /// Takes precedence over `category` when set.
    pub entity_type: Option<String>,
}

impl QueryRequest {
    pub fn for_category(text: &str, category: &str) -> Self {
        Self {
            text: text.to_string(),
            category: Some(category.to_string()),
            entity_type: None,
        }
    }

    pub fn for_entity(text: &str, entity_type: &str) -> Self {
        Self {
            text: text.to_string(),
            category: None,
            entity_type: Some(entity_type.to_string()),
        }
    }
}

/// Append-only log of completed searches.
#[derive(Debug, Default)]
pub struct AuditTrail {
    entries: Vec<ExecutionResult>,
}

impl AuditTrail {
    pub fn append(&mut self, result: ExecutionResult) {
        self.entries.push(result);
    }

    pub fn entries(&self) -> &[ExecutionResult] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One JSON document per line.
    pub fn to_json_lines(&self) -> serde_json::Result<String> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }
}

pub struct SearchService {
    store: Arc<dyn EntityStore>,
    provider: Arc<dyn CompletionProvider>,
    config: SearchConfig,
    audit: Mutex<AuditTrail>,
}

impl SearchService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        provider: Arc<dyn CompletionProvider>,
        config: SearchConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
            audit: Mutex::new(AuditTrail::default()),
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn EntityStore {
        self.store.as_ref()
    }

    /// Snapshot of the audit trail.
    pub fn audit_entries(&self) -> Vec<ExecutionResult> {
        self.audit.lock().entries().to_vec()
    }

    /// Append the audit trail to `path` as JSON lines.
    pub fn write_audit_log<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let lines = self.audit.lock().to_json_lines()?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(lines.as_bytes())?;
        Ok(())
    }

    /// Pick the concrete entity type for a request.
    pub fn resolve_entity_type(&self, request: &QueryRequest) -> Result<String> {
        if let Some(entity_type) = &request.entity_type {
            if !self.store.has_entity(entity_type) {
                return Err(ValidationError::UnknownEntity(entity_type.clone()).into());
            }
            return Ok(entity_type.clone());
        }

        let category = request.category.as_deref().ok_or_else(|| {
            SearchError::Configuration("request names neither a category nor an entity type".to_string())
        })?;
        let candidates = self
            .config
            .entities_for(category)
            .ok_or_else(|| SearchError::Configuration(format!("unknown category '{}'", category)))?;

        match candidates.iter().find(|e| self.store.has_entity(e)) {
            Some(entity_type) => {
                info!(category, entity_type = %entity_type, "resolved category");
                Ok(entity_type.clone())
            }
            None => Err(SearchError::CategoryUnavailable {
                category: category.to_string(),
                missing: candidates.to_vec(),
            }),
        }
    }

    pub async fn execute_search(&self, request: &QueryRequest) -> ExecutionResult {
        let result = match self.resolve_entity_type(request) {
            Err(err) => {
                let label = request
                    .entity_type
                    .as_deref()
                    .or(request.category.as_deref())
                    .unwrap_or_default();
                DraftExecution::new(&request.text, label).fail(&err)
            }
            Ok(entity_type) => {
                let mut draft = DraftExecution::new(&request.text, &entity_type);
                match self.run_pipeline(&mut draft, &entity_type, &request.text).await {
                    Ok(outcome) => draft.succeed(outcome, self.config.executor.display_limit),
                    Err(err) => {
                        warn!(kind = err.kind(), error = %err, "search failed");
                        draft.fail(&err)
                    }
                }
            }
        };

        self.audit.lock().append(result.clone());
        result
    }

    async fn run_pipeline(
        &self,
        draft: &mut DraftExecution,
        entity_type: &str,
        text: &str,
    ) -> Result<Outcome> {
        let settings = &self.config.llm;
        let schema = SchemaIntrospector::new(self.store.as_ref());

        let prompt = {
            let fields = schema.fields_of(entity_type)?;
            let inbound = schema.inbound_links(entity_type)?;
            let description = self
                .store
                .schema(entity_type)
                .and_then(|s| s.description.clone());
            let ctx = PromptContext {
                entity_type,
                description: description.as_deref(),
                fields: &fields,
                inbound: &inbound,
            };
            build_filter_prompt(&ctx, text)
        };
        info!(entity_type, prompt_len = prompt.len(), "interpreting query");

        let raw = self
            .provider
            .complete(settings, SYSTEM_INSTRUCTION, &prompt, CompletionParams::for_filters(settings))
            .await?;
        draft.record_response(&raw);
        info!(response = %crate::error::excerpt(&raw), "LLM response received");

        let fallback_enabled = self.config.sql_fallback;
        let query = match classify(&raw) {
            Ok(CanonicalQuery::SimpleFilter(filter)) => match complex_keyword(text).filter(|_| fallback_enabled) {
                Some(keyword) => {
                    info!(keyword = %keyword, "request needs more than a filter; trying SQL");
                    match self.sql_fallback(draft, &schema, entity_type, text).await {
                        Ok(raw_query) => raw_query,
                        Err(err @ SearchError::UnsafeQueryRejected { .. }) => return Err(err),
                        Err(err) => {
                            warn!(error = %err, "SQL fallback failed; using the filter");
                            validate(CanonicalQuery::SimpleFilter(filter), entity_type, text, &schema)?
                        }
                    }
                }
                None => validate(CanonicalQuery::SimpleFilter(filter), entity_type, text, &schema)?,
            },
            Ok(structured) => validate(structured, entity_type, text, &schema)?,
            Err(SearchError::ParseFailure { message, excerpt }) if fallback_enabled => {
                warn!(reason = %message, "response not classifiable; trying SQL");
                match self.sql_fallback(draft, &schema, entity_type, text).await {
                    Ok(raw_query) => raw_query,
                    Err(fallback_err) => {
                        return Err(SearchError::ParseFailure {
                            message: format!("{}; SQL fallback failed: {}", message, fallback_err),
                            excerpt,
                        })
                    }
                }
            }
            Err(err) => return Err(err),
        };

        if let CanonicalQuery::CountAggregate(_) | CanonicalQuery::Exclusion(_) = &query {
            info!(query = %query, "structured query");
        }
        draft.record_query(query.clone());
        QueryExecutor::new(self.store.as_ref(), self.config.executor.clone()).execute(&query, entity_type)
    }

    async fn sql_fallback(
        &self,
        draft: &mut DraftExecution,
        schema: &SchemaIntrospector<'_>,
        entity_type: &str,
        text: &str,
    ) -> Result<CanonicalQuery> {
        let generated =
            sql_fallback::generate(self.provider.as_ref(), &self.config.llm, schema, entity_type, text).await?;
        draft.record_response(&generated.raw_response);
        info!(sql = %generated.query.sql, "SQL fallback accepted");
        Ok(CanonicalQuery::RawQuery(generated.query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Clause, CountComparison, FilterOp, FilterTerm, Literal};
    use crate::error::LlmError;
    use crate::executor::ExecutionStatus;
    use crate::llm::testing::ScriptedProvider;
    use crate::schema::{EntitySchema, FieldDescriptor, FieldType};
    use crate::store::SqliteStore;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(vec![
            EntitySchema::new("contact", "contacts")
                .field(FieldDescriptor::new("name", FieldType::Char, "Name"))
                .field(FieldDescriptor::new("active", FieldType::Boolean, "Active")),
            EntitySchema::new("client", "clients")
                .field(FieldDescriptor::new("name", FieldType::Char, "Name"))
                .field(FieldDescriptor::new("city", FieldType::Char, "City")),
            EntitySchema::new("invoice", "invoices")
                .field(FieldDescriptor::link("client_ref", "client", "Client"))
                .field(FieldDescriptor::new("amount_total", FieldType::Monetary, "Total")),
            EntitySchema::new("product", "products")
                .field(FieldDescriptor::new("name", FieldType::Char, "Name"))
                .field(FieldDescriptor::new("list_price", FieldType::Monetary, "Sales Price"))
                .field(FieldDescriptor::new("standard_price", FieldType::Monetary, "Cost")),
            EntitySchema::new("order_line", "order_lines")
                .field(FieldDescriptor::link("product_ref", "product", "Product"))
                .field(FieldDescriptor::new("quantity", FieldType::Float, "Quantity")),
        ])
        .unwrap()
    }

    fn service(store: SqliteStore, provider: ScriptedProvider) -> (SearchService, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let service = SearchService::new(Arc::new(store), provider.clone(), SearchConfig::default());
        (service, provider)
    }

    fn name(value: &str) -> Literal {
        Literal::String(value.into())
    }

    #[tokio::test]
    async fn test_active_contacts() {
        let store = store();
        for (n, active) in [("Ada", true), ("Bob", false), ("Cy", true)] {
            store
                .insert("contact", &[("name", name(n)), ("active", Literal::Bool(active))])
                .unwrap();
        }
        let (service, _) = service(store, ScriptedProvider::new(["[('active', '=', True)]"]));

        let result = service
            .execute_search(&QueryRequest::for_category("active contacts", "customers"))
            .await;
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.entity_type, "contact");
        let names: Vec<_> = result.records.iter().map(|r| r.display_name.as_str()).collect();
        assert_eq!(names, vec!["Ada", "Cy"]);
        assert_eq!(
            result.canonical_query,
            Some(CanonicalQuery::SimpleFilter(crate::ast::SimpleFilter::new(vec![
                FilterTerm::Clause(Clause::new("active", FilterOp::Eq, Literal::Bool(true)))
            ])))
        );
        assert_eq!(result.raw_response.as_deref(), Some("[('active', '=', True)]"));
        assert_eq!(service.audit_entries().len(), 1);
    }

    #[tokio::test]
    async fn test_clients_with_more_than_ten_invoices() {
        let store = store();
        for (client, invoices) in [("Five", 5), ("Eleven", 11), ("Fifteen", 15)] {
            let id = store.insert("client", &[("name", name(client))]).unwrap();
            for _ in 0..invoices {
                store.insert("invoice", &[("client_ref", Literal::Integer(id))]).unwrap();
            }
        }
        let response = r#"{"query_type": "count_aggregate", "primary_model": "client",
            "secondary_model": "invoice", "link_field": "client_ref", "threshold": 10, "operator": ">"}"#;
        let (service, provider) = service(store, ScriptedProvider::new([response]));

        let result = service
            .execute_search(&QueryRequest::for_entity("clients with more than 10 invoices", "client"))
            .await;
        assert!(result.is_success(), "{:?}", result.error);
        let names: Vec<_> = result.records.iter().map(|r| r.display_name.as_str()).collect();
        assert_eq!(names, vec!["Eleven", "Fifteen"]);
        match result.canonical_query {
            Some(CanonicalQuery::CountAggregate(agg)) => {
                assert_eq!(agg.threshold, 10);
                assert_eq!(agg.comparison, CountComparison::Gt);
            }
            other => panic!("unexpected {:?}", other),
        }
        // prompt advertised the inbound link
        assert!(provider.prompts.lock()[0].contains("invoice.client_ref"));
    }

    #[tokio::test]
    async fn test_products_never_ordered() {
        let store = store();
        let mut ids = Vec::new();
        for n in ["P1", "P2", "P3", "P4", "P5"] {
            ids.push(store.insert("product", &[("name", name(n))]).unwrap());
        }
        for id in [ids[1], ids[3], ids[3]] {
            store.insert("order_line", &[("product_ref", Literal::Integer(id))]).unwrap();
        }
        let response = r#"{"query_type": "exclusion", "primary_model": "product",
            "secondary_model": "order_line", "link_field": "product_ref"}"#;
        let (service, _) = service(store, ScriptedProvider::new([response]));

        let result = service
            .execute_search(&QueryRequest::for_category("products never ordered", "products"))
            .await;
        assert!(result.is_success());
        assert_eq!(result.matched_ids, vec![ids[0], ids[2], ids[4]]);
    }

    #[tokio::test]
    async fn test_invalid_structured_response_is_an_error() {
        let store = store();
        for n in ["P1", "P2", "P3"] {
            store.insert("product", &[("name", name(n))]).unwrap();
        }
        store.insert("order_line", &[("product_ref", Literal::Integer(1))]).unwrap();
        let response = r#"{"query_type": "exclusion", "primary_model": "product",
            "secondary_model": "order_line", "link_field": "product_ref",}"#;
        let (service, _) = service(store, ScriptedProvider::new([response]));

        let result = service
            .execute_search(&QueryRequest::for_entity("products never ordered", "product"))
            .await;
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.error_kind, Some("parse_failure"));
        assert!(result.error.unwrap().contains("malformed structured query"));
        assert!(result.matched_ids.is_empty());
        assert_eq!(result.canonical_query, None);
    }

    #[tokio::test]
    async fn test_fenced_malformed_list_is_repaired() {
        let store = store();
        store.insert("client", &[("name", name("Acme")), ("city", name("Rome"))]).unwrap();
        store.insert("client", &[("name", name("Beta")), ("city", name("Milan"))]).unwrap();
        let (service, _) = service(store, ScriptedProvider::new(["```python\n[('city', '=\", 'Rome')]\n```"]));

        let result = service
            .execute_search(&QueryRequest::for_entity("clients in Rome", "client"))
            .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.records[0].display_name, "Acme");
        assert_eq!(result.count, 1);
    }

    #[tokio::test]
    async fn test_irreparable_response_is_parse_failure() {
        let raw = "```\n[('city', '=', os.system('x'))]\n```";
        let (service, provider) = service(store(), ScriptedProvider::new([raw]));

        let result = service
            .execute_search(&QueryRequest::for_entity("clients in Rome", "client"))
            .await;
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.error_kind, Some("parse_failure"));
        assert!(result.error.unwrap().contains("os.system"));
        // the fallback was attempted once
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_stacked_sql_is_rejected_before_execution() {
        let store = store();
        store.insert("client", &[("name", name("Acme"))]).unwrap();
        let (service, _) = service(
            store,
            ScriptedProvider::new([
                "[('name', '!=', None)]",
                "SELECT id FROM clients; DROP TABLE clients;",
            ]),
        );

        let result = service
            .execute_search(&QueryRequest::for_entity("top 5 clients by revenue", "client"))
            .await;
        assert_eq!(result.error_kind, Some("unsafe_query_rejected"));
        // table still intact
        assert_eq!(
            service
                .store()
                .search("client", &crate::ast::SimpleFilter::match_all())
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_keyword_triggers_sql_fallback() {
        let store = store();
        for (client, city) in [("A", "Rome"), ("B", "Milan"), ("C", "Rome")] {
            store.insert("client", &[("name", name(client)), ("city", name(city))]).unwrap();
        }
        let (service, _) = service(
            store,
            ScriptedProvider::new([
                "[('city', '=', 'Rome')]",
                r#"{"sql": "SELECT id FROM clients WHERE city = ? ORDER BY id DESC LIMIT 1000", "params": ["Rome"]}"#,
            ]),
        );

        let result = service
            .execute_search(&QueryRequest::for_entity("top clients in Rome", "client"))
            .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.matched_ids, vec![3, 1]);
        assert!(matches!(result.canonical_query, Some(CanonicalQuery::RawQuery(_))));
        assert!(result.raw_response.unwrap().contains("SELECT id FROM clients"));
    }

    #[tokio::test]
    async fn test_failed_keyword_fallback_uses_filter() {
        let store = store();
        store.insert("client", &[("name", name("A")), ("city", name("Rome"))]).unwrap();
        let (service, _) = service(
            store,
            ScriptedProvider::new(["[('city', '=', 'Rome')]", "I cannot write SQL for that"]),
        );
        let result = service
            .execute_search(&QueryRequest::for_entity("clients between Rome and Milan", "client"))
            .await;
        assert!(result.is_success());
        assert!(matches!(result.canonical_query, Some(CanonicalQuery::SimpleFilter(_))));
    }

    #[tokio::test]
    async fn test_unknown_field_is_error_result() {
        let (service, _) = service(store(), ScriptedProvider::new(["[('colour', '=', 'red')]"]));
        let result = service
            .execute_search(&QueryRequest::for_entity("red clients", "client"))
            .await;
        assert_eq!(result.error_kind, Some("unknown_field"));
        assert!(result.error.unwrap().contains("colour"));
    }

    #[tokio::test]
    async fn test_category_resolution() {
        let (service, provider) = service(store(), ScriptedProvider::new(Vec::<String>::new()));

        let result = service
            .execute_search(&QueryRequest::for_category("open deals", "crm"))
            .await;
        assert_eq!(result.error_kind, Some("category_unavailable"));
        assert!(result.error.unwrap().contains("lead"));
        assert_eq!(provider.calls(), 0);

        assert_eq!(
            service
                .resolve_entity_type(&QueryRequest::for_category("x", "invoices"))
                .unwrap(),
            "invoice"
        );
        assert!(service
            .resolve_entity_type(&QueryRequest::for_category("x", "nonsense"))
            .is_err());
        assert!(service
            .resolve_entity_type(&QueryRequest::for_entity("x", "ghost"))
            .is_err());
    }

    #[tokio::test]
    async fn test_provider_errors_become_results() {
        let (service, _) = service(
            store(),
            ScriptedProvider::failing(LlmError::RateLimited("slow down".into())),
        );
        let result = service
            .execute_search(&QueryRequest::for_entity("anything", "client"))
            .await;
        assert_eq!(result.error_kind, Some("rate_limited"));
        assert_eq!(result.raw_response, None);
        assert_eq!(service.audit_entries()[0].status, ExecutionStatus::Error);
    }

    #[test]
    fn test_audit_trail_json_lines() {
        let mut trail = AuditTrail::default();
        trail.append(DraftExecution::new("a", "client").fail(&SearchError::Execution("x".into())));
        trail.append(DraftExecution::new("b", "client").fail(&SearchError::Execution("y".into())));
        let lines = trail.to_json_lines().unwrap();
        assert_eq!(lines.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(lines.lines().next().unwrap()).unwrap();
        assert_eq!(first["status"], "error");
        assert_eq!(first["query_text"], "a");
    }
}
