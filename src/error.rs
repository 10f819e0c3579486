use thiserror::Error;

/// Longest slice of user- or model-provided text quoted back in an error.
pub const EXCERPT_LIMIT: usize = 200;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("The AI response could not be interpreted ({message}). Raw response: {excerpt}")]
    ParseFailure { message: String, excerpt: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("SQL generation failed: {0}")]
    SqlGeneration(String),

    #[error("Unsafe query rejected: {reason}. Statement: {excerpt}")]
    UnsafeQueryRejected { reason: String, excerpt: String },

    #[error("No entity type is available for '{category}'. Missing: {}", .missing.join(", "))]
    CategoryUnavailable { category: String, missing: Vec<String> },

    #[error("Execution error: {0}")]
    Execution(String),
}

impl SearchError {
    pub fn parse_failure(message: impl Into<String>, raw: &str) -> Self {
        SearchError::ParseFailure {
            message: message.into(),
            excerpt: excerpt(raw),
        }
    }

    pub fn unsafe_query(reason: impl Into<String>, statement: &str) -> Self {
        SearchError::UnsafeQueryRejected {
            reason: reason.into(),
            excerpt: excerpt(statement),
        }
    }

    /// Short machine-readable tag, kept on error results for the caller.
    pub fn kind(&self) -> &'static str {
        match self {
            SearchError::Configuration(_) => "configuration_error",
            SearchError::Llm(LlmError::ProviderUnavailable(_)) => "provider_unavailable",
            SearchError::Llm(LlmError::AuthenticationFailed(_)) => "authentication_failed",
            SearchError::Llm(LlmError::RateLimited(_)) => "rate_limited",
            SearchError::Llm(LlmError::ProviderError(_)) => "provider_error",
            SearchError::ParseFailure { .. } => "parse_failure",
            SearchError::Validation(ValidationError::UnknownField { .. }) => "unknown_field",
            SearchError::Validation(ValidationError::ComputedFieldNotQueryable { .. }) => {
                "computed_field_not_queryable"
            }
            SearchError::Validation(_) => "validation_error",
            SearchError::SqlGeneration(_) => "sql_generation_error",
            SearchError::UnsafeQueryRejected { .. } => "unsafe_query_rejected",
            SearchError::CategoryUnavailable { .. } => "category_unavailable",
            SearchError::Execution(_) => "execution_error",
        }
    }
}

impl From<StoreError> for SearchError {
    fn from(err: StoreError) -> Self {
        SearchError::Execution(err.to_string())
    }
}

/// Failures of the text-completion service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("LLM authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("LLM rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("LLM provider error: {0}")]
    ProviderError(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("The field \"{field}\" does not exist on {entity_type}. Available fields: {}", .valid_fields.join(", "))]
    UnknownField {
        field: String,
        entity_type: String,
        valid_fields: Vec<String>,
    },

    #[error("The field \"{field}\" on {entity_type} is computed, not stored. Use one of: {}", .valid_fields.join(", "))]
    ComputedFieldNotQueryable {
        field: String,
        entity_type: String,
        valid_fields: Vec<String>,
    },

    #[error("The field \"{field}\" is not available on {entity_type}; search {alternate_entity} instead")]
    FieldOnOtherEntity {
        field: String,
        entity_type: String,
        alternate_entity: String,
    },

    #[error("Unknown entity type \"{0}\"")]
    UnknownEntity(String),

    #[error("Link field {secondary}.{link_field} points to {actual}, not {expected}")]
    LinkTargetMismatch {
        link_field: String,
        secondary: String,
        expected: String,
        actual: String,
    },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Cannot compile filter: {0}")]
    Compile(String),

    #[error("Statement is not read-only")]
    NotReadOnly,

    #[error("Unsupported value: {0}")]
    Conversion(String),
}

pub type Result<T> = std::result::Result<T, SearchError>;

/// Truncate `text` to [`EXCERPT_LIMIT`] characters on a char boundary.
pub fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(EXCERPT_LIMIT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
