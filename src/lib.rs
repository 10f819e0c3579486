//! Natural-language search over a typed data model.
//!
//! A question is turned into a prompt, answered by a text-completion service,
//! classified into a [`ast::CanonicalQuery`], validated against the live schema
//! and executed read-only against an [`store::EntityStore`].

pub mod ast;
pub mod classifier;
pub mod config;
pub mod demo;
pub mod error;
pub mod executor;
pub mod lexer;
pub mod llm;
pub mod parser;
pub mod prompt;
pub mod schema;
pub mod service;
pub mod sql_compiler;
pub mod sql_fallback;
pub mod store;
pub mod token;
pub mod validator;

pub use ast::CanonicalQuery;
pub use config::SearchConfig;
pub use error::{LlmError, SearchError, StoreError, ValidationError};
pub use executor::{ExecutionResult, ExecutionStatus};
pub use service::{QueryRequest, SearchService};
