//! # askql
//!
//! Natural-language question answering over a BigQuery-style warehouse.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Question (NL)                         │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [resolver: synonyms, metrics, exemplars]
//! ┌─────────────────────────────────────────────────────────┐
//! │        ResolvedContext (RDF graph + vector store)        │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [prompt builder + LLM client]
//! ┌─────────────────────────────────────────────────────────┐
//! │               Candidate SQL + explanation                │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [repair passes + dry-run retry loop]
//! ┌─────────────────────────────────────────────────────────┐
//! │            Validated SqlArtifact (cached)                │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [executor + formatter]
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Formatted result rows                   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod catalog;
pub mod config;
pub mod embedding;
pub mod error;
pub mod format;
pub mod knowledge;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod repair;
pub mod resolver;
pub mod validate;
pub mod vector;
pub mod warehouse;

pub use error::{CoreError, CoreResult};
pub use pipeline::{Engine, ExecutionResult, Services, SqlArtifact};
