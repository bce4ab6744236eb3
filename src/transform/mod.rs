//! Record transformation: schema validation and relevance enrichment.

pub mod enrich;
pub mod scoring;
pub mod validator;

pub use enrich::{Enricher, Enrichment};
pub use scoring::{KeywordScorer, Scorer};
pub use validator::SchemaValidator;
