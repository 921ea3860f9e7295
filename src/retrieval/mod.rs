pub mod http;
pub mod sqlite_fts;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::RetrievedChunk;

/// A configured retrieval backend.
///
/// One instance is shared by every in-flight query of a run, so implementations
/// must tolerate concurrent calls without caller-visible mutable state.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>>;
}

pub use http::HttpSearchRetriever;
pub use sqlite_fts::SqliteFtsRetriever;
