//! Adaptive multi-query retrieval and study-pack generation.

mod index;
mod multi_query;
mod refine;
mod rewrite;
mod study_pack;

pub use index::{DocRecord, IndexHit, VectorIndex};
pub use multi_query::{aggregate_by_group, fanout_queries, retrieve, HYDE_QUERY_MARKER};
pub use refine::{ensure_terms, evaluate_query, select_query};
pub use rewrite::{fallback_query, rewrite_query};
pub use study_pack::{SimilarPipeline, SimilarRequest};
