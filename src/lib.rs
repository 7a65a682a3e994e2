//! tekmerion - Evidence-grounded reading-comprehension item generation.
//!
//! ## Architecture
//!
//! tekmerion drives two pipelines over one OpenAI-compatible endpoint:
//! - **Item pipeline**: Draft passage → draft choices + score quality →
//!   link evidence → verify → bounded repair rounds
//! - **Similar pipeline**: Rewrite query → evaluate/refine under hysteresis →
//!   multi-query retrieval → paraphrased study pack
//!
//! ## Design
//!
//! - Capabilities (generation, verification, quality, embeddings) are traits,
//!   so orchestration is exercised against in-memory implementations
//! - Model output crosses one strict parse boundary; malformed output takes
//!   an explicit fallback branch, never an abort
//! - Repair and regeneration are hard-bounded; running out marks a result
//!   `exhausted` instead of failing it

pub mod capability;
pub mod client;
pub mod evidence;
pub mod models;
pub mod pipeline;
pub mod retrieval;

// Re-exports for convenience
pub use capability::{Difficulty, Embedder, Generator, QualityScorer, Verifier};
pub use client::{LlmClient, RateLimiter};
pub use models::{Config, GenerationResult, Result, StudyPackResult, TekmerionError};
pub use pipeline::{GenerateRequest, Orchestrator};
pub use retrieval::{SimilarPipeline, SimilarRequest, VectorIndex};
