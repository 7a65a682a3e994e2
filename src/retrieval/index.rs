//! Flat vector index over the passage corpus.
//!
//! Storage is deliberately plain: a row-major little-endian f32 file plus a
//! JSONL metadata file, one record per row. The corpus is small enough that
//! brute-force cosine over normalized rows beats carrying an ANN dependency.

use crate::models::{ConfigError, Result, RetrievalConfig, TekmerionError};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;
use tracing::info;

/// Metadata for one indexed passage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocRecord {
    /// Source-passage cluster id; dedup unit for retrieval
    pub group_id: String,
    pub title: String,
    pub passage: String,
    #[serde(default)]
    pub topic: Option<String>,
}

/// One scored index hit.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub row: usize,
    pub score: f64,
}

/// In-memory vector index with row-aligned metadata.
#[derive(Debug)]
pub struct VectorIndex {
    dim: usize,
    /// Row-major, L2-normalized at load
    vectors: Vec<f32>,
    records: Vec<DocRecord>,
}

impl VectorIndex {
    /// Load and validate the index at startup.
    ///
    /// Row count must match the metadata line count and the byte length must
    /// factor exactly into `embed_dim`-sized rows; anything else is a
    /// configuration error, not a runtime condition.
    pub fn load(config: &RetrievalConfig) -> Result<Self> {
        let bytes = std::fs::read(&config.index_path).map_err(|e| {
            TekmerionError::io(format!("reading {}", config.index_path.display()), e)
        })?;
        let records = read_metadata(&config.metadata_path)?;

        let dim = config.embed_dim;
        if dim == 0 {
            return Err(ConfigError::DimensionMismatch {
                index_dim: 0,
                embed_dim: 0,
            }
            .into());
        }
        let expected = records.len() * dim * 4;
        if bytes.len() != expected {
            let index_dim = if records.is_empty() {
                0
            } else {
                bytes.len() / (records.len() * 4)
            };
            return Err(ConfigError::DimensionMismatch {
                index_dim,
                embed_dim: dim,
            }
            .into());
        }

        let mut vectors = Vec::with_capacity(records.len() * dim);
        for chunk in bytes.chunks_exact(4) {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(chunk);
            vectors.push(f32::from_le_bytes(buf));
        }

        for row in vectors.chunks_exact_mut(dim) {
            normalize(row);
        }

        info!(
            rows = records.len(),
            dim = dim,
            path = %config.index_path.display(),
            "Vector index loaded"
        );

        Ok(Self {
            dim,
            vectors,
            records,
        })
    }

    /// Build an index from rows already in memory. Rows are normalized.
    pub fn from_rows(dim: usize, rows: Vec<Vec<f32>>, records: Vec<DocRecord>) -> Result<Self> {
        if dim == 0 {
            return Err(ConfigError::DimensionMismatch {
                index_dim: 0,
                embed_dim: 0,
            }
            .into());
        }
        if rows.len() != records.len() {
            return Err(TekmerionError::Internal(format!(
                "{} vectors for {} records",
                rows.len(),
                records.len()
            )));
        }
        let mut vectors = Vec::with_capacity(rows.len() * dim);
        for row in rows {
            if row.len() != dim {
                return Err(ConfigError::DimensionMismatch {
                    index_dim: row.len(),
                    embed_dim: dim,
                }
                .into());
            }
            vectors.extend(row);
        }
        for row in vectors.chunks_exact_mut(dim) {
            normalize(row);
        }
        Ok(Self {
            dim,
            vectors,
            records,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn record(&self, row: usize) -> Option<&DocRecord> {
        self.records.get(row)
    }

    /// Top-k rows by cosine similarity to the query.
    ///
    /// The query is normalized here, so similarity reduces to a dot product
    /// against the pre-normalized rows.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<IndexHit> {
        if query.len() != self.dim || k == 0 || self.is_empty() {
            return Vec::new();
        }
        let mut q = query.to_vec();
        normalize(&mut q);

        let mut hits: Vec<IndexHit> = self
            .vectors
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(row, vec)| IndexHit {
                row,
                score: dot(&q, vec),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        hits
    }
}

fn read_metadata(path: &Path) -> Result<Vec<DocRecord>> {
    let file = std::fs::File::open(path)
        .map_err(|e| TekmerionError::io(format!("reading {}", path.display()), e))?;
    let reader = std::io::BufReader::new(file);

    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line =
            line.map_err(|e| TekmerionError::io(format!("reading {}", path.display()), e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: DocRecord = serde_json::from_str(&line).map_err(|e| {
            TekmerionError::ParseError(format!(
                "{} line {}: {e}",
                path.display(),
                line_no + 1
            ))
        })?;
        records.push(record);
    }
    Ok(records)
}

fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}
