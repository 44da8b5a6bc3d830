mod exact;
mod hnsw;

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::model::ChunkId;

pub use exact::ExactIndex;
pub use hnsw::{HnswIndex, HnswParams};

pub type ItemMetadata = BTreeMap<String, String>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Flat inner-product scan over unit vectors.
    #[value(alias = "faiss", alias = "flat")]
    Exact,
    /// HNSW graph with cosine distance.
    #[value(alias = "chroma", alias = "hnsw")]
    Approximate,
}

impl StoreKind {
    pub const ALL: [StoreKind; 2] = [StoreKind::Exact, StoreKind::Approximate];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Approximate => "approximate",
        }
    }

    /// Maps a backend raw score onto [0, 1]. Exact scores are inner products in [-1, 1];
    /// approximate scores are cosine distances in [0, 2]. Floating-point drift past either
    /// range is clamped.
    pub fn normalize_score(self, raw: f32) -> f64 {
        let raw = f64::from(raw);
        let similarity = match self {
            Self::Exact => (raw + 1.0) / 2.0,
            Self::Approximate => 1.0 - raw,
        };
        if similarity.is_nan() {
            return 0.0;
        }
        similarity.clamp(0.0, 1.0)
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub raw_score: f32,
}

pub trait IndexBackend: Send + Sync {
    fn kind(&self) -> StoreKind;
    fn dim(&self) -> usize;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts or replaces one vector per chunk id. The batch is validated as a whole before
    /// anything is mutated.
    fn add(
        &mut self,
        vectors: &[Vec<f32>],
        chunk_ids: &[ChunkId],
        metadata: &[ItemMetadata],
    ) -> Result<()>;

    fn remove(&mut self, chunk_ids: &[ChunkId]) -> usize;
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>>;
    fn vector(&self, chunk_id: ChunkId) -> Option<Vec<f32>>;
    fn chunk_ids(&self) -> Vec<ChunkId>;
    fn persist(&self, location: &Path) -> Result<()>;

    fn set_search_breadth(&mut self, _ef_search: usize) {}
}

pub fn create_or_open(
    kind: StoreKind,
    location: &Path,
    dim: usize,
    params: HnswParams,
) -> Result<Box<dyn IndexBackend>> {
    if has_payload(kind, location) {
        let backend = open_existing(kind, location)?;
        if backend.dim() != dim {
            return Err(RagError::Dimensionality {
                expected: backend.dim(),
                actual: dim,
            });
        }
        return Ok(backend);
    }

    Ok(match kind {
        StoreKind::Exact => Box::new(ExactIndex::new(dim)),
        StoreKind::Approximate => Box::new(HnswIndex::new(dim, params)),
    })
}

pub fn open_existing(kind: StoreKind, location: &Path) -> Result<Box<dyn IndexBackend>> {
    Ok(match kind {
        StoreKind::Exact => Box::new(ExactIndex::open(location)?),
        StoreKind::Approximate => Box::new(HnswIndex::open(location)?),
    })
}

pub fn has_payload(kind: StoreKind, location: &Path) -> bool {
    payload_files(kind)
        .iter()
        .all(|name| location.join(name).is_file())
}

/// Removes the backend payload files from a collection directory.
pub fn delete(kind: StoreKind, location: &Path) -> Result<()> {
    for name in payload_files(kind) {
        match fs::remove_file(location.join(name)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn payload_files(kind: StoreKind) -> &'static [&'static str] {
    match kind {
        StoreKind::Exact => exact::PAYLOAD_FILES,
        StoreKind::Approximate => hnsw::PAYLOAD_FILES,
    }
}

pub fn chunk_metadata(chunk_id: ChunkId) -> ItemMetadata {
    ItemMetadata::from([("chunk_id".to_string(), chunk_id.to_string())])
}

fn validate_batch(
    dim: usize,
    vectors: &[Vec<f32>],
    chunk_ids: &[ChunkId],
) -> Result<()> {
    if vectors.len() != chunk_ids.len() {
        return Err(RagError::InvalidRequest(format!(
            "{} vectors supplied for {} chunk ids",
            vectors.len(),
            chunk_ids.len()
        )));
    }

    if let Some(vector) = vectors.iter().find(|vector| vector.len() != dim) {
        return Err(RagError::Dimensionality {
            expected: dim,
            actual: vector.len(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{StoreKind, create_or_open, delete, has_payload, HnswParams};

    #[test]
    fn exact_normalization_is_bounded_and_monotonic() {
        let mut previous = -1.0_f64;
        for step in 0..=200 {
            let raw = -1.0 + step as f32 * 0.01;
            let similarity = StoreKind::Exact.normalize_score(raw);
            assert!((0.0..=1.0).contains(&similarity));
            assert!(similarity >= previous);
            previous = similarity;
        }
        assert_eq!(StoreKind::Exact.normalize_score(1.000_01), 1.0);
        assert_eq!(StoreKind::Exact.normalize_score(-1.000_01), 0.0);
    }

    #[test]
    fn approximate_normalization_is_one_minus_distance() {
        for step in 0..=100 {
            let distance = step as f32 * 0.01;
            let similarity = StoreKind::Approximate.normalize_score(distance);
            assert!((similarity - (1.0 - f64::from(distance))).abs() < 1e-6);
        }
        for step in 100..=200 {
            let similarity = StoreKind::Approximate.normalize_score(step as f32 * 0.01);
            assert!((0.0..=1.0).contains(&similarity));
        }
        assert_eq!(StoreKind::Approximate.normalize_score(-0.000_1), 1.0);
    }

    #[test]
    fn payload_lifecycle_per_backend() {
        for kind in StoreKind::ALL {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut backend =
                create_or_open(kind, dir.path(), 3, HnswParams::default()).expect("create");
            backend
                .add(
                    &[vec![1.0, 0.0, 0.0]],
                    &[11],
                    &[super::chunk_metadata(11)],
                )
                .expect("add");
            backend.persist(dir.path()).expect("persist");
            assert!(has_payload(kind, dir.path()));

            let reopened = create_or_open(kind, dir.path(), 3, HnswParams::default())
                .expect("reopen");
            assert_eq!(reopened.chunk_ids(), vec![11]);
            assert!(create_or_open(kind, dir.path(), 4, HnswParams::default()).is_err());

            delete(kind, dir.path()).expect("delete");
            assert!(!has_payload(kind, dir.path()));
        }
    }
}
