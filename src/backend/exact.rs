use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{IndexBackend, ItemMetadata, SearchHit, StoreKind, validate_batch};
use crate::error::{RagError, Result};
use crate::model::ChunkId;
use crate::semantic::{decode_embedding_blob, dot, encode_embedding_blob};
use crate::util::{read_json, write_bytes_atomic, write_json_atomic};

const VECTORS_FILE: &str = "vectors.f32";
const IDS_FILE: &str = "ids.json";

pub(super) const PAYLOAD_FILES: &[&str] = &[VECTORS_FILE, IDS_FILE];

#[derive(Debug, Serialize, Deserialize)]
struct IdsFile {
    dim: usize,
    ids: Vec<ChunkId>,
}

/// Flat inner-product index. `vectors` is a contiguous arena of `ids.len() * dim` floats and
/// position `i` of `ids` owns `vectors[i * dim..(i + 1) * dim]`.
pub struct ExactIndex {
    dim: usize,
    vectors: Vec<f32>,
    ids: Vec<ChunkId>,
}

impl ExactIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            vectors: Vec::new(),
            ids: Vec::new(),
        }
    }

    pub fn open(location: &Path) -> Result<Self> {
        let ids_path = location.join(IDS_FILE);
        let ids_file: IdsFile = read_json(&ids_path)?.ok_or_else(|| RagError::CorruptCollection {
            path: ids_path.clone(),
            reason: "id mapping is missing".to_string(),
        })?;

        let vectors_path = location.join(VECTORS_FILE);
        let blob = fs::read(&vectors_path)?;
        let vectors =
            decode_embedding_blob(&blob).ok_or_else(|| RagError::CorruptCollection {
                path: vectors_path.clone(),
                reason: "vector payload is not a whole number of f32 values".to_string(),
            })?;

        if vectors.len() != ids_file.ids.len() * ids_file.dim {
            return Err(RagError::CorruptCollection {
                path: vectors_path,
                reason: format!(
                    "{} floats for {} ids of width {}",
                    vectors.len(),
                    ids_file.ids.len(),
                    ids_file.dim
                ),
            });
        }

        Ok(Self {
            dim: ids_file.dim,
            vectors,
            ids: ids_file.ids,
        })
    }

    fn row(&self, position: usize) -> &[f32] {
        &self.vectors[position * self.dim..(position + 1) * self.dim]
    }

    fn retain_ids(&mut self, drop: &HashSet<ChunkId>) -> usize {
        if drop.is_empty() || !self.ids.iter().any(|id| drop.contains(id)) {
            return 0;
        }

        let mut vectors = Vec::<f32>::with_capacity(self.vectors.len());
        let mut ids = Vec::<ChunkId>::with_capacity(self.ids.len());
        for (position, id) in self.ids.iter().enumerate() {
            if drop.contains(id) {
                continue;
            }
            vectors.extend_from_slice(self.row(position));
            ids.push(*id);
        }

        let removed = self.ids.len() - ids.len();
        self.vectors = vectors;
        self.ids = ids;
        removed
    }
}

impl IndexBackend for ExactIndex {
    fn kind(&self) -> StoreKind {
        StoreKind::Exact
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn add(
        &mut self,
        vectors: &[Vec<f32>],
        chunk_ids: &[ChunkId],
        _metadata: &[ItemMetadata],
    ) -> Result<()> {
        validate_batch(self.dim, vectors, chunk_ids)?;

        let mut last_position = HashMap::<ChunkId, usize>::with_capacity(chunk_ids.len());
        for (position, id) in chunk_ids.iter().enumerate() {
            last_position.insert(*id, position);
        }

        let replaced = last_position.keys().copied().collect::<HashSet<_>>();
        self.retain_ids(&replaced);

        for (position, (vector, id)) in vectors.iter().zip(chunk_ids).enumerate() {
            if last_position.get(id) != Some(&position) {
                continue;
            }
            self.vectors.extend_from_slice(vector);
            self.ids.push(*id);
        }

        Ok(())
    }

    fn remove(&mut self, chunk_ids: &[ChunkId]) -> usize {
        let drop = chunk_ids.iter().copied().collect::<HashSet<_>>();
        self.retain_ids(&drop)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dim {
            return Err(RagError::Dimensionality {
                expected: self.dim,
                actual: query.len(),
            });
        }

        let mut hits = self
            .ids
            .iter()
            .enumerate()
            .map(|(position, id)| SearchHit {
                chunk_id: *id,
                raw_score: dot(self.row(position), query),
            })
            .collect::<Vec<_>>();

        hits.sort_by(|left, right| {
            right
                .raw_score
                .total_cmp(&left.raw_score)
                .then_with(|| left.chunk_id.cmp(&right.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    fn vector(&self, chunk_id: ChunkId) -> Option<Vec<f32>> {
        self.ids
            .iter()
            .position(|id| *id == chunk_id)
            .map(|position| self.row(position).to_vec())
    }

    fn chunk_ids(&self) -> Vec<ChunkId> {
        self.ids.clone()
    }

    fn persist(&self, location: &Path) -> Result<()> {
        write_bytes_atomic(&location.join(VECTORS_FILE), &encode_embedding_blob(&self.vectors))?;
        write_json_atomic(
            &location.join(IDS_FILE),
            &IdsFile {
                dim: self.dim,
                ids: self.ids.clone(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::ExactIndex;
    use crate::backend::IndexBackend;
    use crate::semantic::{dot, l2_normalize};

    fn unit(values: &[f32]) -> Vec<f32> {
        let mut vector = values.to_vec();
        l2_normalize(&mut vector);
        vector
    }

    #[test]
    fn self_inner_product_of_unit_vectors_is_one() {
        let vector = unit(&[0.3, -1.2, 4.0, 0.01]);
        assert!((dot(&vector, &vector) - 1.0).abs() < 1e-6);

        let mut index = ExactIndex::new(4);
        index.add(&[vector.clone()], &[5], &[]).expect("add");
        let hits = index.search(&vector, 1).expect("search");
        assert_eq!(hits[0].chunk_id, 5);
        assert!((hits[0].raw_score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn search_orders_by_score_and_accepts_empty_metadata() {
        let mut index = ExactIndex::new(2);
        index
            .add(
                &[unit(&[1.0, 0.0]), unit(&[0.0, 1.0]), unit(&[1.0, 1.0])],
                &[1, 2, 3],
                &[],
            )
            .expect("add");

        let hits = index.search(&unit(&[1.0, 0.2]), 3).expect("search");
        let ids = hits.iter().map(|hit| hit.chunk_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 3, 2]);
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn upsert_keeps_ids_and_vectors_aligned() {
        let mut index = ExactIndex::new(2);
        index
            .add(&[unit(&[1.0, 0.0]), unit(&[0.0, 1.0])], &[1, 2], &[])
            .expect("add");
        index.add(&[unit(&[0.0, -1.0])], &[1], &[]).expect("replace");

        assert_eq!(index.chunk_ids(), vec![2, 1]);
        assert_eq!(index.vector(1), Some(unit(&[0.0, -1.0])));
        assert_eq!(index.vector(2), Some(unit(&[0.0, 1.0])));

        assert_eq!(index.remove(&[2, 99]), 1);
        assert_eq!(index.chunk_ids(), vec![1]);
    }

    #[test]
    fn persisted_payload_round_trips_and_detects_truncation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = ExactIndex::new(2);
        index
            .add(&[unit(&[1.0, 2.0]), unit(&[3.0, -1.0])], &[7, 8], &[])
            .expect("add");
        index.persist(dir.path()).expect("persist");

        let reopened = ExactIndex::open(dir.path()).expect("open");
        assert_eq!(reopened.chunk_ids(), vec![7, 8]);
        assert_eq!(reopened.vector(8), index.vector(8));

        std::fs::write(dir.path().join("vectors.f32"), [0_u8; 12]).expect("truncate");
        assert!(ExactIndex::open(dir.path()).is_err());
    }
}
