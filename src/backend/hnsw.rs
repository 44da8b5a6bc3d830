use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{IndexBackend, ItemMetadata, SearchHit, StoreKind, validate_batch};
use crate::error::{RagError, Result};
use crate::model::ChunkId;
use crate::semantic::{dot, l2_normalize};
use crate::util::{read_json, write_json_atomic};

const INDEX_FILE: &str = "hnsw_index.json";
const MAX_LEVEL: usize = 16;

pub(super) const PAYLOAD_FILES: &[&str] = &[INDEX_FILE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 100,
            ef_search: 64,
            seed: 0x9E37_79B9_7F4A_7C15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    chunk_id: ChunkId,
    vector: Vec<f32>,
    metadata: ItemMetadata,
    links: Vec<Vec<usize>>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: f32,
    node: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.node.cmp(&other.node))
    }
}

/// Layered navigable small-world graph over cosine distance. Replaced or removed items are
/// tombstoned: they keep routing queries through the graph but are never returned.
#[derive(Debug, Serialize, Deserialize)]
pub struct HnswIndex {
    dim: usize,
    params: HnswParams,
    nodes: Vec<Node>,
    entry_point: Option<usize>,
    top_level: usize,
    rng_state: u64,
    #[serde(skip)]
    live: HashMap<ChunkId, usize>,
}

impl HnswIndex {
    pub fn new(dim: usize, params: HnswParams) -> Self {
        Self {
            dim,
            params,
            nodes: Vec::new(),
            entry_point: None,
            top_level: 0,
            rng_state: params.seed.max(1),
            live: HashMap::new(),
        }
    }

    pub fn open(location: &Path) -> Result<Self> {
        let path = location.join(INDEX_FILE);
        let mut index: Self = read_json(&path)?.ok_or_else(|| RagError::CorruptCollection {
            path: path.clone(),
            reason: "graph payload is missing".to_string(),
        })?;

        for (position, node) in index.nodes.iter().enumerate() {
            if node.vector.len() != index.dim
                || node.links.iter().flatten().any(|link| *link >= index.nodes.len())
            {
                return Err(RagError::CorruptCollection {
                    path,
                    reason: format!("node {position} is inconsistent with the graph"),
                });
            }
            if !node.deleted {
                index.live.insert(node.chunk_id, position);
            }
        }

        Ok(index)
    }

    fn next_random(&mut self) -> f64 {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        ((x >> 11) as f64 + 1.0) / (1_u64 << 53) as f64
    }

    fn random_level(&mut self) -> usize {
        let multiplier = 1.0 / (self.params.m.max(2) as f64).ln();
        let level = (-self.next_random().ln() * multiplier).floor() as usize;
        level.min(MAX_LEVEL)
    }

    fn layer_capacity(&self, layer: usize) -> usize {
        let m = self.params.m.max(2);
        if layer == 0 { m * 2 } else { m }
    }

    fn distance_to(&self, query: &[f32], node: usize) -> f32 {
        1.0 - dot(query, &self.nodes[node].vector)
    }

    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[usize],
        ef: usize,
        layer: usize,
    ) -> Vec<Candidate> {
        let mut visited = HashSet::<usize>::new();
        let mut frontier = BinaryHeap::<Reverse<Candidate>>::new();
        let mut nearest = BinaryHeap::<Candidate>::new();

        for &node in entry_points {
            if visited.insert(node) {
                let candidate = Candidate {
                    distance: self.distance_to(query, node),
                    node,
                };
                frontier.push(Reverse(candidate));
                nearest.push(candidate);
            }
        }
        while nearest.len() > ef {
            nearest.pop();
        }

        while let Some(Reverse(current)) = frontier.pop() {
            if let Some(worst) = nearest.peek()
                && nearest.len() >= ef
                && current.distance > worst.distance
            {
                break;
            }

            let Some(links) = self.nodes[current.node].links.get(layer) else {
                continue;
            };
            for &neighbor in links {
                if !visited.insert(neighbor) {
                    continue;
                }
                let candidate = Candidate {
                    distance: self.distance_to(query, neighbor),
                    node: neighbor,
                };
                let admit = nearest.len() < ef
                    || nearest
                        .peek()
                        .is_some_and(|worst| candidate.distance < worst.distance);
                if admit {
                    frontier.push(Reverse(candidate));
                    nearest.push(candidate);
                    if nearest.len() > ef {
                        nearest.pop();
                    }
                }
            }
        }

        nearest.into_sorted_vec()
    }

    fn greedy_descend(&self, query: &[f32], mut entry: usize, from: usize, to: usize) -> usize {
        for layer in (to..=from).rev() {
            if let Some(best) = self.search_layer(query, &[entry], 1, layer).first() {
                entry = best.node;
            }
        }
        entry
    }

    fn prune_links(&mut self, node: usize, layer: usize) {
        let capacity = self.layer_capacity(layer);
        if self.nodes[node].links[layer].len() <= capacity {
            return;
        }

        let base = self.nodes[node].vector.clone();
        let mut ranked = self.nodes[node].links[layer]
            .iter()
            .map(|&neighbor| Candidate {
                distance: self.distance_to(&base, neighbor),
                node: neighbor,
            })
            .collect::<Vec<_>>();
        ranked.sort();
        ranked.truncate(capacity);
        self.nodes[node].links[layer] = ranked.into_iter().map(|candidate| candidate.node).collect();
    }

    fn insert(&mut self, vector: Vec<f32>, chunk_id: ChunkId, metadata: ItemMetadata) {
        if let Some(previous) = self.live.remove(&chunk_id) {
            self.nodes[previous].deleted = true;
        }

        let level = self.random_level();
        let position = self.nodes.len();
        self.nodes.push(Node {
            chunk_id,
            vector,
            metadata,
            links: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.live.insert(chunk_id, position);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(position);
            self.top_level = level;
            return;
        };

        let query = self.nodes[position].vector.clone();
        let mut entry_points = vec![if level < self.top_level {
            self.greedy_descend(&query, entry, self.top_level, level + 1)
        } else {
            entry
        }];

        for layer in (0..=level.min(self.top_level)).rev() {
            let candidates =
                self.search_layer(&query, &entry_points, self.params.ef_construction, layer);
            let neighbors = candidates
                .iter()
                .take(self.params.m.max(2))
                .map(|candidate| candidate.node)
                .collect::<Vec<_>>();

            self.nodes[position].links[layer] = neighbors.clone();
            for neighbor in neighbors {
                self.nodes[neighbor].links[layer].push(position);
                self.prune_links(neighbor, layer);
            }

            entry_points = candidates.iter().map(|candidate| candidate.node).collect();
        }

        if level > self.top_level {
            self.entry_point = Some(position);
            self.top_level = level;
        }
    }

    fn tombstones(&self) -> usize {
        self.nodes.len() - self.live.len()
    }

    /// A fresh graph holding only the live nodes, inserted in their current order.
    fn compacted(&self) -> Self {
        let mut compacted = Self::new(self.dim, self.params);
        compacted.rng_state = self.rng_state;
        for node in self.nodes.iter().filter(|node| !node.deleted) {
            compacted.insert(node.vector.clone(), node.chunk_id, node.metadata.clone());
        }
        compacted
    }
}

impl IndexBackend for HnswIndex {
    fn kind(&self) -> StoreKind {
        StoreKind::Approximate
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.live.len()
    }

    fn add(
        &mut self,
        vectors: &[Vec<f32>],
        chunk_ids: &[ChunkId],
        metadata: &[ItemMetadata],
    ) -> Result<()> {
        validate_batch(self.dim, vectors, chunk_ids)?;

        if metadata.len() != chunk_ids.len() {
            return Err(RagError::BackendAcceptance {
                backend: "approximate",
                position: metadata.len().min(chunk_ids.len()),
                reason: format!(
                    "{} metadata entries for {} items; every item needs one",
                    metadata.len(),
                    chunk_ids.len()
                ),
            });
        }

        for (position, (item, chunk_id)) in metadata.iter().zip(chunk_ids).enumerate() {
            match item.get("chunk_id").map(|value| value.trim()) {
                Some(value) if value == chunk_id.to_string() => {}
                Some(value) if !value.is_empty() => {
                    return Err(RagError::BackendAcceptance {
                        backend: "approximate",
                        position,
                        reason: format!("metadata chunk_id '{value}' does not match {chunk_id}"),
                    });
                }
                _ => {
                    return Err(RagError::BackendAcceptance {
                        backend: "approximate",
                        position,
                        reason: "metadata lacks a chunk_id entry".to_string(),
                    });
                }
            }
        }

        for ((vector, chunk_id), item) in vectors.iter().zip(chunk_ids).zip(metadata) {
            let mut normalized = vector.clone();
            l2_normalize(&mut normalized);
            self.insert(normalized, *chunk_id, item.clone());
        }

        Ok(())
    }

    fn remove(&mut self, chunk_ids: &[ChunkId]) -> usize {
        let mut removed = 0usize;
        for chunk_id in chunk_ids {
            if let Some(position) = self.live.remove(chunk_id) {
                self.nodes[position].deleted = true;
                removed += 1;
            }
        }
        removed
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dim {
            return Err(RagError::Dimensionality {
                expected: self.dim,
                actual: query.len(),
            });
        }
        let Some(entry) = self.entry_point else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut normalized = query.to_vec();
        l2_normalize(&mut normalized);

        let entry = self.greedy_descend(&normalized, entry, self.top_level, 1);
        let ef = self.params.ef_search.max(k) + self.tombstones().min(self.nodes.len());
        let hits = self
            .search_layer(&normalized, &[entry], ef, 0)
            .into_iter()
            .filter(|candidate| !self.nodes[candidate.node].deleted)
            .take(k)
            .map(|candidate| SearchHit {
                chunk_id: self.nodes[candidate.node].chunk_id,
                raw_score: candidate.distance,
            })
            .collect();

        Ok(hits)
    }

    fn vector(&self, chunk_id: ChunkId) -> Option<Vec<f32>> {
        self.live
            .get(&chunk_id)
            .map(|position| self.nodes[*position].vector.clone())
    }

    fn chunk_ids(&self) -> Vec<ChunkId> {
        self.nodes
            .iter()
            .filter(|node| !node.deleted)
            .map(|node| node.chunk_id)
            .collect()
    }

    /// Once tombstones outnumber live nodes the graph is rebuilt from the live nodes
    /// before it is written.
    fn persist(&self, location: &Path) -> Result<()> {
        if self.tombstones() > self.live.len() {
            let compacted = self.compacted();
            debug!(
                live = compacted.nodes.len(),
                dropped = self.tombstones(),
                "approximate graph compacted"
            );
            return write_json_atomic(&location.join(INDEX_FILE), &compacted);
        }
        write_json_atomic(&location.join(INDEX_FILE), self)
    }

    fn set_search_breadth(&mut self, ef_search: usize) {
        self.params.ef_search = ef_search.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::{HnswIndex, HnswParams};
    use crate::backend::{IndexBackend, ItemMetadata, chunk_metadata};
    use crate::error::RagError;
    use crate::semantic::l2_normalize;

    fn random_vectors(count: usize, dim: usize) -> Vec<Vec<f32>> {
        let mut state = 0x2545_F491_4F6C_DD1D_u64;
        (0..count)
            .map(|_| {
                let mut vector = (0..dim)
                    .map(|_| {
                        state ^= state << 13;
                        state ^= state >> 7;
                        state ^= state << 17;
                        (state >> 40) as f32 / (1_u64 << 24) as f32 - 0.5
                    })
                    .collect::<Vec<f32>>();
                l2_normalize(&mut vector);
                vector
            })
            .collect()
    }

    fn build(vectors: &[Vec<f32>]) -> HnswIndex {
        let ids = (1..=vectors.len() as i64).collect::<Vec<_>>();
        let metadata = ids.iter().map(|id| chunk_metadata(*id)).collect::<Vec<_>>();
        let mut index = HnswIndex::new(vectors[0].len(), HnswParams::default());
        index.add(vectors, &ids, &metadata).expect("add");
        index
    }

    #[test]
    fn empty_metadata_is_rejected_and_chunk_id_metadata_accepted() {
        let mut index = HnswIndex::new(2, HnswParams::default());
        let err = index
            .add(&[vec![1.0, 0.0]], &[1], &[ItemMetadata::new()])
            .expect_err("empty metadata");
        assert!(matches!(err, RagError::BackendAcceptance { .. }));

        let err = index.add(&[vec![1.0, 0.0]], &[1], &[]).expect_err("missing metadata");
        assert!(matches!(err, RagError::BackendAcceptance { .. }));
        assert_eq!(index.len(), 0);

        let metadata = ItemMetadata::from([("chunk_id".to_string(), "1".to_string())]);
        index.add(&[vec![1.0, 0.0]], &[1], &[metadata]).expect("accepted");
        assert_eq!(index.chunk_ids(), vec![1]);
    }

    #[test]
    fn distances_are_cosine_distances() {
        let index = build(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![-1.0, 0.0]]);
        let hits = index.search(&[2.0, 0.0], 3).expect("search");

        assert_eq!(hits.iter().map(|hit| hit.chunk_id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(hits[0].raw_score.abs() < 1e-6);
        assert!((hits[1].raw_score - 1.0).abs() < 1e-6);
        assert!((hits[2].raw_score - 2.0).abs() < 1e-6);
    }

    #[test]
    fn self_queries_find_themselves() {
        let vectors = random_vectors(200, 32);
        let index = build(&vectors);

        let found = vectors
            .iter()
            .enumerate()
            .filter(|(position, vector)| {
                index
                    .search(vector, 1)
                    .ok()
                    .and_then(|hits| hits.first().map(|hit| hit.chunk_id))
                    == Some(*position as i64 + 1)
            })
            .count();
        assert!(found >= 190, "self recall too low: {found}/200");
    }

    #[test]
    fn replaced_and_removed_items_are_never_returned() {
        let vectors = random_vectors(30, 8);
        let mut index = build(&vectors);

        index
            .add(&[vectors[1].clone()], &[1], &[chunk_metadata(1)])
            .expect("replace");
        assert_eq!(index.len(), 30);
        assert_eq!(index.remove(&[2, 3]), 2);
        assert_eq!(index.len(), 28);

        let hits = index.search(&vectors[2], 30).expect("search");
        assert_eq!(hits.len(), 28);
        assert!(hits.iter().all(|hit| hit.chunk_id != 2 && hit.chunk_id != 3));
        assert_eq!(hits.iter().filter(|hit| hit.chunk_id == 1).count(), 1);
    }

    #[test]
    fn persisting_a_mostly_deleted_graph_drops_its_tombstones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vectors = random_vectors(30, 8);
        let mut index = build(&vectors);
        index
            .add(&vectors[..5], &[1, 2, 3, 4, 5], &(1..=5).map(chunk_metadata).collect::<Vec<_>>())
            .expect("replace");
        assert_eq!(index.remove(&(11..=30).collect::<Vec<_>>()), 20);
        assert_eq!(index.nodes.len(), 35);
        assert_eq!(index.tombstones(), 25);

        index.persist(dir.path()).expect("persist");
        let reopened = HnswIndex::open(dir.path()).expect("open");
        assert_eq!(reopened.nodes.len(), 10);
        assert_eq!(reopened.tombstones(), 0);
        assert_eq!(reopened.chunk_ids(), index.chunk_ids());
        assert_eq!(reopened.params, index.params);

        for (position, vector) in vectors.iter().take(10).enumerate() {
            let hits = reopened.search(vector, 10).expect("search");
            assert_eq!(hits.len(), 10);
            assert_eq!(hits[0].chunk_id, position as i64 + 1);
        }
    }

    #[test]
    fn persisted_graph_reopens_with_identical_results() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vectors = random_vectors(50, 16);
        let mut index = build(&vectors);
        index.remove(&[4]);
        index.persist(dir.path()).expect("persist");

        let reopened = HnswIndex::open(dir.path()).expect("open");
        assert_eq!(reopened.len(), 49);
        assert_eq!(reopened.params, index.params);
        for vector in vectors.iter().take(10) {
            assert_eq!(
                reopened.search(vector, 5).expect("search"),
                index.search(vector, 5).expect("search")
            );
        }
    }
}
