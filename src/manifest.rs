use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::model::{Chunk, ChunkId};
use crate::util::{read_json, sha256_text};

/// Content-hash ledger of a collection: which chunk ids are indexed and the hash of the text
/// each one was embedded from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub chunk_ids: Vec<ChunkId>,
    pub hash_by_chunk_id: BTreeMap<String, String>,
}

impl IndexManifest {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        read_json(path)
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunk_ids.len()
    }

    pub fn hash_for(&self, chunk_id: ChunkId) -> Option<&str> {
        self.hash_by_chunk_id
            .get(&chunk_id.to_string())
            .map(String::as_str)
    }

    pub fn id_set(&self) -> BTreeSet<ChunkId> {
        self.chunk_ids.iter().copied().collect()
    }

    /// `sha256:` digest over `"{chunk_id}:{hash}\n"` lines in chunk id order.
    pub fn checksum(&self) -> String {
        let mut entries = self
            .chunk_ids
            .iter()
            .map(|id| (*id, self.hash_for(*id).unwrap_or_default()))
            .collect::<Vec<_>>();
        entries.sort_by_key(|(id, _)| *id);

        let mut hasher = Sha256::new();
        for (id, hash) in entries {
            hasher.update(format!("{id}:{hash}\n").as_bytes());
        }
        format!("sha256:{:x}", hasher.finalize())
    }

    fn insert(&mut self, chunk_id: ChunkId, hash: String) {
        if self
            .hash_by_chunk_id
            .insert(chunk_id.to_string(), hash)
            .is_none()
        {
            self.chunk_ids.push(chunk_id);
        }
    }

    fn remove(&mut self, chunk_id: ChunkId) {
        if self.hash_by_chunk_id.remove(&chunk_id.to_string()).is_some() {
            self.chunk_ids.retain(|id| *id != chunk_id);
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Leave manifest entries that fell out of the selection in the index.
    #[default]
    Retain,
    /// Remove them from both the index and the manifest.
    Prune,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Changed,
    Rebuild,
}

#[derive(Debug, Clone)]
pub struct ScheduledChunk {
    pub chunk: Chunk,
    pub hash: String,
    pub change: ChangeKind,
}

#[derive(Debug, Clone)]
pub struct ReindexPlan {
    pub scheduled: Vec<ScheduledChunk>,
    pub skipped: usize,
    pub orphans: Vec<ChunkId>,
    pub pruned: Vec<ChunkId>,
    pub next_manifest: IndexManifest,
}

impl ReindexPlan {
    pub fn count(&self, change: ChangeKind) -> usize {
        self.scheduled
            .iter()
            .filter(|item| item.change == change)
            .count()
    }

    pub fn is_noop(&self) -> bool {
        self.scheduled.is_empty() && self.pruned.is_empty()
    }
}

/// Compares the selection against the previous manifest and returns the work to do together
/// with the manifest that will describe the collection once that work is persisted. The
/// previous manifest is never modified.
pub fn plan_reindex(
    previous: Option<&IndexManifest>,
    selection: &[Chunk],
    rebuild: bool,
    orphans: OrphanPolicy,
) -> ReindexPlan {
    let mut next_manifest = match (previous, rebuild) {
        (Some(manifest), false) => manifest.clone(),
        _ => IndexManifest::default(),
    };

    let mut seen = HashSet::<ChunkId>::with_capacity(selection.len());
    let mut scheduled = Vec::<ScheduledChunk>::new();
    let mut skipped = 0usize;

    for chunk in selection {
        if !seen.insert(chunk.id) {
            continue;
        }

        let hash = sha256_text(&chunk.text);
        let change = if rebuild {
            Some(ChangeKind::Rebuild)
        } else {
            match next_manifest.hash_for(chunk.id) {
                None => Some(ChangeKind::New),
                Some(recorded) if recorded != hash => Some(ChangeKind::Changed),
                Some(_) => None,
            }
        };

        match change {
            Some(change) => {
                next_manifest.insert(chunk.id, hash.clone());
                scheduled.push(ScheduledChunk {
                    chunk: chunk.clone(),
                    hash,
                    change,
                });
            }
            None => skipped += 1,
        }
    }

    let orphan_ids = next_manifest
        .chunk_ids
        .iter()
        .copied()
        .filter(|id| !seen.contains(id))
        .collect::<Vec<_>>();

    let pruned = match orphans {
        OrphanPolicy::Retain => Vec::new(),
        OrphanPolicy::Prune => {
            for id in &orphan_ids {
                next_manifest.remove(*id);
            }
            orphan_ids.clone()
        }
    };

    ReindexPlan {
        scheduled,
        skipped,
        orphans: orphan_ids,
        pruned,
        next_manifest,
    }
}
