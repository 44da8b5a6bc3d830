use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::backend::{self, HnswParams, IndexBackend, ItemMetadata, StoreKind, chunk_metadata};
use crate::chunk_store::ChunkStore;
use crate::collection::{
    BuildLock, CollectionLayout, IndexMeta, MANIFEST_FILE, META_FILE, resolve_collection_name,
};
use crate::commands::query::{QueryRequest, QueryResponse, RetrievalService};
use crate::error::{RagError, Result};
use crate::manifest::{ChangeKind, OrphanPolicy, ReindexPlan, ScheduledChunk, plan_reindex};
use crate::model::{Chunk, ChunkFilter, ChunkId};
use crate::semantic::{DEFAULT_BATCH_SIZE, EmbeddingProvider, EncodeRole, ModelResolver};
use crate::util::{now_utc_string, write_json_atomic};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStage {
    Selecting,
    Planning,
    Embedding,
    Persisting,
    SmokeTesting,
    Done,
    Failed,
}

impl BuildStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Selecting => "SELECTING",
            Self::Planning => "PLANNING",
            Self::Embedding => "EMBEDDING",
            Self::Persisting => "PERSISTING",
            Self::SmokeTesting => "SMOKE_TESTING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Committed,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub store: StoreKind,
    pub model: String,
    pub collection: Option<String>,
    pub filter: ChunkFilter,
    pub batch_size: usize,
    pub rebuild: bool,
    pub orphans: OrphanPolicy,
    pub hnsw: HnswParams,
    pub smoke_query: Option<String>,
    pub smoke_k: usize,
    pub notes: Option<String>,
}

impl BuildRequest {
    pub fn new(store: StoreKind, model: &str) -> Self {
        Self {
            store,
            model: model.to_string(),
            collection: None,
            filter: ChunkFilter::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            rebuild: false,
            orphans: OrphanPolicy::Retain,
            hnsw: HnswParams::default(),
            smoke_query: None,
            smoke_k: 5,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildCounts {
    pub selected: usize,
    pub scheduled: usize,
    pub new: usize,
    pub changed: usize,
    pub rebuilt: usize,
    pub skipped: usize,
    pub orphans: usize,
    pub pruned: usize,
    pub embedded: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub collection: String,
    pub store: StoreKind,
    pub path: PathBuf,
    pub outcome: BuildOutcome,
    pub stages: Vec<BuildStage>,
    pub counts: BuildCounts,
    pub n_chunks: usize,
    pub meta: Option<IndexMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoke: Option<QueryResponse>,
}

struct StageTrail {
    collection: String,
    stages: Vec<BuildStage>,
}

impl StageTrail {
    fn enter(&mut self, stage: BuildStage) {
        info!(collection = %self.collection, stage = stage.as_str(), "build stage");
        self.stages.push(stage);
    }

    fn current(&self) -> BuildStage {
        self.stages.last().copied().unwrap_or(BuildStage::Selecting)
    }

    fn fail(&mut self, err: &RagError) {
        let failed_in = self.current();
        error!(
            collection = %self.collection,
            stage = BuildStage::Failed.as_str(),
            failed_in = failed_in.as_str(),
            error = %err,
            "build failed"
        );
        self.stages.push(BuildStage::Failed);
    }
}

/// Drives one build of one collection: selection, planning, embedding, persistence and an
/// optional smoke query. Nothing becomes visible until the staged collection is swapped in.
pub struct IndexOrchestrator<'a> {
    models_dir: PathBuf,
    chunk_store: &'a ChunkStore,
    models: &'a dyn ModelResolver,
}

impl<'a> IndexOrchestrator<'a> {
    pub fn new(models_dir: &Path, chunk_store: &'a ChunkStore, models: &'a dyn ModelResolver) -> Self {
        Self {
            models_dir: models_dir.to_path_buf(),
            chunk_store,
            models,
        }
    }

    pub fn build(&self, request: &BuildRequest) -> Result<BuildReport> {
        let name = resolve_collection_name(
            request.collection.as_deref(),
            request.filter.run_id,
            request.filter.source_id,
        )?;
        let layout = CollectionLayout::new(&self.models_dir, request.store, &name)?;
        let _lock = BuildLock::acquire(&layout)?;

        let mut trail = StageTrail {
            collection: name.clone(),
            stages: Vec::new(),
        };
        let result = self.build_locked(request, &layout, &mut trail);
        match &result {
            Err(err) if err.is_informational() => {
                info!(collection = %name, error = %err, "nothing to build");
            }
            Err(err) => trail.fail(err),
            Ok(_) => {}
        }
        result
    }

    fn build_locked(
        &self,
        request: &BuildRequest,
        layout: &CollectionLayout,
        trail: &mut StageTrail,
    ) -> Result<BuildReport> {
        let started = Instant::now();
        let mut counts = BuildCounts::default();

        trail.enter(BuildStage::Selecting);
        let selection = self.chunk_store.select_chunks(&request.filter)?;
        counts.selected = selection.len();

        let previous_meta = layout.try_load_meta()?;
        let previous_manifest = if request.rebuild {
            None
        } else {
            layout.load_manifest()?
        };

        if selection.is_empty() && !request.rebuild {
            if previous_manifest.is_none() {
                return Err(RagError::EmptySelection {
                    filters: request.filter.describe(),
                });
            }
            info!(collection = %layout.name(), "empty selection against an existing manifest; nothing to do");
            trail.enter(BuildStage::Done);
            return Ok(self.unchanged_report(layout, trail, counts, previous_meta));
        }

        let provider = self
            .models
            .resolve(&request.model)?
            .with_batch_size(request.batch_size);
        if !request.rebuild
            && let Some(meta) = &previous_meta
        {
            meta.ensure_model(Some(provider.model_id()))?;
        }

        trail.enter(BuildStage::Planning);
        let plan = plan_reindex(
            previous_manifest.as_ref(),
            &selection,
            request.rebuild,
            request.orphans,
        );
        counts.scheduled = plan.scheduled.len();
        counts.new = plan.count(ChangeKind::New);
        counts.changed = plan.count(ChangeKind::Changed);
        counts.rebuilt = plan.count(ChangeKind::Rebuild);
        counts.skipped = plan.skipped;
        counts.orphans = plan.orphans.len();
        counts.pruned = plan.pruned.len();
        info!(
            collection = %layout.name(),
            n_selected = counts.selected,
            n_reindex = counts.scheduled,
            n_new = counts.new,
            n_changed = counts.changed,
            n_skipped = counts.skipped,
            n_orphans = counts.orphans,
            n_pruned = counts.pruned,
            "reindex plan computed"
        );
        if counts.orphans > 0 && request.orphans == OrphanPolicy::Retain {
            warn!(
                collection = %layout.name(),
                orphans = counts.orphans,
                "indexed chunks are no longer selected and are retained"
            );
        }

        if !request.rebuild && plan.is_noop() && layout.exists() {
            trail.enter(BuildStage::Done);
            return Ok(self.unchanged_report(layout, trail, counts, previous_meta));
        }

        trail.enter(BuildStage::Embedding);
        let vectors = embed_scheduled(&provider, &plan.scheduled, &mut counts)
            .map_err(|err| partial_failure(BuildStage::Embedding, &counts, err))?;

        trail.enter(BuildStage::Persisting);
        let meta = self
            .persist(request, layout, &provider, &plan, &vectors, &selection, started)
            .map_err(|err| {
                layout.discard_staging();
                partial_failure(BuildStage::Persisting, &counts, err)
            })?;
        info!(
            collection = %meta.collection,
            store = %meta.store,
            n_chunks = meta.n_chunks,
            checksum = %meta.checksum,
            duration_sec = meta.duration_sec,
            "collection committed"
        );

        let smoke = match request.smoke_query.as_deref().map(str::trim) {
            Some(query) if !query.is_empty() => {
                trail.enter(BuildStage::SmokeTesting);
                Some(self.smoke_query(layout, query, request.smoke_k)?)
            }
            _ => None,
        };

        trail.enter(BuildStage::Done);
        Ok(BuildReport {
            collection: layout.name().to_string(),
            store: layout.store(),
            path: layout.dir(),
            outcome: BuildOutcome::Committed,
            stages: trail.stages.clone(),
            counts,
            n_chunks: meta.n_chunks,
            meta: Some(meta),
            smoke,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn persist(
        &self,
        request: &BuildRequest,
        layout: &CollectionLayout,
        provider: &EmbeddingProvider,
        plan: &ReindexPlan,
        vectors: &[Vec<f32>],
        selection: &[Chunk],
        started: Instant,
    ) -> Result<IndexMeta> {
        let staging = layout.prepare_staging()?;
        let mut index: Box<dyn IndexBackend> = if request.rebuild {
            backend::delete(request.store, &staging)?;
            backend::create_or_open(request.store, &staging, provider.dim(), request.hnsw)?
        } else {
            backend::create_or_open(request.store, &layout.dir(), provider.dim(), request.hnsw)?
        };

        index.remove(&plan.pruned);
        let chunk_ids = plan
            .scheduled
            .iter()
            .map(|item| item.chunk.id)
            .collect::<Vec<ChunkId>>();
        let metadata = plan
            .scheduled
            .iter()
            .map(|item| item_metadata(&item.chunk))
            .collect::<Vec<ItemMetadata>>();
        index.add(vectors, &chunk_ids, &metadata)?;

        let indexed = index.chunk_ids().into_iter().collect::<BTreeSet<ChunkId>>();
        let expected = plan.next_manifest.id_set();
        if indexed != expected {
            return Err(RagError::CorruptCollection {
                path: staging,
                reason: format!(
                    "index holds {} chunk ids but the manifest lists {}",
                    indexed.len(),
                    expected.len()
                ),
            });
        }

        index.persist(&staging)?;

        let meta = IndexMeta {
            collection: layout.name().to_string(),
            store: request.store,
            model: provider.model_id().to_string(),
            dim: provider.dim(),
            n_chunks: index.len(),
            built_at: now_utc_string(),
            duration_sec: started.elapsed().as_secs_f64(),
            run_ids: request.filter.run_id.into_iter().collect(),
            source_ids: source_ids(request, selection),
            checksum: plan.next_manifest.checksum(),
            notes: request.notes.clone(),
            hnsw: (request.store == StoreKind::Approximate).then_some(request.hnsw),
        };
        write_json_atomic(&staging.join(MANIFEST_FILE), &plan.next_manifest)?;
        write_json_atomic(&staging.join(META_FILE), &meta)?;

        layout.commit_staging()?;
        Ok(meta)
    }

    fn smoke_query(&self, layout: &CollectionLayout, query: &str, k: usize) -> Result<QueryResponse> {
        let service = RetrievalService::new(&self.models_dir, self.models, Some(self.chunk_store));
        let response = service.query(&QueryRequest::new(query, layout.store(), layout.name(), k.max(1)))?;

        for result in &response.results {
            info!(
                collection = %layout.name(),
                rank = result.rank,
                chunk_id = result.chunk_id,
                similarity = result.similarity,
                title = result.document_title.as_deref().unwrap_or_default(),
                "smoke query result"
            );
        }
        Ok(response)
    }

    fn unchanged_report(
        &self,
        layout: &CollectionLayout,
        trail: &StageTrail,
        counts: BuildCounts,
        meta: Option<IndexMeta>,
    ) -> BuildReport {
        BuildReport {
            collection: layout.name().to_string(),
            store: layout.store(),
            path: layout.dir(),
            outcome: BuildOutcome::Unchanged,
            stages: trail.stages.clone(),
            counts,
            n_chunks: meta.as_ref().map(|meta| meta.n_chunks).unwrap_or_default(),
            meta,
            smoke: None,
        }
    }
}

fn embed_scheduled(
    provider: &EmbeddingProvider,
    scheduled: &[ScheduledChunk],
    counts: &mut BuildCounts,
) -> Result<Vec<Vec<f32>>> {
    let mut vectors = Vec::<Vec<f32>>::with_capacity(scheduled.len());

    for batch in scheduled.chunks(provider.batch_size()) {
        let texts = batch
            .iter()
            .map(|item| item.chunk.text.clone())
            .collect::<Vec<String>>();
        let encoded = provider.encode(&texts, EncodeRole::Passage)?;
        if encoded.len() != batch.len() {
            return Err(RagError::Provider {
                model_id: provider.model_id().to_string(),
                message: format!("{} vectors for {} passages", encoded.len(), batch.len()),
            });
        }
        if let Some(vector) = encoded.iter().find(|vector| vector.len() != provider.dim()) {
            return Err(RagError::Dimensionality {
                expected: provider.dim(),
                actual: vector.len(),
            });
        }

        vectors.extend(encoded);
        counts.embedded = vectors.len();
        info!(
            model_id = provider.model_id(),
            embedded = counts.embedded,
            scheduled = scheduled.len(),
            "embedding batch encoded"
        );
    }

    Ok(vectors)
}

fn partial_failure(stage: BuildStage, counts: &BuildCounts, source: RagError) -> RagError {
    RagError::PartialBuildFailure {
        stage: stage.as_str(),
        selected: counts.selected,
        scheduled: counts.scheduled,
        embedded: counts.embedded,
        source: Box::new(source),
    }
}

fn item_metadata(chunk: &Chunk) -> ItemMetadata {
    let mut metadata = chunk_metadata(chunk.id);
    metadata.insert("source_id".to_string(), chunk.source_id.to_string());
    if let Some(document_id) = chunk.document_id {
        metadata.insert("document_id".to_string(), document_id.to_string());
    }
    if let Some(ordinal) = chunk.ordinal {
        metadata.insert("ordinal".to_string(), ordinal.to_string());
    }
    metadata
}

fn source_ids(request: &BuildRequest, selection: &[Chunk]) -> Vec<i64> {
    match request.filter.source_id {
        Some(source_id) => vec![source_id],
        None => selection
            .iter()
            .map(|chunk| chunk.source_id)
            .collect::<BTreeSet<i64>>()
            .into_iter()
            .collect(),
    }
}
