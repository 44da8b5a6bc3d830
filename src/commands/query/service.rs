use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::{self, IndexBackend, StoreKind};
use crate::chunk_store::ChunkStore;
use crate::collection::{CollectionLayout, IndexMeta};
use crate::error::{RagError, Result};
use crate::model::{ChunkId, ChunkRecord, RetrievalResult};
use crate::rerank::{
    LexicalPairScorer, MIN_RERANK_POOL, PairScorer, RERANK_TEXT_CHARS, mmr_order, order_by_score,
};
use crate::semantic::{EmbeddingProvider, EncodeRole, ModelResolver};
use crate::util::{normalize_whitespace, truncate_chars};

pub const SNIPPET_CHARS: usize = 800;
const MIN_CANDIDATE_POOL: usize = 20;

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub text: String,
    pub store: StoreKind,
    pub collection: String,
    pub k: usize,
    pub expected_model: Option<String>,
    /// MMR lambda; `None` disables diversity re-ranking.
    pub diversity: Option<f64>,
    pub rerank: bool,
    pub enrich: bool,
    pub ef_search: Option<usize>,
}

impl QueryRequest {
    pub fn new(text: &str, store: StoreKind, collection: &str, k: usize) -> Self {
        Self {
            text: text.to_string(),
            store,
            collection: collection.to_string(),
            k,
            expected_model: None,
            diversity: None,
            rerank: false,
            enrich: true,
            ef_search: None,
        }
    }

    fn candidate_pool(&self) -> usize {
        if self.diversity.is_some() || self.rerank {
            (self.k * 4).max(MIN_CANDIDATE_POOL)
        } else {
            self.k
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model: String,
    pub dim: usize,
    pub n_chunks: usize,
    pub collection: String,
    pub store: StoreKind,
}

/// How many returned results resolved each enrichment field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Coverage {
    pub title: usize,
    pub path: usize,
    pub chunk_ordinal: usize,
    pub text: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub query: String,
    pub k: usize,
    pub elapsed_ms: f64,
    pub model_info: ModelInfo,
    pub results: Vec<RetrievalResult>,
    pub coverage: Coverage,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// A committed collection loaded for serving: its meta, backend and query encoder.
pub struct OpenCollection {
    pub meta: IndexMeta,
    backend: Box<dyn IndexBackend>,
    provider: EmbeddingProvider,
}

impl OpenCollection {
    pub fn backend(&self) -> &dyn IndexBackend {
        self.backend.as_ref()
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            model: self.meta.model.clone(),
            dim: self.meta.dim,
            n_chunks: self.meta.n_chunks,
            collection: self.meta.collection.clone(),
            store: self.meta.store,
        }
    }
}

pub struct RetrievalService<'a> {
    models_dir: PathBuf,
    models: &'a dyn ModelResolver,
    chunk_store: Option<&'a ChunkStore>,
    scorer: Box<dyn PairScorer>,
}

impl<'a> RetrievalService<'a> {
    pub fn new(
        models_dir: &Path,
        models: &'a dyn ModelResolver,
        chunk_store: Option<&'a ChunkStore>,
    ) -> Self {
        Self {
            models_dir: models_dir.to_path_buf(),
            models,
            chunk_store,
            scorer: Box::new(LexicalPairScorer),
        }
    }

    pub fn with_scorer(mut self, scorer: Box<dyn PairScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn open_collection(
        &self,
        store: StoreKind,
        collection: &str,
        ef_search: Option<usize>,
    ) -> Result<OpenCollection> {
        let layout = CollectionLayout::new(&self.models_dir, store, collection)?;
        let meta = layout.load_meta()?;
        let mut backend = backend::open_existing(store, &layout.dir())?;
        if let Some(ef_search) = ef_search {
            backend.set_search_breadth(ef_search);
        }

        let provider = self.models.resolve(&meta.model)?;
        if provider.dim() != meta.dim || backend.dim() != meta.dim {
            return Err(RagError::Dimensionality {
                expected: meta.dim,
                actual: if provider.dim() != meta.dim {
                    provider.dim()
                } else {
                    backend.dim()
                },
            });
        }

        Ok(OpenCollection {
            meta,
            backend,
            provider,
        })
    }

    pub fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let layout = CollectionLayout::new(&self.models_dir, request.store, &request.collection)?;
        layout
            .load_meta()?
            .ensure_model(request.expected_model.as_deref())?;

        let collection =
            self.open_collection(request.store, &request.collection, request.ef_search)?;
        self.query_collection(&collection, request)
    }

    pub fn query_collection(
        &self,
        collection: &OpenCollection,
        request: &QueryRequest,
    ) -> Result<QueryResponse> {
        let started = Instant::now();
        let text = request.text.trim();
        if text.is_empty() {
            return Err(RagError::InvalidRequest("query text is empty".to_string()));
        }
        if request.k == 0 {
            return Err(RagError::InvalidRequest("k must be at least 1".to_string()));
        }
        collection
            .meta
            .ensure_model(request.expected_model.as_deref())?;

        let query_vector = collection.provider.encode_one(text, EncodeRole::Query)?;
        let store = collection.meta.store;
        let hits = collection
            .backend
            .search(&query_vector, request.candidate_pool())?;

        let mut results = hits
            .iter()
            .enumerate()
            .map(|(position, hit)| {
                RetrievalResult::bare(
                    position + 1,
                    hit.chunk_id,
                    hit.raw_score,
                    store.normalize_score(hit.raw_score),
                )
            })
            .collect::<Vec<_>>();

        let mut warnings = Vec::<String>::new();
        let records = if request.enrich || request.rerank {
            self.lookup_records(&results, &mut warnings)
        } else {
            HashMap::new()
        };

        if let Some(lambda) = request.diversity {
            results = apply_diversity(results, collection.backend(), lambda, request.k);
        }
        if request.rerank {
            results = self.apply_rerank(results, text, request.k, &records, &mut warnings)?;
        }

        results.truncate(request.k);
        for (position, result) in results.iter_mut().enumerate() {
            result.rank = position + 1;
            if request.enrich
                && let Some(record) = records.get(&result.chunk_id)
            {
                attach_record(result, record);
            }
        }

        let coverage = coverage_of(&results);
        debug!(
            collection = %collection.meta.collection,
            store = %store,
            returned = results.len(),
            candidates = hits.len(),
            "query served"
        );

        Ok(QueryResponse {
            query: text.to_string(),
            k: request.k,
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
            model_info: collection.model_info(),
            results,
            coverage,
            warnings,
        })
    }

    fn lookup_records(
        &self,
        results: &[RetrievalResult],
        warnings: &mut Vec<String>,
    ) -> HashMap<ChunkId, ChunkRecord> {
        let Some(chunk_store) = self.chunk_store else {
            warnings.push("enrichment_unavailable: no chunk store".to_string());
            return HashMap::new();
        };

        let ids = results.iter().map(|result| result.chunk_id).collect::<Vec<_>>();
        let records = match chunk_store.lookup_chunks(&ids) {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "chunk lookup failed; results left unenriched");
                warnings.push(format!("enrichment_error: {err}"));
                return HashMap::new();
            }
        };

        for chunk_id in ids.iter().filter(|id| !records.contains_key(*id)) {
            let miss = RagError::EnrichmentLookupMiss {
                chunk_id: *chunk_id,
            };
            warn!(chunk_id = *chunk_id, error = %miss, "enrichment lookup miss");
        }
        records
    }

    fn apply_rerank(
        &self,
        results: Vec<RetrievalResult>,
        query: &str,
        k: usize,
        records: &HashMap<ChunkId, ChunkRecord>,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<RetrievalResult>> {
        let head_len = results.len().min(k.max(MIN_RERANK_POOL));
        let passages = results[..head_len]
            .iter()
            .map(|result| {
                records
                    .get(&result.chunk_id)
                    .map(|record| truncate_chars(&record.text, RERANK_TEXT_CHARS))
                    .unwrap_or_default()
            })
            .collect::<Vec<String>>();

        if passages.iter().all(String::is_empty) {
            warnings.push("rerank_skipped_no_text".to_string());
            return Ok(results);
        }

        let borrowed = passages.iter().map(String::as_str).collect::<Vec<&str>>();
        let scores = self.scorer.score_pairs(query, &borrowed)?;
        if scores.len() != passages.len() {
            return Err(RagError::Provider {
                model_id: self.scorer.name().to_string(),
                message: format!(
                    "pair scorer returned {} scores for {} passages",
                    scores.len(),
                    passages.len()
                ),
            });
        }

        let mut remaining = results.into_iter().map(Some).collect::<Vec<_>>();
        let mut out = Vec::<RetrievalResult>::with_capacity(remaining.len());
        for index in order_by_score(&scores) {
            if let Some(mut result) = remaining[index].take() {
                result.rerank_score = Some(scores[index]);
                out.push(result);
            }
        }
        out.extend(remaining.into_iter().flatten());

        debug!(scorer = self.scorer.name(), scored = head_len, "pairwise re-scoring applied");
        Ok(out)
    }
}

fn apply_diversity(
    results: Vec<RetrievalResult>,
    backend: &dyn IndexBackend,
    lambda: f64,
    k: usize,
) -> Vec<RetrievalResult> {
    let relevance = results
        .iter()
        .map(|result| result.similarity)
        .collect::<Vec<f64>>();
    let vectors = results
        .iter()
        .map(|result| backend.vector(result.chunk_id))
        .collect::<Vec<_>>();

    let mut remaining = results.into_iter().map(Some).collect::<Vec<_>>();
    mmr_order(&relevance, &vectors, lambda, k)
        .into_iter()
        .filter_map(|pick| {
            let mut result = remaining[pick.index].take()?;
            result.mmr_score = pick.score;
            Some(result)
        })
        .collect()
}

fn attach_record(result: &mut RetrievalResult, record: &ChunkRecord) {
    result.document_id = record.document_id;
    result.document_title = record.document_title.clone();
    result.document_path = record.document_path.clone();
    result.chunk_ordinal = record.ordinal;

    let snippet = normalize_whitespace(&record.text);
    result.snippet = if snippet.is_empty() {
        None
    } else {
        Some(truncate_chars(&snippet, SNIPPET_CHARS))
    };
}

fn coverage_of(results: &[RetrievalResult]) -> Coverage {
    let mut coverage = Coverage::default();
    for result in results {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
        coverage.title += usize::from(present(&result.document_title));
        coverage.path += usize::from(present(&result.document_path));
        coverage.chunk_ordinal += usize::from(result.chunk_ordinal.is_some());
        coverage.text += usize::from(present(&result.snippet));
    }
    coverage
}
