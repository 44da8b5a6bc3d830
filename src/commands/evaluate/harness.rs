use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::StoreKind;
use crate::chunk_store::ChunkStore;
use crate::collection::{CollectionLayout, validate_collection_name};
use crate::commands::query::{OpenCollection, QueryRequest, RetrievalService};
use crate::error::{RagError, Result};
use crate::model::{ChunkId, ChunkRecord, RetrievalResult};
use crate::rerank::PairScorer;
use crate::semantic::ModelResolver;
use crate::util::{ensure_directory, utc_compact_string, write_json_pretty};

use super::gold::{ContainsMatcher, EvaluationQuery, SignalKind};
use super::metrics::{
    LatencySummary, RankAccumulator, RankMetrics, first_relevant_rank, relevant_in_top_k,
};

pub const COMPARE_DIR: &str = "compare";

#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub collection: String,
    pub stores: Vec<StoreKind>,
    pub ks: Vec<usize>,
    pub expected_model: Option<String>,
    pub diversity: Option<f64>,
    pub rerank: bool,
    pub ef_search: Option<usize>,
    /// Retrieve once at the largest k and score every smaller k on that prefix.
    pub prefix_scoring: bool,
    pub write_artifacts: bool,
}

impl EvaluationRequest {
    pub fn new(collection: &str, stores: &[StoreKind], ks: &[usize]) -> Self {
        Self {
            collection: collection.to_string(),
            stores: stores.to_vec(),
            ks: ks.to_vec(),
            expected_model: None,
            diversity: None,
            rerank: false,
            ef_search: None,
            prefix_scoring: false,
            write_artifacts: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JudgedHit {
    pub rank: usize,
    pub chunk_id: ChunkId,
    pub similarity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
    pub document_id: Option<i64>,
    pub document_title: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub relevant: Vec<SignalKind>,
}

/// Raw per-query outcome kept for auditing (`results.json`).
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub index: usize,
    pub id: String,
    pub query: String,
    pub gold: EvaluationQuery,
    pub strongest_signal: Option<SignalKind>,
    pub first_relevant_rank: Option<usize>,
    pub latency_ms: f64,
    pub hits: Vec<JudgedHit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CellMetrics {
    pub store: StoreKind,
    pub k: usize,
    /// Cutoff the retrieval ran with; larger than `k` under prefix scoring.
    pub retrieved_at: usize,
    pub n_queries: usize,
    /// Each query scored at its strongest signal.
    pub overall: RankMetrics,
    pub by_signal: BTreeMap<SignalKind, RankMetrics>,
    pub latency_ms: LatencySummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreEvaluation {
    pub store: StoreKind,
    pub collection: String,
    pub model: String,
    pub n_chunks: usize,
    pub n_queries: usize,
    pub unscored_queries: usize,
    pub signal_counts: BTreeMap<SignalKind, usize>,
    pub latency_ms: LatencySummary,
    pub cells: Vec<CellMetrics>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_dir: Option<PathBuf>,
    #[serde(skip)]
    pub queries: Vec<QueryOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendFailure {
    pub store: StoreKind,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub collection: String,
    pub generated_at: String,
    pub n_queries: usize,
    pub ks: Vec<usize>,
    pub stores: Vec<StoreEvaluation>,
    pub errors: Vec<BackendFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compare_dir: Option<PathBuf>,
}

impl EvaluationReport {
    pub fn cell(&self, store: StoreKind, k: usize) -> Option<&CellMetrics> {
        self.stores
            .iter()
            .filter(|evaluation| evaluation.store == store)
            .flat_map(|evaluation| evaluation.cells.iter())
            .find(|cell| cell.k == k)
    }

    /// Markdown comparison table, one row per (store, k).
    pub fn matrix_markdown(&self) -> String {
        let percent = |metrics: Option<&RankMetrics>| match metrics {
            Some(metrics) if metrics.queries > 0 => format!("{:.1}%", metrics.recall * 100.0),
            _ => "n/a".to_string(),
        };

        let mut out = String::new();
        let _ = writeln!(out, "# Retriever comparison: collection `{}`", self.collection);
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "| Store | k | n | recall@k | MRR | nDCG | chunk@k | doc@k | title@k | text@k | p50 ms | p95 ms | mean ms |"
        );
        let _ = writeln!(
            out,
            "|---|---:|---:|---:|---:|---:|---:|---:|---:|---:|---:|---:|---:|"
        );
        for evaluation in &self.stores {
            for cell in &evaluation.cells {
                let signal = |kind: SignalKind| percent(cell.by_signal.get(&kind));
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {} | {:.3} | {:.3} | {} | {} | {} | {} | {:.1} | {:.1} | {:.1} |",
                    cell.store,
                    cell.k,
                    cell.n_queries,
                    percent(Some(&cell.overall)),
                    cell.overall.mrr,
                    cell.overall.ndcg.unwrap_or(0.0),
                    signal(SignalKind::ChunkId),
                    signal(SignalKind::DocumentId),
                    signal(SignalKind::TitleContains),
                    signal(SignalKind::TextContains),
                    cell.latency_ms.p50,
                    cell.latency_ms.p95,
                    cell.latency_ms.mean,
                );
            }
        }

        if !self.errors.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Errors");
            let _ = writeln!(out);
            for failure in &self.errors {
                let _ = writeln!(out, "- {}: {}", failure.store, failure.error);
            }
        }
        out
    }
}

/// Results and per-query latencies of one pass over the query set.
struct CutoffRun {
    k: usize,
    retrieved: Vec<Vec<RetrievalResult>>,
    latencies: Vec<f64>,
}

pub struct Evaluator<'a> {
    models_dir: PathBuf,
    service: RetrievalService<'a>,
    chunk_store: Option<&'a ChunkStore>,
    matcher: ContainsMatcher,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        models_dir: &Path,
        models: &'a dyn ModelResolver,
        chunk_store: Option<&'a ChunkStore>,
    ) -> Result<Self> {
        Ok(Self {
            models_dir: models_dir.to_path_buf(),
            service: RetrievalService::new(models_dir, models, chunk_store),
            chunk_store,
            matcher: ContainsMatcher::new()?,
        })
    }

    pub fn with_scorer(mut self, scorer: Box<dyn PairScorer>) -> Self {
        self.service = self.service.with_scorer(scorer);
        self
    }

    pub fn evaluate(
        &self,
        request: &EvaluationRequest,
        queries: &[EvaluationQuery],
    ) -> Result<EvaluationReport> {
        validate_collection_name(&request.collection)?;
        if queries.is_empty() {
            return Err(RagError::InvalidRequest(
                "evaluation needs at least one query".to_string(),
            ));
        }
        let mut ks = request.ks.clone();
        ks.sort_unstable();
        ks.dedup();
        if ks.is_empty() || ks[0] == 0 {
            return Err(RagError::InvalidRequest(
                "k values must be positive".to_string(),
            ));
        }
        let mut stores = Vec::<StoreKind>::new();
        for store in &request.stores {
            if !stores.contains(store) {
                stores.push(*store);
            }
        }
        if stores.is_empty() {
            return Err(RagError::InvalidRequest(
                "at least one store is required".to_string(),
            ));
        }

        let started_at = Utc::now();
        let stamp = utc_compact_string(started_at);
        let mut report = EvaluationReport {
            collection: request.collection.clone(),
            generated_at: started_at.to_rfc3339(),
            n_queries: queries.len(),
            ks: ks.clone(),
            stores: Vec::new(),
            errors: Vec::new(),
            compare_dir: None,
        };

        for store in stores {
            match self.evaluate_store(store, request, queries, &ks) {
                Ok(mut evaluation) => {
                    if request.write_artifacts {
                        evaluation.eval_dir = Some(self.write_store_artifacts(
                            &evaluation,
                            &request.collection,
                            &stamp,
                        )?);
                    }
                    info!(
                        store = %store,
                        collection = %request.collection,
                        queries = evaluation.n_queries,
                        p50_ms = evaluation.latency_ms.p50,
                        "backend evaluated"
                    );
                    report.stores.push(evaluation);
                }
                Err(err) => {
                    warn!(store = %store, error = %err, "backend evaluation failed");
                    report.errors.push(BackendFailure {
                        store,
                        error: err.to_string(),
                    });
                }
            }
        }

        if request.write_artifacts && !report.stores.is_empty() {
            report.compare_dir = Some(self.write_matrix(&report, &stamp)?);
        }
        Ok(report)
    }

    fn evaluate_store(
        &self,
        store: StoreKind,
        request: &EvaluationRequest,
        queries: &[EvaluationQuery],
        ks: &[usize],
    ) -> Result<StoreEvaluation> {
        let collection =
            self.service
                .open_collection(store, &request.collection, request.ef_search)?;
        collection
            .meta
            .ensure_model(request.expected_model.as_deref())?;

        let max_k = ks.last().copied().unwrap_or(1);
        let runs = if request.prefix_scoring {
            vec![self.retrieve_all(&collection, request, queries, max_k)?]
        } else {
            ks.iter()
                .map(|&k| self.retrieve_all(&collection, request, queries, k))
                .collect::<Result<Vec<_>>>()?
        };

        let mut warnings = Vec::<String>::new();
        let records = self.lookup_records(&runs, &mut warnings);
        let records_available = records.is_some();
        let records = records.unwrap_or_default();

        let judged_runs = runs
            .iter()
            .map(|run| {
                queries
                    .iter()
                    .zip(&run.retrieved)
                    .map(|(query, results)| {
                        self.judge(query, results, &records, records_available)
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let cells = ks
            .iter()
            .map(|&k| {
                let slot = runs
                    .iter()
                    .position(|run| run.k == k)
                    .unwrap_or(runs.len().saturating_sub(1));
                score_cell(
                    store,
                    k,
                    runs[slot].k,
                    queries,
                    &judged_runs[slot],
                    records_available,
                    LatencySummary::from_samples(&runs[slot].latencies),
                )
            })
            .collect::<Vec<_>>();

        let all_latencies = runs
            .iter()
            .flat_map(|run| run.latencies.iter().copied())
            .collect::<Vec<f64>>();
        let latency_ms = LatencySummary::from_samples(&all_latencies);

        let mut signal_counts = BTreeMap::<SignalKind, usize>::new();
        let mut unscored_queries = 0;
        for query in queries {
            let signals = query.signals(records_available);
            if signals.is_empty() {
                unscored_queries += 1;
            }
            for signal in signals {
                *signal_counts.entry(signal).or_default() += 1;
            }
        }

        // Raw outcomes come from the run at the largest k.
        let widest_latencies = runs.last().map(|run| run.latencies.clone()).unwrap_or_default();
        let widest_judged = judged_runs.into_iter().last().unwrap_or_default();
        let outcomes = queries
            .iter()
            .enumerate()
            .zip(widest_judged)
            .zip(widest_latencies)
            .map(|(((index, query), hits), latency_ms)| {
                let strongest_signal = query.strongest_signal(records_available);
                let first_relevant = strongest_signal.and_then(|signal| {
                    first_relevant_rank(&relevance_flags(&hits, signal), max_k)
                });
                QueryOutcome {
                    index,
                    id: query.label(index),
                    query: query.query.clone(),
                    gold: query.clone(),
                    strongest_signal,
                    first_relevant_rank: first_relevant,
                    latency_ms,
                    hits,
                }
            })
            .collect::<Vec<_>>();

        Ok(StoreEvaluation {
            store,
            collection: request.collection.clone(),
            model: collection.meta.model.clone(),
            n_chunks: collection.meta.n_chunks,
            n_queries: queries.len(),
            unscored_queries,
            signal_counts,
            latency_ms,
            cells,
            warnings,
            eval_dir: None,
            queries: outcomes,
        })
    }

    /// Runs the retrieval service once per query at cutoff `k`, timing each call.
    fn retrieve_all(
        &self,
        collection: &OpenCollection,
        request: &EvaluationRequest,
        queries: &[EvaluationQuery],
        k: usize,
    ) -> Result<CutoffRun> {
        let mut retrieved = Vec::with_capacity(queries.len());
        let mut latencies = Vec::with_capacity(queries.len());

        for (index, query) in queries.iter().enumerate() {
            let query_request = QueryRequest {
                expected_model: request.expected_model.clone(),
                diversity: request.diversity,
                rerank: request.rerank,
                enrich: false,
                ef_search: request.ef_search,
                ..QueryRequest::new(
                    &query.query,
                    collection.meta.store,
                    &request.collection,
                    k,
                )
            };

            let started = Instant::now();
            let response = self.service.query_collection(collection, &query_request)?;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            debug!(
                store = %collection.meta.store,
                query = index,
                k,
                latency_ms = elapsed_ms,
                returned = response.results.len(),
                "evaluation query done"
            );

            latencies.push(elapsed_ms);
            retrieved.push(response.results);
        }
        Ok(CutoffRun {
            k,
            retrieved,
            latencies,
        })
    }

    /// `None` when no chunk store can judge document and text signals.
    fn lookup_records(
        &self,
        runs: &[CutoffRun],
        warnings: &mut Vec<String>,
    ) -> Option<HashMap<ChunkId, ChunkRecord>> {
        let Some(chunk_store) = self.chunk_store else {
            warnings.push(
                "chunk store unavailable; document, title and text signals were not judged"
                    .to_string(),
            );
            return None;
        };

        let mut ids = runs
            .iter()
            .flat_map(|run| run.retrieved.iter().flatten())
            .map(|result| result.chunk_id)
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids.dedup();

        match chunk_store.lookup_chunks(&ids) {
            Ok(records) => Some(records),
            Err(err) => {
                warn!(error = %err, "chunk lookup failed during evaluation");
                warnings.push(format!(
                    "chunk lookup failed ({err}); document, title and text signals were not judged"
                ));
                None
            }
        }
    }

    fn judge(
        &self,
        query: &EvaluationQuery,
        results: &[RetrievalResult],
        records: &HashMap<ChunkId, ChunkRecord>,
        records_available: bool,
    ) -> Vec<JudgedHit> {
        let signals = query.signals(records_available);
        results
            .iter()
            .map(|result| {
                let record = records.get(&result.chunk_id);
                JudgedHit {
                    rank: result.rank,
                    chunk_id: result.chunk_id,
                    similarity: result.similarity,
                    rerank_score: result.rerank_score,
                    document_id: record.and_then(|record| record.document_id),
                    document_title: record.and_then(|record| record.document_title.clone()),
                    relevant: signals
                        .iter()
                        .copied()
                        .filter(|signal| {
                            self.matcher
                                .is_relevant(query, *signal, result.chunk_id, record)
                        })
                        .collect(),
                }
            })
            .collect()
    }

    fn write_store_artifacts(
        &self,
        evaluation: &StoreEvaluation,
        collection: &str,
        stamp: &str,
    ) -> Result<PathBuf> {
        let layout = CollectionLayout::new(&self.models_dir, evaluation.store, collection)?;
        let eval_dir = layout.eval_dir().join(stamp);
        ensure_directory(&eval_dir)?;
        write_json_pretty(&eval_dir.join("metrics.json"), evaluation)?;
        write_json_pretty(&eval_dir.join("results.json"), &evaluation.queries)?;
        Ok(eval_dir)
    }

    fn write_matrix(&self, report: &EvaluationReport, stamp: &str) -> Result<PathBuf> {
        let out_dir = self
            .models_dir
            .join(COMPARE_DIR)
            .join(&report.collection)
            .join("eval")
            .join(stamp);
        ensure_directory(&out_dir)?;
        write_json_pretty(&out_dir.join("matrix.json"), report)?;
        std::fs::write(out_dir.join("matrix.md"), report.matrix_markdown())?;
        Ok(out_dir)
    }
}

fn relevance_flags(hits: &[JudgedHit], signal: SignalKind) -> Vec<bool> {
    hits.iter()
        .map(|hit| hit.relevant.contains(&signal))
        .collect()
}

/// Ideal relevant count for nDCG: the labelled set size for chunk ids, otherwise
/// what was retrieved (at least one) since the full relevant set is unknown.
fn ideal_relevant(query: &EvaluationQuery, signal: SignalKind, flags: &[bool], k: usize) -> usize {
    let count = match signal {
        SignalKind::ChunkId => query.distinct_chunk_ids(),
        _ => relevant_in_top_k(flags, k).max(1),
    };
    count.min(k)
}

fn score_cell(
    store: StoreKind,
    k: usize,
    retrieved_at: usize,
    queries: &[EvaluationQuery],
    judged: &[Vec<JudgedHit>],
    records_available: bool,
    latency_ms: LatencySummary,
) -> CellMetrics {
    let mut overall = RankAccumulator::default();
    let mut by_signal = BTreeMap::<SignalKind, RankAccumulator>::new();

    for (query, hits) in queries.iter().zip(judged) {
        let signals = query.signals(records_available);
        for signal in &signals {
            by_signal
                .entry(*signal)
                .or_default()
                .record(&relevance_flags(hits, *signal), k, None);
        }
        if let Some(strongest) = signals.first().copied() {
            let flags = relevance_flags(hits, strongest);
            let ideal = ideal_relevant(query, strongest, &flags, k);
            overall.record(&flags, k, Some(ideal));
        }
    }

    CellMetrics {
        store,
        k,
        retrieved_at,
        n_queries: queries.len(),
        overall: overall.finish(),
        by_signal: by_signal
            .into_iter()
            .map(|(signal, accumulator)| (signal, accumulator.finish()))
            .collect(),
        latency_ms,
    }
}
