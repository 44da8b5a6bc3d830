use std::fs;
use std::path::Path;

use super::{
    ContainsMatcher, EvaluationQuery, EvaluationRequest, Evaluator, SignalKind, load_queries,
    parse_csv_queries, parse_queries,
};
use crate::backend::StoreKind;
use crate::chunk_store::ChunkStore;
use crate::commands::index::{BuildRequest, IndexOrchestrator};
use crate::error::{RagError, Result};
use crate::rerank::PairScorer;
use crate::semantic::{DEFAULT_MODEL_ID, LocalModelResolver};
use crate::test_support::{CountingResolver, municipal_store};

fn build(models_dir: &Path, chunks: &ChunkStore, store: StoreKind) {
    let models = LocalModelResolver::new();
    IndexOrchestrator::new(models_dir, chunks, &models)
        .build(&BuildRequest {
            collection: Some("municipal".to_string()),
            ..BuildRequest::new(store, DEFAULT_MODEL_ID)
        })
        .expect("build");
}

/// One query per relevance signal plus an unlabelled one.
fn labelled_queries(chunks: &ChunkStore) -> Vec<EvaluationQuery> {
    let licence_document = chunks
        .lookup_chunks(&[2])
        .expect("lookup")
        .get(&2)
        .and_then(|record| record.document_id)
        .expect("chunk 2 has a document");

    vec![
        EvaluationQuery {
            expected_chunk_ids: vec![1],
            ..EvaluationQuery::new("empadronamiento")
        },
        EvaluationQuery {
            expected_document_id: Some(licence_document),
            ..EvaluationQuery::new("licencia de obra")
        },
        EvaluationQuery {
            expected_title_contains: Some("tramite 3".to_string()),
            ..EvaluationQuery::new("tasa de basuras")
        },
        EvaluationQuery {
            expected_text_contains: Some("Padron Municipal".to_string()),
            ..EvaluationQuery::new("padrón")
        },
        EvaluationQuery::new("horario de atención"),
    ]
}

struct LongestFirst;

impl PairScorer for LongestFirst {
    fn name(&self) -> &str {
        "longest-first"
    }

    fn score_pairs(&self, _query: &str, passages: &[&str]) -> Result<Vec<f64>> {
        Ok(passages.iter().map(|passage| passage.len() as f64).collect())
    }
}

#[test]
fn query_files_accept_arrays_objects_and_json_lines() {
    let array = r#"[
        {"id": 7, "query": "empadronamiento", "expected_chunk_id": 1},
        {"query": "licencia", "relevants": "2; 3", "expected_document_id": "4"},
        {"query": "   ", "expected_chunk_ids": [1]}
    ]"#;
    let parsed = parse_queries(array).expect("array");
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].id.as_deref(), Some("7"));
    assert_eq!(parsed[0].expected_chunk_ids, vec![1]);
    assert_eq!(parsed[1].expected_chunk_ids, vec![2, 3]);
    assert_eq!(parsed[1].expected_document_id, Some(4));
    assert_eq!(parsed[1].label(1), "q2");

    let object = r#"{"queries": [{"query": "tasa", "expected_title_contains": "  "}]}"#;
    let parsed = parse_queries(object).expect("object");
    assert_eq!(parsed.len(), 1);
    assert!(parsed[0].expected_title_contains.is_none());
    assert!(parsed[0].strongest_signal(true).is_none());

    let lines = "{\"query\": \"padrón\", \"expected_text_contains\": \"padron\"}\n\n{\"query\": \"obra\", \"expected_chunk_ids\": [2, 2]}\n";
    let parsed = parse_queries(lines).expect("jsonl");
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].strongest_signal(true), Some(SignalKind::TextContains));
    assert_eq!(parsed[0].strongest_signal(false), None);
    assert_eq!(parsed[1].distinct_chunk_ids(), 1);

    let broken = parse_queries("{\"query\": \"ok\"}\nnot json\n");
    assert!(matches!(broken, Err(RagError::InvalidRequest(reason)) if reason.starts_with("line 2")));
}

#[test]
fn csv_query_sets_accept_a_bom_and_aliased_headers() {
    let raw = "\u{feff}q,expected_chunk_id,Expected Chunk IDs,doc_id,doc_title_contains,chunk_text_contains\n\
               empadronamiento,1,1|4,,,\n\
               licencia de obra,,,2,,\n\
               \"tasa,  de basuras\",,,,Trámite 3,basuras\n\
               \"   \",3,,,,\n";
    let parsed = parse_csv_queries(raw).expect("csv");
    assert_eq!(parsed.len(), 3);

    assert_eq!(parsed[0].query, "empadronamiento");
    assert_eq!(parsed[0].expected_chunk_ids, vec![1, 4]);
    assert_eq!(parsed[0].label(0), "q1");
    assert_eq!(parsed[1].expected_document_id, Some(2));
    assert_eq!(parsed[1].strongest_signal(true), Some(SignalKind::DocumentId));
    assert_eq!(parsed[2].query, "tasa, de basuras");
    assert_eq!(parsed[2].expected_title_contains.as_deref(), Some("Trámite 3"));
    assert_eq!(parsed[2].expected_text_contains.as_deref(), Some("basuras"));

    // Without a `.csv` extension the format is sniffed.
    assert_eq!(parse_queries(raw).expect("sniffed"), parsed);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("gold.CSV");
    fs::write(&path, raw).expect("write");
    assert_eq!(load_queries(&path).expect("load"), parsed);

    let header_only = dir.path().join("empty.csv");
    fs::write(&header_only, "query,expected_chunk_ids\n").expect("write");
    assert!(matches!(load_queries(&header_only), Err(RagError::InvalidRequest(_))));
}

#[test]
fn json_query_sets_share_the_header_aliases() {
    let raw = r#"[{
        "q": "padrón",
        "doc_id": "3",
        "title_contains": "Trámite",
        "chunk_text_contains": "padron",
        "expected_chunk_id": 1,
        "expected_chunk_ids": "2|3; 1"
    }]"#;
    let parsed = parse_queries(raw).expect("aliases");
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].query, "padrón");
    assert_eq!(parsed[0].expected_chunk_ids, vec![1, 2, 3]);
    assert_eq!(parsed[0].expected_document_id, Some(3));
    assert_eq!(parsed[0].expected_title_contains.as_deref(), Some("Trámite"));
    assert_eq!(parsed[0].expected_text_contains.as_deref(), Some("padron"));

    let lines = "{\"query\": \"obra\", \"relevants\": \"4 | 5\"}\n";
    assert_eq!(parse_queries(lines).expect("jsonl")[0].expected_chunk_ids, vec![4, 5]);
}

#[test]
fn signals_are_ordered_strongest_first() {
    let query = EvaluationQuery {
        expected_chunk_ids: vec![3],
        expected_text_contains: Some("basuras".to_string()),
        expected_document_id: Some(3),
        ..EvaluationQuery::new("tasa")
    };
    assert_eq!(
        query.signals(true),
        vec![
            SignalKind::ChunkId,
            SignalKind::DocumentId,
            SignalKind::TextContains
        ]
    );
    assert_eq!(query.signals(false), vec![SignalKind::ChunkId]);
}

#[test]
fn contains_matching_ignores_case_and_accents() {
    let matcher = ContainsMatcher::new().expect("matcher");

    assert!(matcher.matches(Some("Alta en el Padrón Municipal"), "padron"));
    assert!(matcher.matches(Some("Solicitud de LICENCIA de obra menor"), "licencia obra"));
    assert!(matcher.matches(Some("obra menor: licencia"), "Licéncia  obra"));
    assert!(!matcher.matches(Some("licencia de actividad"), "licencia obra"));
    // Single-letter tokens are ignored.
    assert!(matcher.matches(Some("tasa de basuras"), "tasa y basuras"));
    // One usable token falls back to a substring check of the whole pattern.
    assert!(!matcher.matches(Some("licencia de obra"), "obra y"));
    assert!(matcher.matches(Some("obra y licencia"), "obra y"));
    assert!(!matcher.matches(Some("padrón"), ""));
    assert!(!matcher.matches(None, "padron"));
}

#[test]
fn evaluation_scores_every_signal_on_both_backends_and_writes_artifacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chunks = municipal_store();
    build(dir.path(), &chunks, StoreKind::Exact);
    build(dir.path(), &chunks, StoreKind::Approximate);

    let models = LocalModelResolver::new();
    let evaluator = Evaluator::new(dir.path(), &models, Some(&chunks)).expect("evaluator");
    let request = EvaluationRequest::new("municipal", &StoreKind::ALL, &[3, 1, 3]);
    let report = evaluator
        .evaluate(&request, &labelled_queries(&chunks))
        .expect("evaluate");

    assert!(report.errors.is_empty());
    assert_eq!(report.ks, vec![1, 3]);
    assert_eq!(report.stores.len(), 2);

    for store in StoreKind::ALL {
        let top1 = report.cell(store, 1).expect("k=1 cell");
        assert_eq!(top1.n_queries, 5);
        assert_eq!(top1.overall.queries, 4);
        assert_eq!(top1.overall.recall, 1.0);
        assert_eq!(top1.overall.mrr, 1.0);
        assert_eq!(top1.overall.ndcg, Some(1.0));
        assert_eq!(top1.by_signal.len(), 4);
        assert!(top1.by_signal.values().all(|metrics| metrics.queries == 1));

        let top3 = report.cell(store, 3).expect("k=3 cell");
        assert!(top3.overall.recall >= top1.overall.recall);
        assert_eq!(top1.retrieved_at, 1);
        assert_eq!(top3.retrieved_at, 3);
    }

    let exact = &report.stores[0];
    assert_eq!(exact.unscored_queries, 1);
    assert_eq!(exact.model, DEFAULT_MODEL_ID);
    assert_eq!(exact.queries.len(), 5);
    assert_eq!(exact.queries[0].first_relevant_rank, Some(1));
    assert_eq!(exact.queries[0].hits.len(), 3);
    assert_eq!(exact.queries[0].hits[0].relevant, vec![SignalKind::ChunkId]);
    assert!(exact.queries[4].strongest_signal.is_none());

    let eval_dir = exact.eval_dir.as_ref().expect("eval dir");
    assert!(eval_dir.starts_with(dir.path().join("exact").join("municipal").join("eval")));
    assert!(eval_dir.join("metrics.json").is_file());
    let results = fs::read_to_string(eval_dir.join("results.json")).expect("results");
    assert!(results.contains("empadronamiento"));

    let compare_dir = report.compare_dir.as_ref().expect("compare dir");
    assert!(compare_dir.starts_with(dir.path().join("compare").join("municipal")));
    assert!(compare_dir.join("matrix.json").is_file());
    let matrix = fs::read_to_string(compare_dir.join("matrix.md")).expect("matrix");
    assert!(matrix.contains("| exact | 1 | 5 | 100.0% |"));
    assert!(matrix.contains("| approximate | 3 |"));
}

#[test]
fn every_cutoff_runs_its_own_retrieval_unless_prefix_scoring_is_requested() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chunks = municipal_store();
    build(dir.path(), &chunks, StoreKind::Exact);
    let queries = labelled_queries(&chunks);

    let per_cutoff = CountingResolver::default();
    let evaluator = Evaluator::new(dir.path(), &per_cutoff, Some(&chunks)).expect("evaluator");
    let request = EvaluationRequest {
        write_artifacts: false,
        ..EvaluationRequest::new("municipal", &[StoreKind::Exact], &[1, 3])
    };
    let report = evaluator.evaluate(&request, &queries).expect("evaluate");
    assert_eq!(per_cutoff.embedded(), 2 * queries.len());
    let top1 = report.cell(StoreKind::Exact, 1).expect("k=1 cell");
    assert_eq!(top1.retrieved_at, 1);
    assert_eq!(top1.overall.recall, 1.0);
    assert_eq!(report.stores[0].queries[0].hits.len(), 3);

    let prefix = CountingResolver::default();
    let evaluator = Evaluator::new(dir.path(), &prefix, Some(&chunks)).expect("evaluator");
    let request = EvaluationRequest {
        prefix_scoring: true,
        ..request
    };
    let report = evaluator.evaluate(&request, &queries).expect("evaluate");
    assert_eq!(prefix.embedded(), queries.len());
    let top1 = report.cell(StoreKind::Exact, 1).expect("k=1 cell");
    let top3 = report.cell(StoreKind::Exact, 3).expect("k=3 cell");
    assert_eq!(top1.retrieved_at, 3);
    assert_eq!(top1.latency_ms, top3.latency_ms);
    assert_eq!(top1.overall.recall, 1.0);
}

#[test]
fn a_failing_backend_is_recorded_while_the_rest_still_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chunks = municipal_store();
    build(dir.path(), &chunks, StoreKind::Exact);

    let models = LocalModelResolver::new();
    let evaluator = Evaluator::new(dir.path(), &models, Some(&chunks)).expect("evaluator");
    let request = EvaluationRequest {
        write_artifacts: false,
        ..EvaluationRequest::new("municipal", &StoreKind::ALL, &[1])
    };
    let report = evaluator
        .evaluate(&request, &labelled_queries(&chunks))
        .expect("evaluate");

    assert_eq!(report.stores.len(), 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].store, StoreKind::Approximate);
    assert!(report.compare_dir.is_none());
    assert!(report.stores[0].eval_dir.is_none());
    assert!(report.matrix_markdown().contains("## Errors"));

    let mismatched = EvaluationRequest {
        expected_model: Some("bge-small".to_string()),
        ..request
    };
    let report = evaluator
        .evaluate(&mismatched, &labelled_queries(&chunks))
        .expect("evaluate");
    assert!(report.stores.is_empty());
    assert_eq!(report.errors.len(), 2);
    assert!(report.errors[0].error.contains("bge-small"));
}

#[test]
fn without_a_chunk_store_only_chunk_ids_are_judged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chunks = municipal_store();
    build(dir.path(), &chunks, StoreKind::Exact);
    let queries = labelled_queries(&chunks);

    let models = LocalModelResolver::new();
    let evaluator = Evaluator::new(dir.path(), &models, None).expect("evaluator");
    let request = EvaluationRequest {
        write_artifacts: false,
        ..EvaluationRequest::new("municipal", &[StoreKind::Exact], &[1, 3])
    };
    let report = evaluator.evaluate(&request, &queries).expect("evaluate");

    let evaluation = &report.stores[0];
    assert_eq!(evaluation.unscored_queries, 4);
    assert!(!evaluation.warnings.is_empty());
    let cell = report.cell(StoreKind::Exact, 1).expect("cell");
    assert_eq!(cell.overall.queries, 1);
    assert_eq!(
        cell.by_signal.keys().copied().collect::<Vec<_>>(),
        vec![SignalKind::ChunkId]
    );
}

#[test]
fn evaluation_can_rescore_with_a_pair_scorer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chunks = municipal_store();
    build(dir.path(), &chunks, StoreKind::Exact);

    let models = LocalModelResolver::new();
    let evaluator = Evaluator::new(dir.path(), &models, Some(&chunks))
        .expect("evaluator")
        .with_scorer(Box::new(LongestFirst));
    let request = EvaluationRequest {
        rerank: true,
        write_artifacts: false,
        ..EvaluationRequest::new("municipal", &[StoreKind::Exact], &[1])
    };
    let report = evaluator
        .evaluate(&request, &labelled_queries(&chunks))
        .expect("evaluate");

    let outcome = &report.stores[0].queries[0];
    assert_eq!(outcome.hits.len(), 1);
    assert!(outcome.hits[0].rerank_score.is_some());
    // "padrón municipal" is the longest text, so it wins every re-scored pool.
    assert_eq!(outcome.hits[0].chunk_id, 1);
}

#[test]
fn invalid_evaluation_requests_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let models = LocalModelResolver::new();
    let evaluator = Evaluator::new(dir.path(), &models, None).expect("evaluator");
    let queries = vec![EvaluationQuery::new("padrón")];

    let zero_k = EvaluationRequest::new("municipal", &[StoreKind::Exact], &[0, 5]);
    assert!(matches!(
        evaluator.evaluate(&zero_k, &queries),
        Err(RagError::InvalidRequest(_))
    ));

    let no_queries = EvaluationRequest::new("municipal", &[StoreKind::Exact], &[5]);
    assert!(matches!(
        evaluator.evaluate(&no_queries, &[]),
        Err(RagError::InvalidRequest(_))
    ));

    let no_stores = EvaluationRequest::new("municipal", &[], &[5]);
    assert!(matches!(
        evaluator.evaluate(&no_stores, &queries),
        Err(RagError::InvalidRequest(_))
    ));
}
