use std::io::{self, Write};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::chunk_store::ChunkStore;
use crate::cli::EvaluateArgs;
use crate::semantic::LocalModelResolver;

use super::gold::load_queries;
use super::harness::{EvaluationReport, EvaluationRequest, Evaluator};

pub fn run(args: EvaluateArgs) -> Result<()> {
    let queries = load_queries(&args.queries)
        .with_context(|| format!("failed to load queries from {}", args.queries.display()))?;

    let chunk_store = ChunkStore::open_if_present(&args.location.db_path)
        .with_context(|| format!("failed to open {}", args.location.db_path.display()))?;
    if chunk_store.is_none() {
        warn!(
            path = %args.location.db_path.display(),
            "chunk store missing; only chunk-id expectations will be scored"
        );
    }

    let models = LocalModelResolver::new();
    let evaluator = Evaluator::new(&args.location.models_dir, &models, chunk_store.as_ref())
        .context("failed to prepare evaluator")?;

    let request = EvaluationRequest {
        expected_model: args.expected_model.clone(),
        diversity: args.mmr.then_some(args.lambda),
        rerank: args.rerank,
        ef_search: args.ef_search,
        prefix_scoring: args.prefix_scoring,
        write_artifacts: !args.no_artifacts,
        ..EvaluationRequest::new(&args.collection, &args.stores, &args.ks)
    };

    info!(
        collection = %args.collection,
        queries = queries.len(),
        stores = ?args.stores,
        ks = ?args.ks,
        "evaluation started"
    );
    let report = evaluator
        .evaluate(&request, &queries)
        .with_context(|| format!("evaluation of collection '{}' failed", args.collection))?;

    if report.stores.is_empty() {
        let reasons = report
            .errors
            .iter()
            .map(|failure| format!("{}: {}", failure.store, failure.error))
            .collect::<Vec<_>>()
            .join("; ");
        bail!("no backend could be evaluated ({reasons})");
    }

    if args.json {
        write_json_report(&report)
    } else {
        write_text_report(&report)
    }
}

fn write_json_report(report: &EvaluationReport) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    serde_json::to_writer_pretty(&mut output, report)
        .context("failed to serialize evaluation report")?;
    writeln!(output)?;
    output.flush()?;
    Ok(())
}

fn write_text_report(report: &EvaluationReport) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());

    write!(output, "{}", report.matrix_markdown())?;
    for evaluation in &report.stores {
        if let Some(eval_dir) = &evaluation.eval_dir {
            writeln!(output, "{} artifacts: {}", evaluation.store, eval_dir.display())?;
        }
        for warning in &evaluation.warnings {
            writeln!(output, "warning ({}): {warning}", evaluation.store)?;
        }
    }
    if let Some(compare_dir) = &report.compare_dir {
        writeln!(output, "comparison: {}", compare_dir.display())?;
    }

    output.flush()?;
    Ok(())
}
