use std::io::{self, Write};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::chunk_store::ChunkStore;
use crate::cli::QueryArgs;
use crate::semantic::LocalModelResolver;

use super::service::{QueryRequest, QueryResponse, RetrievalService};

pub fn run(args: QueryArgs) -> Result<()> {
    let chunk_store = ChunkStore::open_if_present(&args.location.db_path)
        .with_context(|| format!("failed to open {}", args.location.db_path.display()))?;
    if chunk_store.is_none() && !args.no_enrich {
        warn!(path = %args.location.db_path.display(), "chunk store missing; results will not be enriched");
    }

    let models = LocalModelResolver::new();
    let service = RetrievalService::new(&args.location.models_dir, &models, chunk_store.as_ref());

    let request = QueryRequest {
        expected_model: args.expected_model.clone(),
        diversity: args.mmr.then_some(args.lambda),
        rerank: args.rerank,
        enrich: !args.no_enrich,
        ef_search: args.ef_search,
        ..QueryRequest::new(&args.query, args.store, &args.collection, args.k)
    };

    let response = service.query(&request).with_context(|| {
        format!(
            "query against {}/{} failed",
            args.store.as_str(),
            args.collection
        )
    })?;

    info!(
        collection = %args.collection,
        store = %args.store,
        returned = response.results.len(),
        elapsed_ms = response.elapsed_ms,
        "query completed"
    );

    if args.json {
        write_json_response(&response)
    } else {
        write_text_response(&response)
    }
}

fn write_json_response(response: &QueryResponse) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    serde_json::to_writer_pretty(&mut output, response)
        .context("failed to serialize query json output")?;
    writeln!(output)?;
    output.flush()?;
    Ok(())
}

fn write_text_response(response: &QueryResponse) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());

    writeln!(output, "Query: {}", response.query)?;
    writeln!(
        output,
        "Collection: {}/{} model={} dim={} n_chunks={} elapsed_ms={:.3}",
        response.model_info.store,
        response.model_info.collection,
        response.model_info.model,
        response.model_info.dim,
        response.model_info.n_chunks,
        response.elapsed_ms,
    )?;
    writeln!(
        output,
        "Coverage: title={} path={} chunk_ordinal={} text={}",
        response.coverage.title,
        response.coverage.path,
        response.coverage.chunk_ordinal,
        response.coverage.text,
    )?;
    writeln!(output, "Results: {}", response.results.len())?;

    for result in &response.results {
        writeln!(
            output,
            "{}.\tchunk_id={}\tsimilarity={:.4}\traw={:.6}\t{}",
            result.rank,
            result.chunk_id,
            result.similarity,
            result.score_raw,
            result.document_title.as_deref().unwrap_or("(untitled)"),
        )?;
        if let Some(path) = &result.document_path {
            writeln!(output, "\tpath={path}")?;
        }
        if let Some(score) = result.mmr_score {
            writeln!(output, "\tmmr={score:.4}")?;
        }
        if let Some(score) = result.rerank_score {
            writeln!(output, "\trerank={score:.4}")?;
        }
        if let Some(snippet) = &result.snippet {
            writeln!(output, "\t{snippet}")?;
        }
    }

    for warning in &response.warnings {
        writeln!(output, "warning: {warning}")?;
    }

    output.flush()?;
    Ok(())
}
