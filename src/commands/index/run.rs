use std::io::{self, Write};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::backend::HnswParams;
use crate::chunk_store::ChunkStore;
use crate::cli::IndexArgs;
use crate::model::ChunkFilter;
use crate::semantic::LocalModelResolver;

use super::orchestrator::{BuildReport, BuildRequest, IndexOrchestrator};

pub fn run(args: IndexArgs) -> Result<()> {
    let db_path = &args.location.db_path;
    let Some(chunk_store) = ChunkStore::open_if_present(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?
    else {
        bail!("chunk store not found at {}", db_path.display());
    };

    let models = LocalModelResolver::new();
    let orchestrator = IndexOrchestrator::new(&args.location.models_dir, &chunk_store, &models);

    let request = BuildRequest {
        collection: args.collection.clone(),
        filter: ChunkFilter {
            source_id: args.source_id,
            run_id: args.run_id,
            limit: args.limit,
        },
        batch_size: args.batch_size.max(1),
        rebuild: args.rebuild,
        orphans: args.orphans,
        hnsw: HnswParams {
            m: args.hnsw_m.max(2),
            ef_construction: args.hnsw_ef_construction.max(1),
            ef_search: args.hnsw_ef_search.max(1),
            ..HnswParams::default()
        },
        smoke_query: args.smoke_query.clone(),
        smoke_k: args.k,
        notes: args.notes.clone(),
        ..BuildRequest::new(args.store, &args.model)
    };

    info!(
        store = %args.store,
        model = %args.model,
        filters = %request.filter.describe(),
        rebuild = args.rebuild,
        "index build requested"
    );

    let report = match orchestrator.build(&request) {
        Ok(report) => report,
        Err(err) if err.is_informational() => {
            warn!(error = %err, "no chunks matched the selection; nothing to index");
            return Ok(());
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!("index build for store '{}' failed", args.store.as_str())
            });
        }
    };

    if args.json {
        write_json_report(&report)
    } else {
        write_text_report(&report)
    }
}

fn write_json_report(report: &BuildReport) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    serde_json::to_writer_pretty(&mut output, report)
        .context("failed to serialize build report")?;
    writeln!(output)?;
    output.flush()?;
    Ok(())
}

fn write_text_report(report: &BuildReport) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());

    writeln!(
        output,
        "Collection: {}/{} ({:?}) at {}",
        report.store,
        report.collection,
        report.outcome,
        report.path.display()
    )?;
    writeln!(
        output,
        "Stages: {}",
        report
            .stages
            .iter()
            .map(|stage| stage.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    )?;
    let counts = &report.counts;
    writeln!(
        output,
        "Chunks: selected={} scheduled={} new={} changed={} rebuilt={} skipped={} orphans={} pruned={} embedded={}",
        counts.selected,
        counts.scheduled,
        counts.new,
        counts.changed,
        counts.rebuilt,
        counts.skipped,
        counts.orphans,
        counts.pruned,
        counts.embedded,
    )?;
    if let Some(meta) = &report.meta {
        writeln!(
            output,
            "Index: n_chunks={} model={} dim={} built_at={} checksum={}",
            meta.n_chunks, meta.model, meta.dim, meta.built_at, meta.checksum
        )?;
    }

    if let Some(smoke) = &report.smoke {
        writeln!(output, "Smoke query: {}", smoke.query)?;
        for result in &smoke.results {
            writeln!(
                output,
                "{}.\tchunk_id={}\tsimilarity={:.4}\t{}",
                result.rank,
                result.chunk_id,
                result.similarity,
                result.document_title.as_deref().unwrap_or("(untitled)")
            )?;
        }
    }

    output.flush()?;
    Ok(())
}
