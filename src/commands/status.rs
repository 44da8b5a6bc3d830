use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::chunk_store::{ChunkStore, StoreCounts};
use crate::cli::StatusArgs;
use crate::collection::{IndexMeta, list_collections};

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub models_dir: PathBuf,
    pub db_path: PathBuf,
    pub chunk_store: Option<StoreCounts>,
    pub collections: Vec<IndexMeta>,
}

pub fn collect_status(models_dir: &Path, db_path: &Path) -> Result<StatusReport> {
    let chunk_store = match ChunkStore::open_if_present(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?
    {
        Some(store) => Some(
            store
                .counts()
                .with_context(|| format!("failed to count rows in {}", db_path.display()))?,
        ),
        None => {
            warn!(path = %db_path.display(), "chunk store missing");
            None
        }
    };

    let collections = list_collections(models_dir)
        .with_context(|| format!("failed to list collections under {}", models_dir.display()))?;

    Ok(StatusReport {
        models_dir: models_dir.to_path_buf(),
        db_path: db_path.to_path_buf(),
        chunk_store,
        collections,
    })
}

pub fn run(args: StatusArgs) -> Result<()> {
    let report = collect_status(&args.location.models_dir, &args.location.db_path)?;

    if let Some(counts) = &report.chunk_store {
        info!(
            path = %report.db_path.display(),
            sources = counts.sources,
            documents = counts.documents,
            chunks = counts.chunks,
            "chunk store status"
        );
    }
    info!(
        models_dir = %report.models_dir.display(),
        collections = report.collections.len(),
        "collection status"
    );

    let mut output = io::BufWriter::new(io::stdout().lock());
    if args.json {
        serde_json::to_writer_pretty(&mut output, &report)
            .context("failed to serialize status report")?;
        writeln!(output)?;
    } else {
        match &report.chunk_store {
            Some(counts) => writeln!(
                output,
                "Chunk store: {} sources={} documents={} chunks={}",
                report.db_path.display(),
                counts.sources,
                counts.documents,
                counts.chunks
            )?,
            None => writeln!(output, "Chunk store: {} (missing)", report.db_path.display())?,
        }
        writeln!(output, "Collections: {}", report.collections.len())?;
        for meta in &report.collections {
            writeln!(
                output,
                "{}/{}\tmodel={}\tdim={}\tn_chunks={}\tbuilt_at={}",
                meta.store, meta.collection, meta.model, meta.dim, meta.n_chunks, meta.built_at
            )?;
        }
    }
    output.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::collect_status;
    use crate::backend::StoreKind;
    use crate::commands::index::{BuildRequest, IndexOrchestrator};
    use crate::semantic::{DEFAULT_MODEL_ID, LocalModelResolver};
    use crate::test_support::municipal_store;

    #[test]
    fn status_lists_built_collections_and_tolerates_a_missing_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let models_dir = dir.path().join("models");
        let db_path = dir.path().join("missing.sqlite");

        let empty = collect_status(&models_dir, &db_path).expect("status");
        assert!(empty.chunk_store.is_none());
        assert!(empty.collections.is_empty());

        let chunks = municipal_store();
        let models = LocalModelResolver::new();
        IndexOrchestrator::new(&models_dir, &chunks, &models)
            .build(&BuildRequest {
                collection: Some("municipal".to_string()),
                ..BuildRequest::new(StoreKind::Approximate, DEFAULT_MODEL_ID)
            })
            .expect("build");

        let report = collect_status(&models_dir, &db_path).expect("status");
        assert_eq!(report.collections.len(), 1);
        assert_eq!(report.collections[0].store, StoreKind::Approximate);
        assert_eq!(report.collections[0].n_chunks, 3);
        assert!(!db_path.exists());
    }
}
