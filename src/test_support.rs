use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::chunk_store::{ChunkStore, NewDocument};
use crate::error::{RagError, Result};
use crate::semantic::{
    Embedder, EmbeddingProvider, LocalHashEmbedder, ModelResolver, resolve_model_config,
};

pub const MUNICIPAL_TEXTS: [&str; 3] = ["padrón municipal", "licencia de obra", "tasa de basuras"];

/// Chunk store holding one document per municipal text; chunk ids are 1, 2 and 3.
pub fn municipal_store() -> ChunkStore {
    let store = ChunkStore::open_in_memory().expect("in-memory store");
    let source = store.insert_source("ayuntamiento", "web").expect("source");

    for (ordinal, text) in MUNICIPAL_TEXTS.iter().enumerate() {
        let title = format!("Trámite {}", ordinal + 1);
        let path = format!("/tramites/{}", ordinal + 1);
        let document = store
            .insert_document(&NewDocument {
                source_id: source,
                title: Some(&title),
                path: Some(&path),
                run_id: Some(1),
            })
            .expect("document");
        store
            .insert_chunk(source, Some(document), Some(0), text)
            .expect("chunk");
    }
    store
}

struct CountingEmbedder {
    inner: LocalHashEmbedder,
    calls: Arc<AtomicUsize>,
}

impl Embedder for CountingEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed_batch(texts)
    }
}

/// Local resolver that counts every text it embeds.
#[derive(Default)]
pub struct CountingResolver {
    pub embedded: Arc<AtomicUsize>,
}

impl CountingResolver {
    pub fn embedded(&self) -> usize {
        self.embedded.load(Ordering::SeqCst)
    }
}

impl ModelResolver for CountingResolver {
    fn resolve(&self, model_id: &str) -> Result<EmbeddingProvider> {
        let config = resolve_model_config(model_id)?;
        let embedder = CountingEmbedder {
            inner: LocalHashEmbedder::new(&config),
            calls: Arc::clone(&self.embedded),
        };
        Ok(EmbeddingProvider::new(config, Arc::new(embedder)))
    }
}

struct FailingEmbedder {
    model_id: String,
    dim: usize,
}

impl Embedder for FailingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(RagError::Provider {
            model_id: self.model_id.clone(),
            message: "runtime unavailable".to_string(),
        })
    }
}

/// Resolver whose embedder fails every batch.
pub struct FailingResolver;

impl ModelResolver for FailingResolver {
    fn resolve(&self, model_id: &str) -> Result<EmbeddingProvider> {
        let config = resolve_model_config(model_id)?;
        let embedder = FailingEmbedder {
            model_id: config.model_id.clone(),
            dim: config.dimensions,
        };
        Ok(EmbeddingProvider::new(config, Arc::new(embedder)))
    }
}
