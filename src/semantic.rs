use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;
use twox_hash::XxHash64;

use crate::error::{RagError, Result};
use crate::util::{fold_text, normalize_whitespace};

pub const DEFAULT_MODEL_ID: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_EMBEDDING_DIM: usize = 384;
pub const DEFAULT_BATCH_SIZE: usize = 256;
pub const DEFAULT_NORMALIZATION: &str = "l2";
pub const DEFAULT_BACKEND: &str = "local-hash-v1";

const BGE_QUERY_INSTRUCTION: &str = "Represent this sentence for searching relevant passages: ";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodeRole {
    Query,
    Passage,
}

/// Instruction prefix family of a model. Build and query paths must agree on it, so it is
/// derived from the model id alone.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefixPolicy {
    E5,
    Bge,
    Plain,
}

impl PrefixPolicy {
    pub fn apply(self, text: &str, role: EncodeRole) -> String {
        match (self, role) {
            (Self::E5, EncodeRole::Query) => format!("query: {text}"),
            (Self::E5, EncodeRole::Passage) => format!("passage: {text}"),
            (Self::Bge, EncodeRole::Query) => format!("{BGE_QUERY_INSTRUCTION}{text}"),
            (Self::Bge, EncodeRole::Passage) | (Self::Plain, _) => text.to_string(),
        }
    }
}

pub fn prefix_policy(model_id: &str) -> PrefixPolicy {
    let lowered = model_id.to_ascii_lowercase();
    if lowered.contains("multilingual-e5") || lowered.contains("/e5-") || lowered.starts_with("e5-")
    {
        PrefixPolicy::E5
    } else if lowered.contains("bge") {
        PrefixPolicy::Bge
    } else {
        PrefixPolicy::Plain
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticModelConfig {
    pub model_id: String,
    pub model_name: String,
    pub dimensions: usize,
    pub normalization: String,
    pub backend: String,
    pub prefix: PrefixPolicy,
}

struct ModelProfile {
    alias: &'static str,
    model_id: &'static str,
    dimensions: usize,
}

const MODEL_PROFILES: &[ModelProfile] = &[
    ModelProfile {
        alias: "minilm-l6",
        model_id: DEFAULT_MODEL_ID,
        dimensions: DEFAULT_EMBEDDING_DIM,
    },
    ModelProfile {
        alias: "mpnet-multi",
        model_id: "sentence-transformers/paraphrase-multilingual-mpnet-base-v2",
        dimensions: 768,
    },
    ModelProfile {
        alias: "bge-small",
        model_id: "BAAI/bge-small-en-v1.5",
        dimensions: 384,
    },
    ModelProfile {
        alias: "bge-base",
        model_id: "BAAI/bge-base-en-v1.5",
        dimensions: 768,
    },
    ModelProfile {
        alias: "bge-m3",
        model_id: "BAAI/bge-m3",
        dimensions: 1024,
    },
    ModelProfile {
        alias: "e5-small",
        model_id: "intfloat/e5-small-v2",
        dimensions: 384,
    },
    ModelProfile {
        alias: "e5-base",
        model_id: "intfloat/e5-base-v2",
        dimensions: 768,
    },
    ModelProfile {
        alias: "multilingual-e5-small",
        model_id: "intfloat/multilingual-e5-small",
        dimensions: 384,
    },
    ModelProfile {
        alias: "multilingual-e5-base",
        model_id: "intfloat/multilingual-e5-base",
        dimensions: 768,
    },
];

pub fn resolve_model_config(model_id: &str) -> Result<SemanticModelConfig> {
    let trimmed = model_id.trim();
    let requested = if trimmed.is_empty() {
        DEFAULT_MODEL_ID
    } else {
        trimmed
    };

    let profile = MODEL_PROFILES
        .iter()
        .find(|profile| {
            profile.alias.eq_ignore_ascii_case(requested)
                || profile.model_id.eq_ignore_ascii_case(requested)
        })
        .ok_or_else(|| RagError::ModelLoad {
            model_id: requested.to_string(),
            reason: format!(
                "unknown model; known aliases: {}",
                MODEL_PROFILES
                    .iter()
                    .map(|profile| profile.alias)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        })?;

    Ok(SemanticModelConfig {
        model_id: profile.model_id.to_string(),
        model_name: profile.alias.to_string(),
        dimensions: profile.dimensions,
        normalization: DEFAULT_NORMALIZATION.to_string(),
        backend: DEFAULT_BACKEND.to_string(),
        prefix: prefix_policy(profile.model_id),
    })
}

/// Canonical id for comparisons between a caller's expectation and a collection's record.
pub fn canonical_model_id(model_id: &str) -> String {
    resolve_model_config(model_id)
        .map(|config| config.model_id)
        .unwrap_or_else(|_| model_id.trim().to_string())
}

/// Raw text-to-vector runtime. Implementations see already-prefixed text.
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;
    fn dim(&self) -> usize;
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

pub trait ModelResolver: Send + Sync {
    fn resolve(&self, model_id: &str) -> Result<EmbeddingProvider>;
}

/// Offline hashed-feature encoder. Deterministic for a given model id.
pub struct LocalHashEmbedder {
    model_id: String,
    dimensions: usize,
    seed: u64,
}

impl LocalHashEmbedder {
    pub fn new(config: &SemanticModelConfig) -> Self {
        Self {
            model_id: config.model_id.clone(),
            dimensions: config.dimensions.max(8),
            seed: feature_hash(0, &config.model_id),
        }
    }
}

impl Embedder for LocalHashEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dim(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| embed_text_local(text, self.dimensions, self.seed))
            .collect())
    }
}

pub fn embed_text_local(payload: &str, dimensions: usize, seed: u64) -> Vec<f32> {
    let dims = dimensions.max(8);
    let mut vector = vec![0_f32; dims];

    for feature in text_features(payload) {
        let hash = feature_hash(seed, &feature);
        let index = (hash % dims as u64) as usize;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        let weight = 1.0 + (((hash >> 48) & 0xFF) as f32 / 255.0);
        vector[index] += sign * weight;
    }

    l2_normalize(&mut vector);
    vector
}

fn feature_hash(seed: u64, value: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(seed);
    hasher.write(value.as_bytes());
    hasher.finish()
}

fn text_features(payload: &str) -> Vec<String> {
    let folded = fold_text(&normalize_whitespace(payload));
    let words = folded
        .split(|character: char| !character.is_alphanumeric())
        .filter(|value| !value.is_empty())
        .collect::<Vec<&str>>();

    let mut features = Vec::<String>::with_capacity(words.len() * 8);
    for (index, word) in words.iter().enumerate() {
        features.push(format!("w:{word}"));
        if let Some(next) = words.get(index + 1) {
            features.push(format!("b:{word}_{next}"));
        }

        let marked = format!("^{word}$").chars().collect::<Vec<char>>();
        for window in marked.windows(3) {
            features.push(format!("c:{}", window.iter().collect::<String>()));
        }
    }
    features
}

/// Model handle bound to one prefix policy and one batch size.
#[derive(Clone)]
pub struct EmbeddingProvider {
    config: SemanticModelConfig,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl EmbeddingProvider {
    pub fn new(config: SemanticModelConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config,
            embedder,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn model_id(&self) -> &str {
        &self.config.model_id
    }

    pub fn dim(&self) -> usize {
        self.embedder.dim()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn encode(&self, texts: &[String], role: EncodeRole) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::<Vec<f32>>::with_capacity(texts.len());
        let mut width = None::<usize>;

        for batch in texts.chunks(self.batch_size) {
            let prefixed = batch
                .iter()
                .map(|text| self.config.prefix.apply(text, role))
                .collect::<Vec<String>>();
            let vectors = self.embedder.embed_batch(&prefixed)?;

            if vectors.len() != batch.len() {
                return Err(RagError::Provider {
                    model_id: self.config.model_id.clone(),
                    message: format!(
                        "returned {} vectors for {} inputs",
                        vectors.len(),
                        batch.len()
                    ),
                });
            }

            for mut vector in vectors {
                let expected = *width.get_or_insert(vector.len());
                if vector.len() != expected {
                    return Err(RagError::Dimensionality {
                        expected,
                        actual: vector.len(),
                    });
                }
                l2_normalize(&mut vector);
                out.push(vector);
            }

            debug!(
                model_id = %self.config.model_id,
                encoded = out.len(),
                total = texts.len(),
                "embedding batch encoded"
            );
        }

        if let Some(actual) = width
            && actual != self.embedder.dim()
        {
            return Err(RagError::Dimensionality {
                expected: self.embedder.dim(),
                actual,
            });
        }

        Ok(out)
    }

    pub fn encode_one(&self, text: &str, role: EncodeRole) -> Result<Vec<f32>> {
        self.encode(&[text.to_string()], role)?
            .pop()
            .ok_or_else(|| RagError::Provider {
                model_id: self.config.model_id.clone(),
                message: "empty response for single input".to_string(),
            })
    }
}

/// Resolves model ids to the local hashed encoder, caching one runtime per canonical id.
#[derive(Default)]
pub struct LocalModelResolver {
    cache: Mutex<HashMap<String, Arc<dyn Embedder>>>,
}

impl LocalModelResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelResolver for LocalModelResolver {
    fn resolve(&self, model_id: &str) -> Result<EmbeddingProvider> {
        let config = resolve_model_config(model_id)?;
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let embedder = cache
            .entry(config.model_id.clone())
            .or_insert_with(|| Arc::new(LocalHashEmbedder::new(&config)) as Arc<dyn Embedder>)
            .clone();
        Ok(EmbeddingProvider::new(config, embedder))
    }
}

pub fn dot(left: &[f32], right: &[f32]) -> f32 {
    left.iter()
        .zip(right.iter())
        .map(|(left_value, right_value)| left_value * right_value)
        .sum()
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let (mut numerator, mut left_norm, mut right_norm) = (0.0_f64, 0.0_f64, 0.0_f64);
    for (left_value, right_value) in left.iter().zip(right.iter()) {
        let (l, r) = (f64::from(*left_value), f64::from(*right_value));
        numerator += l * r;
        left_norm += l * l;
        right_norm += r * r;
    }

    if left_norm <= 0.0 || right_norm <= 0.0 {
        return 0.0;
    }
    numerator / (left_norm.sqrt() * right_norm.sqrt())
}

pub fn l2_normalize(values: &mut [f32]) {
    let squared_norm = values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>();

    if squared_norm <= 0.0 {
        return;
    }

    let norm = squared_norm.sqrt() as f32;
    if norm == 0.0 {
        return;
    }

    for value in values {
        *value /= norm;
    }
}

pub fn encode_embedding_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::<u8>::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_embedding_blob(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }

    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}
