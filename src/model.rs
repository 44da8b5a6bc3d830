use serde::{Deserialize, Serialize};

pub type ChunkId = i64;

/// A normalized text fragment as produced by the ingestion pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: Option<i64>,
    pub source_id: i64,
    pub ordinal: Option<i64>,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Chunk row joined with its owning document, used for enrichment and evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: ChunkId,
    pub document_id: Option<i64>,
    pub document_title: Option<String>,
    pub document_path: Option<String>,
    pub ordinal: Option<i64>,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFilter {
    pub source_id: Option<i64>,
    pub run_id: Option<i64>,
    pub limit: Option<usize>,
}

impl ChunkFilter {
    pub fn describe(&self) -> String {
        let render = |value: Option<String>| value.unwrap_or_else(|| "*".to_string());
        format!(
            "source_id={}, run_id={}, limit={}",
            render(self.source_id.map(|value| value.to_string())),
            render(self.run_id.map(|value| value.to_string())),
            render(self.limit.map(|value| value.to_string())),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub rank: usize,
    pub chunk_id: ChunkId,
    pub score_raw: f32,
    pub similarity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmr_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
    pub document_id: Option<i64>,
    pub document_title: Option<String>,
    pub document_path: Option<String>,
    pub chunk_ordinal: Option<i64>,
    pub snippet: Option<String>,
}

impl RetrievalResult {
    pub fn bare(rank: usize, chunk_id: ChunkId, score_raw: f32, similarity: f64) -> Self {
        Self {
            rank,
            chunk_id,
            score_raw,
            similarity,
            mmr_score: None,
            rerank_score: None,
            document_id: None,
            document_title: None,
            document_path: None,
            chunk_ordinal: None,
            snippet: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ChunkFilter;

    #[test]
    fn filter_description_marks_unset_fields() {
        let filter = ChunkFilter {
            source_id: Some(3),
            run_id: None,
            limit: Some(10),
        };
        assert_eq!(filter.describe(), "source_id=3, run_id=*, limit=10");
    }
}
