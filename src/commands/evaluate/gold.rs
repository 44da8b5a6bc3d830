use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::{Map, Value};

use crate::error::{RagError, Result};
use crate::model::{ChunkId, ChunkRecord};
use crate::util::{fold_text, normalize_whitespace};

/// One labelled query. Every expectation is optional; a query without any is
/// still retrieved (for latency) but not scored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EvaluationQuery {
    #[serde(default, deserialize_with = "lenient_label")]
    pub id: Option<String>,
    #[serde(default)]
    pub query: String,
    #[serde(default, deserialize_with = "lenient_ids")]
    pub expected_chunk_ids: Vec<ChunkId>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub expected_document_id: Option<i64>,
    #[serde(default, deserialize_with = "non_blank")]
    pub expected_title_contains: Option<String>,
    #[serde(default, deserialize_with = "non_blank")]
    pub expected_text_contains: Option<String>,
}

/// Accepted spellings per field, compared after lower-casing and replacing spaces with `_`.
const FIELD_ALIASES: &[(&str, &[&str])] = &[
    ("query", &["q"]),
    ("id", &["query_id", "qid"]),
    (
        "expected_chunk_ids",
        &[
            "expected_chunk_id",
            "expectedchunkid",
            "chunk_id",
            "chunk_ids",
            "expected_chunks",
            "expected_chunkid_list",
            "expected_chunk_ids_list",
            "relevants",
        ],
    ),
    ("expected_document_id", &["expected_doc_id", "doc_id"]),
    (
        "expected_title_contains",
        &[
            "expected_document_title_contains",
            "expected_doc_title_contains",
            "doc_title_contains",
            "title_contains",
            "expected_document_title",
        ],
    ),
    ("expected_text_contains", &["text_contains", "chunk_text_contains"]),
];

/// Relevance signals from strongest to weakest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    ChunkId,
    DocumentId,
    TitleContains,
    TextContains,
}

impl SignalKind {
    pub const PRIORITY: [SignalKind; 4] = [
        SignalKind::ChunkId,
        SignalKind::DocumentId,
        SignalKind::TitleContains,
        SignalKind::TextContains,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChunkId => "chunk_id",
            Self::DocumentId => "document_id",
            Self::TitleContains => "title_contains",
            Self::TextContains => "text_contains",
        }
    }

    /// Signals other than chunk ids are judged against chunk-store records.
    pub fn needs_records(self) -> bool {
        !matches!(self, Self::ChunkId)
    }
}

impl EvaluationQuery {
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            ..Self::default()
        }
    }

    pub fn label(&self, position: usize) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("q{}", position + 1))
    }

    pub fn has_signal(&self, signal: SignalKind) -> bool {
        match signal {
            SignalKind::ChunkId => !self.expected_chunk_ids.is_empty(),
            SignalKind::DocumentId => self.expected_document_id.is_some(),
            SignalKind::TitleContains => self.expected_title_contains.is_some(),
            SignalKind::TextContains => self.expected_text_contains.is_some(),
        }
    }

    /// Signals this query carries that can be judged, in priority order.
    pub fn signals(&self, records_available: bool) -> Vec<SignalKind> {
        SignalKind::PRIORITY
            .into_iter()
            .filter(|signal| self.has_signal(*signal))
            .filter(|signal| records_available || !signal.needs_records())
            .collect()
    }

    pub fn strongest_signal(&self, records_available: bool) -> Option<SignalKind> {
        self.signals(records_available).into_iter().next()
    }

    pub fn distinct_chunk_ids(&self) -> usize {
        self.expected_chunk_ids
            .iter()
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Reads a query set. Files ending in `.csv` are read as CSV; anything else is sniffed:
/// a JSON array, a `{"queries": [...]}` object, JSON Lines, or CSV with a header row.
/// Queries with blank text are dropped.
pub fn load_queries(path: &Path) -> Result<Vec<EvaluationQuery>> {
    let raw = fs::read_to_string(path)?;
    let is_csv = path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("csv"));
    let parsed = if is_csv {
        parse_csv_queries(&raw)
    } else {
        parse_queries(&raw)
    };

    let queries = parsed.map_err(|err| match err {
        RagError::InvalidRequest(reason) => {
            RagError::InvalidRequest(format!("{}: {reason}", path.display()))
        }
        other => other,
    })?;
    if queries.is_empty() {
        return Err(RagError::InvalidRequest(format!(
            "{} contains no usable queries",
            path.display()
        )));
    }
    Ok(queries)
}

pub fn parse_queries(raw: &str) -> Result<Vec<EvaluationQuery>> {
    let trimmed = raw.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let parsed = if trimmed.starts_with('[') {
        let items = serde_json::from_str::<Vec<Value>>(trimmed)
            .map_err(|err| RagError::InvalidRequest(err.to_string()))?;
        rows_to_queries(items)?
    } else if trimmed.starts_with('{') {
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(mut set)) if set.contains_key("queries") => match set.remove("queries") {
                Some(Value::Array(items)) => rows_to_queries(items)?,
                _ => {
                    return Err(RagError::InvalidRequest(
                        "\"queries\" must be a list".to_string(),
                    ));
                }
            },
            _ => parse_json_lines(trimmed)?,
        }
    } else {
        return parse_csv_queries(trimmed);
    };

    Ok(keep_usable(parsed))
}

/// CSV with a header row. Header names go through the same alias table as JSON keys,
/// and a leading byte-order mark is ignored.
pub fn parse_csv_queries(raw: &str) -> Result<Vec<EvaluationQuery>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(raw.trim_start_matches('\u{feff}').as_bytes());
    let headers = reader
        .headers()
        .map_err(|err| RagError::InvalidRequest(format!("csv header: {err}")))?
        .clone();

    let mut parsed = Vec::<EvaluationQuery>::new();
    for record in reader.records() {
        let record = record.map_err(|err| RagError::InvalidRequest(format!("csv: {err}")))?;
        let line = record.position().map_or(0, |position| position.line());
        let mut row = Map::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            if !field.is_empty() {
                merge_field(&mut row, header, Value::String(field.to_string()));
            }
        }
        parsed.push(row_to_query(row, &format!("line {line}"))?);
    }
    Ok(keep_usable(parsed))
}

fn parse_json_lines(raw: &str) -> Result<Vec<EvaluationQuery>> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            let location = format!("line {}", index + 1);
            match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(row)) => row_to_query(canonical_row(row), &location),
                Ok(_) => Err(RagError::InvalidRequest(format!(
                    "{location}: expected an object"
                ))),
                Err(err) => Err(RagError::InvalidRequest(format!("{location}: {err}"))),
            }
        })
        .collect()
}

fn rows_to_queries(items: Vec<Value>) -> Result<Vec<EvaluationQuery>> {
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let location = format!("item {}", index + 1);
            match item {
                Value::Object(row) => row_to_query(canonical_row(row), &location),
                _ => Err(RagError::InvalidRequest(format!(
                    "{location}: expected an object"
                ))),
            }
        })
        .collect()
}

fn row_to_query(row: Map<String, Value>, location: &str) -> Result<EvaluationQuery> {
    serde_json::from_value(Value::Object(row))
        .map_err(|err| RagError::InvalidRequest(format!("{location}: {err}")))
}

fn keep_usable(queries: Vec<EvaluationQuery>) -> Vec<EvaluationQuery> {
    queries
        .into_iter()
        .filter_map(|mut query| {
            query.query = normalize_whitespace(&query.query);
            (!query.query.is_empty()).then_some(query)
        })
        .collect()
}

fn canonical_field(name: &str) -> String {
    let normalized = name
        .replace('\u{feff}', "")
        .trim()
        .to_lowercase()
        .replace(' ', "_");
    FIELD_ALIASES
        .iter()
        .find(|(canonical, aliases)| {
            normalized == *canonical || aliases.contains(&normalized.as_str())
        })
        .map_or(normalized, |(canonical, _)| canonical.to_string())
}

fn canonical_row(row: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in row {
        merge_field(&mut out, &key, value);
    }
    out
}

/// Inserts under the canonical name. Chunk-id columns accumulate instead of overwriting,
/// so a single id and an id list given side by side are both kept.
fn merge_field(row: &mut Map<String, Value>, name: &str, value: Value) {
    let key = canonical_field(name);
    if key != "expected_chunk_ids" {
        row.insert(key, value);
        return;
    }
    if value.is_null() {
        return;
    }

    let merged = row
        .entry(key)
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(ids) = merged {
        match value {
            Value::Array(items) => ids.extend(items),
            other => ids.push(other),
        }
    }
}

/// Case-folded, accent-insensitive containment. Patterns with two or more word
/// tokens match when every token occurs; shorter patterns match as a substring.
pub struct ContainsMatcher {
    word: Regex,
}

impl ContainsMatcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            word: Regex::new(r"\w+")?,
        })
    }

    pub fn matches(&self, text: Option<&str>, pattern: &str) -> bool {
        if pattern.is_empty() {
            return false;
        }
        let haystack = fold_text(text.unwrap_or_default());
        let needle = fold_text(pattern);

        let tokens = self
            .word
            .find_iter(&needle)
            .map(|token| token.as_str())
            .filter(|token| token.chars().count() > 1)
            .collect::<Vec<&str>>();
        if tokens.len() >= 2 {
            tokens.iter().all(|token| haystack.contains(token))
        } else {
            haystack.contains(&needle)
        }
    }

    /// Whether a retrieved chunk satisfies `signal` for `query`.
    pub fn is_relevant(
        &self,
        query: &EvaluationQuery,
        signal: SignalKind,
        chunk_id: ChunkId,
        record: Option<&ChunkRecord>,
    ) -> bool {
        match signal {
            SignalKind::ChunkId => query.expected_chunk_ids.contains(&chunk_id),
            SignalKind::DocumentId => record
                .and_then(|record| record.document_id)
                .is_some_and(|document_id| query.expected_document_id == Some(document_id)),
            SignalKind::TitleContains => query
                .expected_title_contains
                .as_deref()
                .is_some_and(|pattern| {
                    self.matches(
                        record.and_then(|record| record.document_title.as_deref()),
                        pattern,
                    )
                }),
            SignalKind::TextContains => query
                .expected_text_contains
                .as_deref()
                .is_some_and(|pattern| {
                    self.matches(record.map(|record| record.text.as_str()), pattern)
                }),
        }
    }
}

fn id_from_value<E: de::Error>(value: &Value) -> Result<Option<i64>, E> {
    match value {
        Value::Null => Ok(None),
        Value::Number(number) => number
            .as_i64()
            .map(Some)
            .ok_or_else(|| E::custom(format!("id {number} is not an integer"))),
        Value::String(text) if text.trim().is_empty() => Ok(None),
        Value::String(text) => text
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| E::custom(format!("id '{text}' is not an integer"))),
        other => Err(E::custom(format!("unsupported id value {other}"))),
    }
}

fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    id_from_value(&Value::deserialize(deserializer)?)
}

/// Accepts a single id, a list, or a string separated by `,`, `;` or `|`. Repeated ids
/// are kept once, in first-seen order.
fn lenient_ids<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<ChunkId>, D::Error> {
    let mut ids = Vec::new();
    collect_ids::<D::Error>(&Value::deserialize(deserializer)?, &mut ids)?;
    Ok(ids)
}

fn collect_ids<E: de::Error>(value: &Value, ids: &mut Vec<ChunkId>) -> Result<(), E> {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_ids::<E>(item, ids)?;
            }
        }
        Value::String(text) => {
            for part in text.split([',', ';', '|']) {
                push_id(ids, id_from_value::<E>(&Value::String(part.to_string()))?);
            }
        }
        other => push_id(ids, id_from_value::<E>(other)?),
    }
    Ok(())
}

fn push_id(ids: &mut Vec<ChunkId>, id: Option<ChunkId>) {
    if let Some(id) = id
        && !ids.contains(&id)
    {
        ids.push(id);
    }
}

fn lenient_label<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    })
}

fn non_blank<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty()))
}
