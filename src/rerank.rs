use std::cmp::Ordering;
use std::collections::HashSet;

use crate::error::Result;
use crate::semantic::cosine_similarity;
use crate::util::fold_text;

pub const DEFAULT_MMR_LAMBDA: f64 = 0.3;
pub const RERANK_TEXT_CHARS: usize = 800;
pub const MIN_RERANK_POOL: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MmrPick {
    pub index: usize,
    pub score: Option<f64>,
}

/// Maximal marginal relevance over a candidate list. The first pick is the most relevant
/// candidate; each later pick maximizes `lambda * relevance - (1 - lambda) * max_sim`, where
/// `max_sim` is the highest cosine to anything already picked. Candidates without a vector
/// carry no redundancy penalty. Candidates beyond `top_k` follow in their original order
/// without a score.
pub fn mmr_order(
    relevance: &[f64],
    vectors: &[Option<Vec<f32>>],
    lambda: f64,
    top_k: usize,
) -> Vec<MmrPick> {
    let total = relevance.len();
    if total == 0 {
        return Vec::new();
    }

    let lambda = lambda.clamp(0.0, 1.0);
    let limit = top_k.min(total).max(1);
    let mut remaining = (0..total).collect::<Vec<usize>>();
    let mut picks = Vec::<MmrPick>::with_capacity(total);

    let first = (0..total)
        .max_by(|left, right| {
            relevance[*left]
                .total_cmp(&relevance[*right])
                .then_with(|| right.cmp(left))
        })
        .unwrap_or(0);
    remaining.retain(|index| *index != first);
    picks.push(MmrPick {
        index: first,
        score: Some(lambda * relevance[first]),
    });

    while picks.len() < limit && !remaining.is_empty() {
        let mut best = None::<(usize, f64)>;
        for (slot, candidate) in remaining.iter().enumerate() {
            let redundancy = vectors
                .get(*candidate)
                .and_then(Option::as_ref)
                .map(|vector| {
                    picks
                        .iter()
                        .filter_map(|pick| vectors.get(pick.index).and_then(Option::as_ref))
                        .map(|selected| cosine_similarity(vector, selected))
                        .fold(f64::NEG_INFINITY, f64::max)
                })
                .filter(|value| value.is_finite())
                .unwrap_or(0.0);

            let score = lambda * relevance[*candidate] - (1.0 - lambda) * redundancy;
            if best.is_none_or(|(_, current)| score > current) {
                best = Some((slot, score));
            }
        }

        let Some((slot, score)) = best else {
            break;
        };
        let index = remaining.remove(slot);
        picks.push(MmrPick {
            index,
            score: Some(score),
        });
    }

    picks.extend(remaining.into_iter().map(|index| MmrPick { index, score: None }));
    picks
}

/// Joint (query, passage) relevance scorer applied to a bounded candidate pool.
pub trait PairScorer: Send + Sync {
    fn name(&self) -> &str;
    fn score_pairs(&self, query: &str, passages: &[&str]) -> Result<Vec<f64>>;
}

/// Offline scorer: accent-folded query term coverage plus a bonus for matched query bigrams.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalPairScorer;

const STEM_CHARS: usize = 5;

fn terms(text: &str) -> Vec<String> {
    fold_text(text)
        .split(|character: char| !character.is_alphanumeric())
        .filter(|token| token.chars().count() > 1)
        .map(str::to_string)
        .collect()
}

fn stem(token: &str) -> String {
    token.chars().take(STEM_CHARS).collect()
}

impl PairScorer for LexicalPairScorer {
    fn name(&self) -> &str {
        "lexical-overlap-v1"
    }

    fn score_pairs(&self, query: &str, passages: &[&str]) -> Result<Vec<f64>> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(vec![0.0; passages.len()]);
        }
        let query_bigrams = query_terms
            .windows(2)
            .map(|pair| format!("{} {}", pair[0], pair[1]))
            .collect::<Vec<_>>();

        Ok(passages
            .iter()
            .map(|passage| {
                let passage_terms = terms(passage);
                let exact = passage_terms.iter().cloned().collect::<HashSet<String>>();
                let stems = passage_terms
                    .iter()
                    .map(|term| stem(term))
                    .collect::<HashSet<String>>();

                let coverage = query_terms
                    .iter()
                    .map(|term| {
                        if exact.contains(term) {
                            1.0
                        } else if term.chars().count() >= STEM_CHARS && stems.contains(&stem(term))
                        {
                            0.5
                        } else {
                            0.0
                        }
                    })
                    .sum::<f64>()
                    / query_terms.len() as f64;

                let bigram_bonus = if query_bigrams.is_empty() {
                    0.0
                } else {
                    let joined = passage_terms.join(" ");
                    query_bigrams
                        .iter()
                        .filter(|bigram| joined.contains(bigram.as_str()))
                        .count() as f64
                        / query_bigrams.len() as f64
                };

                coverage + 0.5 * bigram_bonus
            })
            .collect())
    }
}

/// Indices of `scores` from best to worst; ties keep their incoming order.
pub fn order_by_score(scores: &[f64]) -> Vec<usize> {
    let mut order = (0..scores.len()).collect::<Vec<usize>>();
    order.sort_by(|left, right| {
        scores[*right]
            .partial_cmp(&scores[*left])
            .unwrap_or(Ordering::Equal)
    });
    order
}
