use serde::Serialize;

/// `flags[i]` is true when the hit at rank `i + 1` is relevant.
pub fn hit_at_k(flags: &[bool], k: usize) -> bool {
    flags.iter().take(k).any(|relevant| *relevant)
}

pub fn first_relevant_rank(flags: &[bool], k: usize) -> Option<usize> {
    flags
        .iter()
        .take(k)
        .position(|relevant| *relevant)
        .map(|index| index + 1)
}

pub fn reciprocal_rank(flags: &[bool], k: usize) -> f64 {
    first_relevant_rank(flags, k).map_or(0.0, |rank| 1.0 / rank as f64)
}

pub fn relevant_in_top_k(flags: &[bool], k: usize) -> usize {
    flags.iter().take(k).filter(|relevant| **relevant).count()
}

/// Binary-gain nDCG with `ideal_relevant` relevant items assumed at the top.
pub fn ndcg_at_k(flags: &[bool], k: usize, ideal_relevant: usize) -> f64 {
    let discount = |rank: usize| 1.0 / (rank as f64 + 1.0).log2();

    let dcg = flags
        .iter()
        .take(k)
        .enumerate()
        .filter(|(_, relevant)| **relevant)
        .map(|(index, _)| discount(index + 1))
        .sum::<f64>();
    let idcg = (1..=ideal_relevant.min(k)).map(discount).sum::<f64>();
    if idcg <= 0.0 {
        return 0.0;
    }
    (dcg / idcg).min(1.0)
}

/// Percentile with linear interpolation between order statistics; `p` is in [0, 100].
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|left, right| left.total_cmp(right));

    let position = (sorted.len() - 1) as f64 * (p.clamp(0.0, 100.0) / 100.0);
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    sorted[lower] + (sorted[upper] - sorted[lower]) * (position - lower as f64)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub p50: f64,
    pub p95: f64,
    pub mean: f64,
}

impl LatencySummary {
    pub fn from_samples(samples_ms: &[f64]) -> Self {
        Self {
            p50: percentile(samples_ms, 50.0),
            p95: percentile(samples_ms, 95.0),
            mean: mean(samples_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RankMetrics {
    pub queries: usize,
    pub recall: f64,
    pub mrr: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ndcg: Option<f64>,
}

#[derive(Debug, Default)]
pub struct RankAccumulator {
    queries: usize,
    hits: usize,
    reciprocal_sum: f64,
    ndcg_sum: f64,
    ndcg_samples: usize,
}

impl RankAccumulator {
    /// Adds one query; pass `ideal_relevant` to also score nDCG.
    pub fn record(&mut self, flags: &[bool], k: usize, ideal_relevant: Option<usize>) {
        self.queries += 1;
        self.hits += usize::from(hit_at_k(flags, k));
        self.reciprocal_sum += reciprocal_rank(flags, k);
        if let Some(ideal_relevant) = ideal_relevant {
            self.ndcg_sum += ndcg_at_k(flags, k, ideal_relevant);
            self.ndcg_samples += 1;
        }
    }

    pub fn finish(&self) -> RankMetrics {
        let per_query = |total: f64| {
            if self.queries == 0 {
                0.0
            } else {
                total / self.queries as f64
            }
        };
        RankMetrics {
            queries: self.queries,
            recall: per_query(self.hits as f64),
            mrr: per_query(self.reciprocal_sum),
            ndcg: (self.ndcg_samples > 0).then(|| self.ndcg_sum / self.ndcg_samples as f64),
        }
    }
}
