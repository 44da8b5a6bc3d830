mod gold;
mod harness;
mod metrics;
mod run;
#[cfg(test)]
mod tests;

pub use gold::{
    ContainsMatcher, EvaluationQuery, SignalKind, load_queries, parse_csv_queries, parse_queries,
};
pub use harness::{
    BackendFailure, CellMetrics, EvaluationReport, EvaluationRequest, Evaluator, JudgedHit,
    QueryOutcome, StoreEvaluation,
};
pub use metrics::{LatencySummary, RankMetrics};
pub use run::run;
