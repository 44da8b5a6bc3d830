use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::backend::StoreKind;
use crate::manifest::OrphanPolicy;
use crate::rerank::DEFAULT_MMR_LAMBDA;
use crate::semantic::{DEFAULT_BATCH_SIZE, DEFAULT_MODEL_ID};

#[derive(Parser, Debug)]
#[command(
    name = "munirag",
    version,
    about = "Vector indexing, retrieval and retrieval evaluation for municipal documents"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build or incrementally update a collection from the chunk store.
    Index(IndexArgs),
    /// Run one retrieval query against a collection.
    Query(QueryArgs),
    /// Score retrieval quality over a labelled query set.
    Evaluate(EvaluateArgs),
    /// List collections and chunk-store counts.
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StoreLocationArgs {
    #[arg(long, default_value = "models")]
    pub models_dir: PathBuf,

    #[arg(long, default_value = crate::chunk_store::DEFAULT_DB_PATH)]
    pub db_path: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct IndexArgs {
    #[command(flatten)]
    pub location: StoreLocationArgs,

    #[arg(long, value_enum, default_value_t = StoreKind::Exact)]
    pub store: StoreKind,

    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    pub model: String,

    #[arg(long)]
    pub collection: Option<String>,

    #[arg(long)]
    pub source_id: Option<i64>,

    #[arg(long)]
    pub run_id: Option<i64>,

    #[arg(long)]
    pub limit: Option<usize>,

    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    #[arg(long, default_value_t = false)]
    pub rebuild: bool,

    #[arg(long, value_enum, default_value_t = OrphanPolicy::Retain)]
    pub orphans: OrphanPolicy,

    #[arg(long, default_value_t = 16)]
    pub hnsw_m: usize,

    #[arg(long, default_value_t = 100)]
    pub hnsw_ef_construction: usize,

    #[arg(long, default_value_t = 64)]
    pub hnsw_ef_search: usize,

    #[arg(long)]
    pub smoke_query: Option<String>,

    #[arg(long, default_value_t = 5)]
    pub k: usize,

    #[arg(long)]
    pub notes: Option<String>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    #[command(flatten)]
    pub location: StoreLocationArgs,

    #[arg(long, value_enum, default_value_t = StoreKind::Exact)]
    pub store: StoreKind,

    #[arg(long)]
    pub collection: String,

    #[arg(long)]
    pub query: String,

    #[arg(long, default_value_t = 5)]
    pub k: usize,

    #[arg(long)]
    pub expected_model: Option<String>,

    /// Diversity re-ranking (maximal marginal relevance).
    #[arg(long, default_value_t = false)]
    pub mmr: bool,

    #[arg(long, default_value_t = DEFAULT_MMR_LAMBDA)]
    pub lambda: f64,

    /// Pairwise re-scoring of the candidate pool.
    #[arg(long, default_value_t = false)]
    pub rerank: bool,

    #[arg(long, default_value_t = false)]
    pub no_enrich: bool,

    #[arg(long)]
    pub ef_search: Option<usize>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    #[command(flatten)]
    pub location: StoreLocationArgs,

    #[arg(long)]
    pub collection: String,

    /// Labelled query set: CSV with a header row, a JSON array, {"queries": [...]}, or JSON Lines.
    #[arg(long)]
    pub queries: PathBuf,

    #[arg(
        long = "stores",
        value_enum,
        value_delimiter = ',',
        default_value = "exact,approximate"
    )]
    pub stores: Vec<StoreKind>,

    #[arg(long = "ks", value_delimiter = ',', default_value = "1,3,5,10")]
    pub ks: Vec<usize>,

    #[arg(long)]
    pub expected_model: Option<String>,

    #[arg(long, default_value_t = false)]
    pub mmr: bool,

    #[arg(long, default_value_t = DEFAULT_MMR_LAMBDA)]
    pub lambda: f64,

    #[arg(long, default_value_t = false)]
    pub rerank: bool,

    #[arg(long)]
    pub ef_search: Option<usize>,

    /// Retrieve once at the largest k and score smaller cutoffs on its prefix.
    #[arg(long, default_value_t = false)]
    pub prefix_scoring: bool,

    /// Skip writing metrics/results/matrix artifacts.
    #[arg(long, default_value_t = false)]
    pub no_artifacts: bool,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub location: StoreLocationArgs,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands};
    use crate::backend::StoreKind;
    use crate::manifest::OrphanPolicy;

    #[test]
    fn index_defaults_follow_the_deployment_layout() {
        let cli = Cli::try_parse_from(["munirag", "index", "--run-id", "3"]).expect("parse");
        let Commands::Index(args) = cli.command else {
            panic!("expected index command");
        };
        assert_eq!(args.location.models_dir.to_str(), Some("models"));
        assert_eq!(args.store, StoreKind::Exact);
        assert_eq!(args.batch_size, 256);
        assert_eq!(args.orphans, OrphanPolicy::Retain);
        assert_eq!(args.run_id, Some(3));
    }

    #[test]
    fn store_aliases_and_comma_lists_parse() {
        let cli = Cli::try_parse_from([
            "munirag",
            "evaluate",
            "--collection",
            "run_1",
            "--queries",
            "gold.json",
            "--stores",
            "chroma,faiss",
            "--ks",
            "1,5",
        ])
        .expect("parse");
        let Commands::Evaluate(args) = cli.command else {
            panic!("expected evaluate command");
        };
        assert_eq!(args.stores, vec![StoreKind::Approximate, StoreKind::Exact]);
        assert_eq!(args.ks, vec![1, 5]);
        assert!(!args.prefix_scoring);
    }
}
