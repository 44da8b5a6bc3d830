mod run;
mod service;

pub use run::run;
pub use service::{
    Coverage, ModelInfo, OpenCollection, QueryRequest, QueryResponse, RetrievalService,
    SNIPPET_CHARS,
};
