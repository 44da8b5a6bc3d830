pub mod backend;
pub mod chunk_store;
pub mod cli;
pub mod collection;
pub mod commands;
pub mod error;
pub mod manifest;
pub mod model;
pub mod rerank;
pub mod semantic;
pub mod util;

#[cfg(test)]
mod test_support;
