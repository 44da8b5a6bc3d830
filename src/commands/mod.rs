pub mod evaluate;
pub mod index;
pub mod query;
pub mod status;
