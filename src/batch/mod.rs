pub mod field_writers;
pub mod fulltext;
pub mod indexer;
pub mod run_merger;
