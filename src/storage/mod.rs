//! Storage backends for m3a-memory

mod jsonl;
mod sqlite;

pub use jsonl::RunLog;
pub use sqlite::SqliteStorage;
