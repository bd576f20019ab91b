#![allow(dead_code)]

use chrono::{Duration, Utc};
use m3a_memory::{IngestRequest, MemoryStore, RiverEntry, Role};

/// A turn old enough to be past the consolidation grace period
pub async fn settled_turn(store: &MemoryStore, chat: &str, id: &str, text: &str) -> RiverEntry {
    aged_turn(store, chat, id, text, Duration::minutes(10)).await
}

pub async fn aged_turn(
    store: &MemoryStore,
    chat: &str,
    id: &str,
    text: &str,
    age: Duration,
) -> RiverEntry {
    store
        .ingest(
            chat,
            IngestRequest::new(text)
                .with_id(id)
                .with_role(Role::User)
                .at(Utc::now() - age),
        )
        .await
        .unwrap()
}

pub fn memory_ids(store: &MemoryStore, chat: &str, text: &str) -> Vec<String> {
    store
        .retrieve(&m3a_memory::RetrievalQuery::new(chat, text))
        .unwrap()
        .memories
        .into_iter()
        .map(|m| m.message_id)
        .collect()
}
