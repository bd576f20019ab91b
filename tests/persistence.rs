mod common;

use serde_json::json;
use tempfile::TempDir;

use common::{memory_ids, settled_turn};
use m3a_memory::{AffectQuery, Config, ConsolidationTrigger, ErrorKind, MemoryStore};

#[tokio::test]
async fn tiers_graph_config_and_runs_survive_a_restart() {
    let dir = TempDir::new().unwrap();
    let config = Config::with_data_dir(dir.path());

    let (stats_before, run) = {
        let store = MemoryStore::open(config.clone()).unwrap();
        settled_turn(&store, "c1", "m1", "Alice works at Acme").await;
        settled_turn(&store, "c1", "m2", "the secret door code").await;
        store.affect_tag("c1", "m1", "joy", 0.9, Some("new job".into())).await.unwrap();
        store.pin("c1", "m1", "Alice's employer is Acme").await.unwrap();
        store.mute("c1", "m2").await.unwrap();
        store.update_config(json!({ "defaultTopK": 4 })).unwrap();
        let run = store
            .consolidate("c1", ConsolidationTrigger::Manual)
            .await
            .unwrap();
        (store.stats("c1").unwrap(), run)
    };

    let store = MemoryStore::open(config).unwrap();
    assert_eq!(store.stats("c1").unwrap(), stats_before);
    assert_eq!(store.config().unwrap().default_top_k, 4);
    assert_eq!(store.consolidation_runs("c1", None).unwrap(), vec![run]);

    let affect = store.affect_entries("c1", &AffectQuery::default()).unwrap();
    assert_eq!(affect[0].reason.as_deref(), Some("new job"));

    let related = store.related_entities("acme", Some("c1"), Some(1)).unwrap();
    assert_eq!(related[0].value, "alice");

    // muted content stays hidden after hydration
    assert!(store.search_lexical("c1", "secret", None).unwrap().is_empty());
    assert!(!memory_ids(&store, "c1", "secret door").contains(&"m2".to_string()));
    assert!(memory_ids(&store, "c1", "acme").contains(&"m1".to_string()));
}

#[tokio::test]
async fn lookalike_chat_ids_keep_their_own_run_history() {
    let dir = TempDir::new().unwrap();
    let config = Config::with_data_dir(dir.path());
    {
        let store = MemoryStore::open(config.clone()).unwrap();
        for chat in ["a/b", "a_b"] {
            settled_turn(&store, chat, "m1", "hello there").await;
            store
                .consolidate(chat, ConsolidationTrigger::Manual)
                .await
                .unwrap();
        }
    }

    let store = MemoryStore::open(config).unwrap();
    for chat in ["a/b", "a_b"] {
        let runs = store.consolidation_runs(chat, None).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].chat_id, chat);
    }
}

#[tokio::test]
async fn a_failing_run_log_still_keeps_the_run() {
    let dir = TempDir::new().unwrap();
    let config = Config::with_data_dir(dir.path());
    let store = MemoryStore::open(config.clone()).unwrap();
    settled_turn(&store, "c1", "m1", "Alice works at Acme").await;
    std::fs::remove_dir_all(config.runs_dir()).unwrap();

    let run = store
        .consolidate("c1", ConsolidationTrigger::Manual)
        .await
        .unwrap();
    assert!(run.errors.iter().any(|e| e.starts_with("run log")));
    assert_eq!(store.consolidation_runs("c1", None).unwrap(), vec![run]);
}

#[tokio::test]
async fn rejected_config_patches_change_nothing() {
    let dir = TempDir::new().unwrap();
    let config = Config::with_data_dir(dir.path());
    {
        let store = MemoryStore::open(config.clone()).unwrap();
        let err = store
            .update_config(json!({ "lexicalWeight": 0.9, "bogus": true }))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        let err = store
            .update_config(json!({ "lexicalWeight": "high" }))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert_eq!(store.config().unwrap(), config.memory);
    }

    let reopened = MemoryStore::open(config.clone()).unwrap();
    assert_eq!(reopened.config().unwrap(), config.memory);
}

#[tokio::test]
async fn reingesting_a_known_turn_keeps_the_original() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::open(Config::with_data_dir(dir.path())).unwrap();
    let original = settled_turn(&store, "c1", "m1", "first version").await;
    let again = settled_turn(&store, "c1", "m1", "second version").await;
    assert_eq!(again, original);

    let err = store
        .ingest("c1", m3a_memory::IngestRequest::new("   "))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(store.river_stats("c1").unwrap().total, 1);
}
