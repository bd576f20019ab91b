mod common;

use chrono::Duration;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{aged_turn, settled_turn};
use m3a_memory::{ConsolidationTrigger, ErrorKind, Layer, MemoryEvent, MemoryStore, RetrievalQuery};

const MANUAL: ConsolidationTrigger = ConsolidationTrigger::Manual;

async fn seeded_store() -> MemoryStore {
    let store = MemoryStore::open_in_memory().unwrap();
    settled_turn(&store, "c1", "m1", "Alice works at Acme").await;
    settled_turn(&store, "c1", "m2", "weather is sunny").await;
    settled_turn(&store, "c1", "m3", "lunch was pasta").await;
    store.affect_tag("c1", "m1", "joy", 0.9, None).await.unwrap();
    store
}

/// Five turns, oldest first, that all clear a zero promotion threshold
async fn promotable_store() -> MemoryStore {
    let store = MemoryStore::open_in_memory().unwrap();
    let turns = [
        ("m1", "Alice works at Acme", 50),
        ("m2", "Bob lives in Berlin", 40),
        ("m3", "Carol likes Rome", 30),
        ("m4", "Dana works at Globex", 20),
        ("m5", "Erin lives in Oslo", 15),
    ];
    for (id, text, minutes) in turns {
        aged_turn(&store, "c1", id, text, Duration::minutes(minutes)).await;
    }
    store
        .update_config(json!({ "promotionThreshold": 0.0 }))
        .unwrap();
    store
}

fn layer_of(store: &MemoryStore, text: &str, message_id: &str) -> Option<Layer> {
    store
        .retrieve(&RetrievalQuery::new("c1", text))
        .unwrap()
        .memories
        .into_iter()
        .find(|m| m.message_id == message_id)
        .map(|m| m.layer)
}

#[tokio::test]
async fn promotes_affect_tagged_turns_into_encoding_and_graph() {
    let store = seeded_store().await;
    let run = store.consolidate("c1", MANUAL).await.unwrap();
    assert_eq!(run.promoted, 1);
    assert!(run.errors.is_empty());
    assert!(run.finished_at.is_some());

    let stats = store.stats("c1").unwrap();
    assert_eq!(stats.encoding, 1);
    assert_eq!(stats.salience, 0);
    assert!(stats.graph_entities >= 2);

    let related = store.related_entities("Alice", Some("c1"), None).unwrap();
    assert_eq!(related[0].value, "acme");
    assert_eq!(related[0].relation_type, "works_at");
    assert_eq!(related[0].hops, 1);

    let err = store.related_entities("nobody", None, Some(2)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn repeated_runs_do_not_duplicate_records() {
    let store = seeded_store().await;
    store.consolidate("c1", MANUAL).await.unwrap();
    let before = store.stats("c1").unwrap();

    let second = store.consolidate("c1", MANUAL).await.unwrap();
    let after = store.stats("c1").unwrap();
    assert_eq!(second.promoted, 0);
    assert_eq!(after.encoding, before.encoding);
    assert_eq!(after.salience, before.salience);
    assert_eq!(after.graph_relations, before.graph_relations);
    assert_eq!(after.consolidation_runs, 2);
}

#[tokio::test]
async fn strong_candidates_also_enter_salience() {
    let store = MemoryStore::open_in_memory().unwrap();
    settled_turn(&store, "c1", "m1", "budget plan draft").await;
    settled_turn(&store, "c1", "m2", "budget plan review").await;
    settled_turn(&store, "c1", "m3", "plan the budget today").await;
    store.affect_tag("c1", "m1", "stress", 0.9, None).await.unwrap();

    store.consolidate("c1", MANUAL).await.unwrap();
    let salience = store.salience_entries("c1", &Default::default()).unwrap();
    assert!(salience.iter().any(|s| s.source_id == "m1" && s.encoding_id.is_some()));
}

#[tokio::test]
async fn expired_turns_are_pruned() {
    let store = seeded_store().await;
    aged_turn(&store, "c1", "ancient", "an old remark", Duration::days(8)).await;

    let run = store.consolidate("c1", MANUAL).await.unwrap();
    assert_eq!(run.pruned, 1);
    let ids: Vec<String> = store
        .river_entries("c1", None)
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert!(!ids.contains(&"ancient".to_string()));
    assert_eq!(ids.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_runs_conflict_per_chat_only() {
    let store = seeded_store().await;
    settled_turn(&store, "c2", "n1", "Bob lives in Berlin").await;

    let (first, second, other) = tokio::join!(
        store.consolidate("c1", MANUAL),
        store.consolidate("c1", MANUAL),
        store.consolidate("c2", MANUAL),
    );
    assert!(first.is_ok());
    assert_eq!(second.unwrap_err().kind(), ErrorKind::Conflict);
    assert!(other.is_ok());

    // the guard is released once the run finishes
    assert!(store.consolidate("c1", MANUAL).await.is_ok());
}

#[tokio::test]
async fn cancelled_runs_stop_before_promoting_or_pruning() {
    let store = seeded_store().await;
    aged_turn(&store, "c1", "ancient", "an old remark", Duration::days(8)).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let run = store
        .consolidate_with_cancel("c1", MANUAL, cancel)
        .await
        .unwrap();
    assert!(run.was_cancelled());
    assert_eq!(run.promoted, 0);
    assert_eq!(run.pruned, 0);
    assert_eq!(store.river_entries("c1", None).unwrap().len(), 4);
}

#[tokio::test]
async fn cancelling_mid_run_keeps_only_whole_promotions() {
    let store = promotable_store().await;
    let cancel = CancellationToken::new();
    let mut pending = Box::pin(store.consolidate_with_cancel("c1", MANUAL, cancel.clone()));
    for _ in 0..3 {
        assert!(futures::poll!(pending.as_mut()).is_pending());
    }

    // between entries each message is either fully promoted or untouched
    assert_eq!(store.stats("c1").unwrap().encoding, 2);
    assert_eq!(layer_of(&store, "acme", "m1"), Some(Layer::L3));
    assert_eq!(layer_of(&store, "berlin", "m2"), Some(Layer::L3));
    assert_eq!(layer_of(&store, "rome", "m3"), Some(Layer::L1));
    assert_eq!(store.related_entities("Bob", Some("c1"), Some(1)).unwrap()[0].value, "berlin");
    let err = store.related_entities("Carol", Some("c1"), Some(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    cancel.cancel();
    let run = pending.await.unwrap();
    assert!(run.was_cancelled());
    assert_eq!(run.promoted, 2);
    assert_eq!(run.pruned, 0);

    let stats = store.stats("c1").unwrap();
    assert_eq!(stats.encoding, run.promoted);
    assert_eq!(layer_of(&store, "rome", "m3"), Some(Layer::L1));
    assert_eq!(store.consolidation_runs("c1", None).unwrap(), vec![run]);
}

#[tokio::test]
async fn a_run_dropped_part_way_is_still_recorded() {
    let store = promotable_store().await;
    let mut events = store.subscribe();
    {
        let mut pending = Box::pin(store.consolidate("c1", MANUAL));
        for _ in 0..3 {
            assert!(futures::poll!(pending.as_mut()).is_pending());
        }
    }

    let stats = store.stats("c1").unwrap();
    assert_eq!(stats.encoding, 2);
    let runs = store.consolidation_runs("c1", None).unwrap();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].was_aborted());
    assert!(runs[0].finished_at.is_some());
    assert_eq!(runs[0].promoted, stats.encoding);

    match events.try_recv().unwrap().event {
        MemoryEvent::ConsolidationCompleted { run } => assert_eq!(run, runs[0]),
        other => panic!("unexpected event {other:?}"),
    }

    // the chat is free again and the rest gets promoted
    let next = store.consolidate("c1", MANUAL).await.unwrap();
    assert_eq!(next.promoted, 3);
    assert_eq!(store.stats("c1").unwrap().encoding, 5);
}

#[tokio::test]
async fn runs_are_listed_newest_first_and_broadcast() {
    let store = seeded_store().await;
    let mut events = store.subscribe();

    let first = store.consolidate("c1", MANUAL).await.unwrap();
    let second = store
        .consolidate("c1", ConsolidationTrigger::Scheduled)
        .await
        .unwrap();

    let runs = store.consolidation_runs("c1", None).unwrap();
    assert_eq!(runs, vec![second.clone(), first.clone()]);
    assert_eq!(store.consolidation_runs("c1", Some(1)).unwrap(), vec![second]);

    let completed = events.try_recv().unwrap();
    match completed.event {
        MemoryEvent::ConsolidationCompleted { run } => assert_eq!(run.id, first.id),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn config_changes_apply_forward_only() {
    let store = seeded_store().await;
    let first = store.consolidate("c1", MANUAL).await.unwrap();

    store
        .update_config(json!({ "promotionThreshold": 0.0 }))
        .unwrap();
    let second = store.consolidate("c1", MANUAL).await.unwrap();
    assert_eq!(second.promoted, 2);

    let runs = store.consolidation_runs("c1", None).unwrap();
    assert_eq!(runs[1], first);
}

#[tokio::test]
async fn unknown_chats_cannot_be_consolidated() {
    let store = MemoryStore::open_in_memory().unwrap();
    let err = store.consolidate("ghost", MANUAL).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
