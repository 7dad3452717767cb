//! Pins, cascading saves and offline queries through the context.

use mooring_codec::Value;
use mooring_core::{ErrorKind, MooringConfig, Operand, QueryState, SyncObject};
use mooring_offline::{MooringContext, DEFAULT_PIN};
use mooring_testkit::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn config() -> MooringConfig {
    MooringConfig::new().local_datastore_enabled(true)
}

fn context(bytes: Arc<dyn mooring_storage::ByteStore>) -> MooringContext {
    MooringContext::with_store(config(), bytes, Arc::new(FakeBackend::new())).unwrap()
}

#[tokio::test]
async fn pinning_a_cycle_saves_each_object_once() {
    let ctx = context(memory_store());
    let cancel = CancellationToken::new();
    let a = SyncObject::new("Node").unwrap();
    let b = SyncObject::new("Node").unwrap();
    let to_a = ctx.registry().assign_local_id(&a, ctx.local_ids()).unwrap();
    let to_b = ctx.registry().assign_local_id(&b, ctx.local_ids()).unwrap();
    a.put("next", to_b).unwrap();
    b.put("next", to_a).unwrap();

    ctx.pin_all(None, &[Arc::clone(&a)], &cancel).await.unwrap();

    let store = ctx.offline_store().unwrap();
    // The pin row plus both nodes.
    assert_eq!(store.rows(&cancel).await.unwrap().len(), 3);
    let query = QueryState::builder("Node").from_pin(DEFAULT_PIN).build();
    assert_eq!(ctx.count(&query, &cancel).await.unwrap(), 2);

    ctx.unpin_all(None, &[a], &cancel).await.unwrap();
    assert!(store.rows(&cancel).await.unwrap().is_empty());
}

#[tokio::test]
async fn objects_shared_by_two_pins_survive_one_unpin() {
    let ctx = context(memory_store());
    let cancel = CancellationToken::new();
    let score = game_score(10);

    ctx.pin_all(Some("a"), &[Arc::clone(&score)], &cancel).await.unwrap();
    ctx.pin_all(Some("b"), &[Arc::clone(&score)], &cancel).await.unwrap();
    ctx.unpin_all(Some("a"), &[Arc::clone(&score)], &cancel).await.unwrap();

    let query = QueryState::builder("GameScore").from_local_datastore().build();
    assert_eq!(ctx.count(&query, &cancel).await.unwrap(), 1);
    let pinned_to_a = QueryState::builder("GameScore").from_pin("a").build();
    assert_eq!(ctx.count(&pinned_to_a, &cancel).await.unwrap(), 0);
}

#[tokio::test]
async fn pinned_objects_survive_reopen() {
    let temp = TempFileStore::new();
    let cancel = CancellationToken::new();
    {
        let ctx = context(temp.bytes());
        let score = game_score(1337);
        score.put("player", "ann").unwrap();
        ctx.pin_all(Some("scores"), &[score], &cancel).await.unwrap();
    }

    let temp = temp.reopen();
    let ctx = context(temp.bytes());
    let query = QueryState::builder("GameScore")
        .from_pin("scores")
        .where_equal_to("player", "ann")
        .build();
    let found = ctx.find(&query, &cancel).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(
        found[0].get("score").unwrap().and_then(|v| v.as_f64()),
        Some(1337.0)
    );
    // Unsaved changes come back still pending.
    assert!(found[0].has_pending_operations());
}

#[tokio::test]
async fn local_queries_require_the_local_datastore() {
    let ctx = MooringContext::with_store(
        MooringConfig::new(),
        memory_store(),
        Arc::new(FakeBackend::new()),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let query = QueryState::builder("GameScore").from_local_datastore().build();
    let err = ctx.find(&query, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
    let err = ctx.pin_all(None, &[game_score(1)], &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
}

#[tokio::test]
async fn queries_see_unsaved_changes_and_sort_nulls_first() {
    let ctx = context(memory_store());
    let cancel = CancellationToken::new();
    let scores = vec![game_score(30), game_score(10), SyncObject::new("GameScore").unwrap()];
    ctx.pin_all(None, &scores, &cancel).await.unwrap();
    scores[0].increment("score", 5).unwrap();

    let query = QueryState::builder("GameScore")
        .from_local_datastore()
        .order_by_ascending("score")
        .build();
    let found = ctx.find(&query, &cancel).await.unwrap();
    let values: Vec<Option<f64>> = found
        .iter()
        .map(|o| o.estimated("score").and_then(|v| v.as_f64()))
        .collect();
    assert_eq!(values, vec![None, Some(10.0), Some(35.0)]);

    let tagged = QueryState::builder("GameScore")
        .from_local_datastore()
        .where_contains_all("tags", [Value::from("a")])
        .build();
    assert!(ctx.find(&tagged, &cancel).await.unwrap().is_empty());
}

#[tokio::test]
async fn mixed_all_lists_fail_before_matching() {
    let ctx = context(memory_store());
    let cancel = CancellationToken::new();
    let tagged = SyncObject::new("Post").unwrap();
    tagged.put("tags", vec![Value::from("alpha"), Value::from("beta")]).unwrap();
    ctx.pin_all(None, &[tagged], &cancel).await.unwrap();

    let list = Operand::List(vec![
        Operand::Value(Value::from("alpha")),
        Operand::starts_with("be"),
    ]);
    let query = QueryState::builder("Post")
        .add_condition("tags", "$all", list)
        .from_local_datastore()
        .build();
    let err = ctx.find(&query, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);

    let prefixes = QueryState::builder("Post")
        .where_contains_all_starts_with("tags", ["al", "be"])
        .from_local_datastore()
        .build();
    assert_eq!(ctx.count(&prefixes, &cancel).await.unwrap(), 1);
}

#[tokio::test]
async fn objects_being_deleted_are_hidden() {
    let backend = Arc::new(FakeBackend::new());
    backend.set_offline(true);
    let ctx = MooringContext::with_store(config(), memory_store(), backend).unwrap();
    let cancel = CancellationToken::new();
    let score = saved_object("GameScore", "s1", &[("score", Value::from(5))]);
    ctx.pin_all(None, &[Arc::clone(&score)], &cancel).await.unwrap();

    let query = QueryState::builder("GameScore").from_local_datastore().build();
    assert_eq!(ctx.count(&query, &cancel).await.unwrap(), 1);
    ctx.delete_eventually(&score, &cancel).await.unwrap();
    assert_eq!(ctx.count(&query, &cancel).await.unwrap(), 0);
}
