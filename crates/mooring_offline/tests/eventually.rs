//! Saves and deletes queued while offline, replayed later.

use mooring_codec::Value;
use mooring_core::{codes, CommandExecutor, MooringConfig, MooringError, SyncObject};
use mooring_offline::{FlushSummary, MooringContext};
use mooring_storage::ByteStore;
use mooring_testkit::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn context(
    bytes: Arc<dyn ByteStore>,
    backend: &Arc<FakeBackend>,
    config: MooringConfig,
) -> MooringContext {
    MooringContext::with_store(
        config,
        bytes,
        Arc::clone(backend) as Arc<dyn CommandExecutor>,
    )
    .unwrap()
}

#[tokio::test]
async fn offline_save_is_sent_once_online() {
    let backend = Arc::new(FakeBackend::new());
    let ctx = context(memory_store(), &backend, MooringConfig::new());
    let cancel = CancellationToken::new();
    backend.set_offline(true);

    let score = game_score(1337);
    ctx.save_eventually(&score, &cancel).await.unwrap();
    assert_eq!(ctx.eventually().pending_count(), 1);

    let summary = ctx.flush_eventually(&cancel).await.unwrap();
    assert_eq!(summary, FlushSummary { succeeded: 0, dropped: 0, pending: 1 });
    assert!(score.object_id().is_none());
    assert_eq!(score.get("score").unwrap().and_then(|v| v.as_f64()), Some(1337.0));

    backend.set_offline(false);
    let summary = ctx.flush_eventually(&cancel).await.unwrap();
    assert_eq!(summary, FlushSummary { succeeded: 1, dropped: 0, pending: 0 });

    let id = score.object_id().unwrap();
    assert_eq!(backend.object("GameScore", &id).unwrap()["score"], 1337);
    assert!(!score.has_pending_operations());
    let local = score.local_id().unwrap();
    assert_eq!(ctx.local_ids().get_object_id(&local).unwrap(), Some(id));
    // The queue's pin is gone, and with it the row.
    assert!(ctx.bytes().list("objects/").unwrap().is_empty());
}

#[tokio::test]
async fn queued_saves_survive_restart() {
    let bytes = memory_store();
    let backend = Arc::new(FakeBackend::new());
    let cancel = CancellationToken::new();
    backend.set_offline(true);
    {
        let ctx = context(Arc::clone(&bytes), &backend, MooringConfig::new());
        let score = game_score(7);
        score.put("player", "bob").unwrap();
        ctx.save_eventually(&score, &cancel).await.unwrap();
    }

    backend.set_offline(false);
    let ctx = context(bytes, &backend, MooringConfig::new());
    assert_eq!(ctx.eventually().pending_count(), 1);
    let summary = ctx.flush_eventually(&cancel).await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(backend.count("GameScore"), 1);
    let stored = backend.object("GameScore", "obj0001").unwrap();
    assert_eq!(stored["player"], "bob");
    assert_eq!(stored["score"], 7);
}

#[tokio::test]
async fn later_saves_reference_earlier_local_ids() {
    let backend = Arc::new(FakeBackend::new());
    let ctx = context(memory_store(), &backend, MooringConfig::new());
    let cancel = CancellationToken::new();
    backend.set_offline(true);

    let player = SyncObject::new("Player").unwrap();
    player.put("name", "ann").unwrap();
    ctx.save_eventually(&player, &cancel).await.unwrap();
    let score = game_score(3);
    score.put("player", player.pointer().unwrap()).unwrap();
    ctx.save_eventually(&score, &cancel).await.unwrap();

    backend.set_offline(false);
    let summary = ctx.flush_eventually(&cancel).await.unwrap();
    assert_eq!(summary.succeeded, 2);
    let player_id = player.object_id().unwrap();
    let stored = backend.object("GameScore", &score.object_id().unwrap()).unwrap();
    assert_eq!(stored["player"]["objectId"], player_id.as_str());
}

#[tokio::test]
async fn permanent_failures_drop_the_command_but_keep_the_change() {
    let backend = Arc::new(FakeBackend::new());
    let ctx = context(memory_store(), &backend, MooringConfig::new());
    let cancel = CancellationToken::new();

    let score = game_score(5);
    ctx.save_eventually(&score, &cancel).await.unwrap();
    backend.fail_next(MooringError::from_server(codes::INVALID_KEY_NAME, "bad key"));
    let summary = ctx.flush_eventually(&cancel).await.unwrap();
    assert_eq!(summary, FlushSummary { succeeded: 0, dropped: 1, pending: 0 });
    assert!(score.is_dirty_key("score"));
    assert_eq!(score.get("score").unwrap(), Some(Value::from(5)));
}

#[tokio::test]
async fn connection_failures_never_drop_a_command() {
    let backend = Arc::new(FakeBackend::new());
    let ctx = context(memory_store(), &backend, MooringConfig::new());
    let cancel = CancellationToken::new();
    backend.set_offline(true);

    let score = game_score(1);
    ctx.save_eventually(&score, &cancel).await.unwrap();
    for _ in 0..10 {
        let summary = ctx.flush_eventually(&cancel).await.unwrap();
        assert_eq!(summary, FlushSummary { succeeded: 0, dropped: 0, pending: 1 });
    }
    assert_eq!(ctx.eventually().pending_count(), 1);

    backend.set_offline(false);
    let summary = ctx.flush_eventually(&cancel).await.unwrap();
    assert_eq!(summary, FlushSummary { succeeded: 1, dropped: 0, pending: 0 });
    assert!(score.object_id().is_some());
}

#[tokio::test]
async fn queued_delete_removes_the_server_object() {
    let backend = Arc::new(FakeBackend::new());
    backend.insert("GameScore", "s1", serde_json::json!({"score": 5}));
    let ctx = context(memory_store(), &backend, MooringConfig::new());
    let cancel = CancellationToken::new();

    let score = saved_object("GameScore", "s1", &[("score", Value::from(5))]);
    ctx.delete_eventually(&score, &cancel).await.unwrap();
    assert_eq!(score.deleting_eventually_count(), 1);

    let summary = ctx.flush_eventually(&cancel).await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(backend.count("GameScore"), 0);
    assert!(score.is_deleted());
    assert_eq!(score.deleting_eventually_count(), 0);
}

#[tokio::test]
async fn cleared_queue_sends_nothing() {
    let backend = Arc::new(FakeBackend::new());
    let ctx = context(memory_store(), &backend, MooringConfig::new());
    let cancel = CancellationToken::new();
    ctx.save_eventually(&game_score(1), &cancel).await.unwrap();
    ctx.eventually().clear(&cancel).await.unwrap();
    ctx.flush_eventually(&cancel).await.unwrap();
    assert_eq!(backend.command_count(), 0);
}
