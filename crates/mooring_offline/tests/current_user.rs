//! The current user through the context: single-flight reads, default
//! ACLs, what local queries may see and which writes are refused.

use mooring_codec::ObjectKey;
use mooring_core::{Acl, CommandExecutor, ErrorKind, MooringConfig, QueryState, USER_CLASS};
use mooring_offline::{CurrentKind, MooringContext, UserKind};
use mooring_storage::ByteStore;
use mooring_testkit::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn context(bytes: Arc<dyn ByteStore>, config: MooringConfig) -> MooringContext {
    MooringContext::with_store(
        config,
        bytes,
        Arc::new(FakeBackend::new()) as Arc<dyn CommandExecutor>,
    )
    .unwrap()
}

#[tokio::test]
async fn concurrent_reads_collapse_into_one_disk_read() {
    let counting = Arc::new(CountingStore::in_memory());
    let bytes = Arc::clone(&counting) as Arc<dyn ByteStore>;
    let cancel = CancellationToken::new();
    {
        let ctx = context(Arc::clone(&bytes), MooringConfig::new());
        let user = saved_object(USER_CLASS, "u1", &[]);
        ctx.current_user().set_async(user, &cancel).await.unwrap();
    }

    let ctx = context(bytes, MooringConfig::new());
    counting.reset();
    let users = ctx.current_user();
    let (a, b, c) = tokio::join!(
        users.get_async(&cancel),
        users.get_async(&cancel),
        users.exists_async(&cancel)
    );
    let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert!(c.unwrap());
    assert_eq!(counting.reads_of(UserKind::STORAGE_KEY), 1);
    assert_eq!(a.object_id().as_deref(), Some("u1"));
}

#[tokio::test]
async fn default_acl_grants_the_current_user() {
    let ctx = context(memory_store(), MooringConfig::new());
    let cancel = CancellationToken::new();
    let user = saved_object(USER_CLASS, "u1", &[]);
    ctx.current_user().set_async(user, &cancel).await.unwrap();

    let mut acl = Acl::new();
    acl.set_public_read_access(true);
    ctx.default_acl().set(Some(acl), true);

    let post = ctx.create_object("Post", &cancel).await.unwrap();
    let applied = post.acl().unwrap().unwrap();
    let u1 = ObjectKey::ObjectId("u1".into());
    assert!(applied.public_read_access());
    assert!(applied.read_access(&u1));
    assert!(applied.write_access(&u1));
}

#[tokio::test]
async fn local_queries_respect_acls_of_the_current_user() {
    let config = MooringConfig::new().local_datastore_enabled(true);
    let ctx = context(memory_store(), config);
    let cancel = CancellationToken::new();
    let user = saved_object(USER_CLASS, "u1", &[]);
    ctx.current_user().set_async(user, &cancel).await.unwrap();
    ctx.default_acl().set(Some(Acl::new()), true);

    let post = ctx.create_object("Post", &cancel).await.unwrap();
    ctx.pin_all(None, &[post], &cancel).await.unwrap();
    let query = QueryState::builder("Post").from_local_datastore().build();
    assert_eq!(ctx.count(&query, &cancel).await.unwrap(), 1);

    ctx.current_user().log_out_async(&cancel).await.unwrap();
    assert_eq!(ctx.count(&query, &cancel).await.unwrap(), 0);
    let ignoring = QueryState::builder("Post").from_local_datastore().ignore_acls().build();
    assert_eq!(ctx.count(&ignoring, &cancel).await.unwrap(), 1);
}

#[tokio::test]
async fn writes_denied_by_the_acl_are_refused() {
    let ctx = context(memory_store(), MooringConfig::new());
    let cancel = CancellationToken::new();
    let user = saved_object(USER_CLASS, "u1", &[]);
    ctx.current_user().set_async(user, &cancel).await.unwrap();

    let mut acl = Acl::new();
    acl.set_public_read_access(true);
    acl.set_write_access(&ObjectKey::ObjectId("u2".into()), true);
    let post = saved_object("Post", "p1", &[]);
    post.set_acl(&acl).unwrap();

    let err = ctx.save_eventually(&post, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
    let err = ctx.delete_eventually(&post, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
    assert_eq!(ctx.eventually().pending_count(), 0);
    assert_eq!(post.deleting_eventually_count(), 0);

    acl.set_write_access(&ObjectKey::ObjectId("u1".into()), true);
    post.set_acl(&acl).unwrap();
    ctx.save_eventually(&post, &cancel).await.unwrap();
    assert_eq!(ctx.eventually().pending_count(), 1);
}

#[tokio::test]
async fn anonymous_users_are_created_on_demand() {
    let config = MooringConfig::new().auto_create_anonymous_user(true);
    let ctx = context(memory_store(), config);
    let cancel = CancellationToken::new();
    let access = ctx.access_context(&cancel).await.unwrap();
    assert!(access.user().is_none());
    assert!(ctx.current_user().is_lazy());
    let user = ctx.current_user().get_async(&cancel).await.unwrap().unwrap();
    assert!(user.estimated("authData").is_some());
}

#[tokio::test]
async fn installation_is_stable_across_restarts() {
    let bytes = memory_store();
    let cancel = CancellationToken::new();
    let first = {
        let ctx = context(Arc::clone(&bytes), MooringConfig::new().device_type("kiosk"));
        let installation = ctx.current_installation().get_or_create_async(&cancel).await.unwrap();
        assert_eq!(
            installation.get("deviceType").unwrap().and_then(|v| v.as_text().map(str::to_string)),
            Some("kiosk".to_string())
        );
        ctx.current_installation().installation_id(&cancel).await.unwrap()
    };
    let ctx = context(bytes, MooringConfig::new());
    assert_eq!(ctx.current_installation().installation_id(&cancel).await.unwrap(), first);
    assert!(ctx.current_installation().exists_async(&cancel).await.unwrap());
}
