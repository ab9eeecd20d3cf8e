use std::time::Duration;

use offload::{FetchOptions, OffloadError, Outcome, Run};

use crate::{Calls, counting, never_called, panicking, returning, setup_manager};

#[tokio::test]
async fn test_drain() {
    let manager = setup_manager(|_| {});

    let result = manager
        .fetch("drain", returning("data".to_owned()), FetchOptions::default())
        .await
        .unwrap();
    assert!(!result.is_from_cache());

    let result = manager
        .fetch("drain", returning("data".to_owned()), FetchOptions::default())
        .await
        .unwrap();
    assert!(result.is_from_cache());
    assert!(result.is_stale());
    assert!(manager.has_work());

    let drained = manager.drain().await;
    assert!(!manager.has_work());
    assert_eq!(
        drained.into_values(),
        [("drain".to_owned(), "data".to_owned())]
    );
}

#[tokio::test]
async fn test_drain_empty() {
    let manager = setup_manager::<String>(|_| {});
    assert!(!manager.has_work());
    assert!(manager.drain().await.is_empty());
}

#[tokio::test]
async fn test_stale_refresh_is_queued_once() {
    let manager = setup_manager(|_| {});
    let calls = Calls::new();

    manager
        .fetch("refresh", counting(&calls), FetchOptions::default())
        .await
        .unwrap();
    for _ in 0..3 {
        let result = manager
            .fetch("refresh", counting(&calls), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(result.into_data(), Some(0));
    }

    let drained = manager.drain().await;
    assert_eq!(drained.len(), 1);
    assert!(matches!(drained.get("refresh"), Some(Ok(1))));
    assert_eq!(calls.count(), 2);

    // the refreshed value is served from now on
    let result = manager.get("refresh").await.unwrap();
    assert_eq!(result.into_data(), Some(1));
}

#[tokio::test]
async fn test_queue_non_exclusive() {
    let manager = setup_manager(|_| {});
    let calls = Calls::new();

    assert!(manager.queue("queue", counting(&calls), FetchOptions::non_exclusive()));
    assert!(manager.queue("queue", counting(&calls), FetchOptions::non_exclusive()));
    assert!(manager.has_work());

    let drained = manager.drain().await;
    assert_eq!(calls.count(), 2);
    // the last run wins
    assert!(matches!(drained.get("queue"), Some(Ok(1))));
}

#[tokio::test]
async fn test_queue_cached() {
    let manager = setup_manager(|_| {});
    let calls = Calls::new();
    let ttl = Duration::from_secs(1);

    let options = FetchOptions::default();
    assert!(manager.queue_cached("queue_cached", ttl, counting(&calls), options));
    assert!(!manager.queue_cached("queue_cached", ttl, counting(&calls), options));

    manager.drain().await;
    assert_eq!(calls.count(), 1);

    let result = manager.get("queue_cached").await.unwrap();
    assert!(result.is_from_cache());
    assert!(!result.is_stale());
    assert_eq!(result.into_data(), Some(0));
}

#[tokio::test]
async fn test_queue_cached_non_exclusive() {
    let manager = setup_manager(|_| {});
    let calls = Calls::new();
    let ttl = Duration::from_secs(1);

    let options = FetchOptions::non_exclusive();
    manager.queue_cached("non_exclusive", ttl, counting(&calls), options);
    manager.queue_cached("non_exclusive", ttl, counting(&calls), options);

    manager.drain().await;
    assert_eq!(calls.count(), 2);
}

#[tokio::test]
async fn test_drain_keeps_registration_order() {
    let manager = setup_manager(|_| {});

    for key in ["c", "a", "b"] {
        manager.queue(key, returning(key.to_owned()), FetchOptions::default());
    }

    let drained = manager.drain().await;
    assert_eq!(drained.keys().collect::<Vec<_>>(), ["c", "a", "b"]);
}

#[tokio::test]
async fn test_drain_isolates_failures() {
    let manager = setup_manager::<u32>(|_| {});

    manager.queue("first", returning(1), FetchOptions::default());
    manager.queue(
        "failing",
        |_| async { Err(anyhow::anyhow!("broken")) },
        FetchOptions::default(),
    );
    manager.queue("last", returning(3), FetchOptions::default());

    let drained = manager.drain().await;
    assert_eq!(drained.len(), 3);
    assert!(matches!(drained.get("first"), Some(Ok(1))));
    assert!(matches!(
        drained.get("failing"),
        Some(Err(OffloadError::Computation(_)))
    ));
    assert!(matches!(drained.get("last"), Some(Ok(3))));

    assert!(manager.get("last").await.unwrap().is_from_cache());
    assert!(!manager.get("failing").await.unwrap().is_from_cache());
}

#[tokio::test]
async fn test_drain_isolates_panics() {
    let manager = setup_manager::<u32>(|_| {});

    manager.queue("first", returning(1), FetchOptions::default());
    manager.queue("panicking", |_| panicking("boom"), FetchOptions::default());
    manager.queue("last", returning(3), FetchOptions::default());

    let drained = manager.drain().await;
    assert!(!manager.has_work());
    assert_eq!(drained.keys().collect::<Vec<_>>(), ["first", "panicking", "last"]);
    let err = match drained.get("panicking") {
        Some(Err(err)) => err,
        other => panic!("unexpected result: {other:?}"),
    };
    assert!(err.is_computation());
    assert!(format!("{err:#}").contains("computation panicked: boom"));

    assert_eq!(manager.get("last").await.unwrap().into_data(), Some(3));
    assert!(!manager.get("panicking").await.unwrap().is_from_cache());

    // the lock of the panicking item was released
    assert!(
        manager
            .store()
            .acquire_lock_if_absent("panicking", Duration::from_secs(1))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_drain_honors_bad_runs() {
    let manager = setup_manager(|_| {});

    manager.queue_cached(
        "bad",
        Duration::from_secs(60),
        |run: Run| async move {
            run.set_bad();
            Ok(Outcome::Ready("degraded".to_owned()))
        },
        FetchOptions::default(),
    );

    let drained = manager.drain().await;
    assert_eq!(
        drained.into_values(),
        [("bad".to_owned(), "degraded".to_owned())]
    );
    assert!(!manager.get("bad").await.unwrap().is_from_cache());
}

#[tokio::test]
async fn test_drain_skips_locked_keys() {
    let manager = setup_manager(|_| {});

    // somebody else is computing this key right now
    assert!(
        manager
            .store()
            .acquire_lock_if_absent("locked", Duration::from_secs(60))
            .await
            .unwrap()
    );

    manager.queue("locked", never_called::<String>(), FetchOptions::default());
    manager.queue("free", returning("free".to_owned()), FetchOptions::default());

    let drained = manager.drain().await;
    assert!(!drained.contains_key("locked"));
    assert!(drained.contains_key("free"));
    assert!(!manager.has_work());
}

#[tokio::test]
async fn test_work_queued_after_drain_waits_for_next_drain() {
    let manager = setup_manager(|_| {});
    let calls = Calls::new();

    manager.queue("again", counting(&calls), FetchOptions::default());
    manager.drain().await;

    // the key is no longer pending, so it can be queued again
    assert!(manager.queue("again", counting(&calls), FetchOptions::default()));
    assert_eq!(calls.count(), 1);

    let drained = manager.drain().await;
    assert!(matches!(drained.get("again"), Some(Ok(1))));
    assert_eq!(calls.count(), 2);
}
