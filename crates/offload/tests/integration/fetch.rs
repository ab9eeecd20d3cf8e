use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use offload::{Deferred, FetchOptions, OffloadError, Outcome, Run};

use crate::{Calls, counting, never_called, panicking, returning, setup_manager};

#[tokio::test]
async fn test_fetch() {
    let manager = setup_manager(|_| {});

    let result = manager
        .fetch("fetch", returning("data".to_owned()), FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(result.data().unwrap(), "data");
    assert!(!result.is_from_cache());
    assert!(!result.is_stale());
}

#[tokio::test]
async fn test_fetch_twice_is_stale() {
    let manager = setup_manager(|_| {});

    let result = manager
        .fetch("stale", returning("data".to_owned()), FetchOptions::default())
        .await
        .unwrap();
    assert!(!result.is_from_cache());
    assert!(!manager.has_work());

    let result = manager
        .fetch("stale", never_called(), FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(result.data().unwrap(), "data");
    assert!(result.is_from_cache());
    assert!(result.is_stale());
    assert!(result.stale_time().unwrap() >= chrono::TimeDelta::zero());
    // the refresh runs later
    assert!(manager.has_work());
}

#[tokio::test]
async fn test_fetch_cached_fresh() {
    let manager = setup_manager(|_| {});

    let result = manager
        .fetch_cached(
            "fresh",
            Duration::from_secs(5),
            returning("data".to_owned()),
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert!(!result.is_from_cache());

    let result = manager
        .fetch("fresh", never_called(), FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(result.data().unwrap(), "data");
    assert!(result.is_from_cache());
    assert!(!result.is_stale());
    assert!(result.stale_time().unwrap() < chrono::TimeDelta::zero());
    assert!(result.expire_time().unwrap() > Utc::now());
    assert!(!manager.has_work());
}

#[tokio::test]
async fn test_fetch_bad() {
    let manager = setup_manager(|_| {});

    let result = manager
        .fetch_cached(
            "bad",
            Duration::from_secs(5),
            |run: Run| async move {
                run.set_bad();
                Ok(Outcome::Ready("degraded".to_owned()))
            },
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.data().unwrap(), "degraded");
    assert!(!result.is_from_cache());

    let result = manager
        .fetch("bad", returning("data".to_owned()), FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(result.data().unwrap(), "data");
    assert!(!result.is_from_cache());
}

#[tokio::test]
async fn test_fetch_error() {
    let manager = setup_manager::<String>(|_| {});

    let err = manager
        .fetch(
            "error",
            |_| async { Err(anyhow::anyhow!("upstream is down")) },
            FetchOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(err.is_computation());
    assert_eq!(
        format!("{err:#}"),
        "computation for `error` failed: upstream is down"
    );

    // failures are not cached
    let result = manager.get("error").await.unwrap();
    assert!(!result.is_from_cache());
}

#[tokio::test]
async fn test_fetch_panic() {
    let manager = setup_manager::<String>(|_| {});

    let err = manager
        .fetch("panic", |_| panicking("boom"), FetchOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_computation());
    assert_eq!(
        format!("{err:#}"),
        "computation for `panic` failed: computation panicked: boom"
    );

    assert!(!manager.get("panic").await.unwrap().is_from_cache());

    // the lock was released despite the panic
    assert!(
        manager
            .store()
            .acquire_lock_if_absent("panic", Duration::from_secs(1))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_deferred() {
    let manager = setup_manager(|_| {});

    let result = manager
        .fetch_cached(
            "deferred",
            Duration::from_secs(5),
            |_| async {
                Ok(Outcome::from(Deferred::spawn(async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok("data".to_owned())
                })))
            },
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.data().unwrap(), "data");
    assert!(!result.is_from_cache());

    // the resolved value was cached
    let result = manager.get("deferred").await.unwrap();
    assert_eq!(result.data().unwrap(), "data");
}

#[tokio::test]
async fn test_deferred_already_waited() {
    let manager = setup_manager(|_| {});

    let result = manager
        .fetch_cached(
            "waited",
            Duration::from_secs(5),
            |_| async {
                let deferred = Deferred::spawn(async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok("data".to_owned())
                });
                deferred.wait().await.unwrap();
                Ok(Outcome::from(deferred))
            },
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.data().unwrap(), "data");
}

#[tokio::test]
async fn test_deferred_blocking() {
    let manager = setup_manager::<u32>(|_| {});

    let result = manager
        .fetch(
            "blocking",
            |_| async { Ok(Outcome::from(Deferred::spawn_blocking(|| Ok(6 * 7)))) },
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.into_data(), Some(42));
}

#[tokio::test]
async fn test_deferred_error() {
    let manager = setup_manager::<String>(|_| {});

    let err = manager
        .fetch(
            "deferred_error",
            |_| async {
                Ok(Outcome::from(Deferred::spawn(async {
                    Err::<String, _>(anyhow::anyhow!("deferred failure"))
                })))
            },
            FetchOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(&err, OffloadError::Deferred { key, .. } if key == "deferred_error"));
    assert!(err.is_computation());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fetches_are_coalesced() {
    let manager = Arc::new(setup_manager(|config| {
        config.lock_attempts = 100;
        config.lock_retry_delay = Duration::from_millis(5);
    }));
    let calls = Calls::new();

    let fetches: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                manager
                    .fetch_cached(
                        "coalesced",
                        Duration::from_secs(60),
                        move |_| async move {
                            calls.hit();
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(Outcome::Ready("data".to_owned()))
                        },
                        FetchOptions::default(),
                    )
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut computed = 0;
    for fetch in fetches {
        let result = fetch.await.unwrap();
        assert_eq!(result.data().unwrap(), "data");
        if !result.is_from_cache() {
            computed += 1;
        }
    }
    assert_eq!(calls.count(), 1);
    assert_eq!(computed, 1);
}

#[tokio::test]
async fn test_non_exclusive_fetch_ignores_lock() {
    let manager = setup_manager(|config| {
        config.lock_attempts = 1;
    });
    let calls = Calls::new();

    // an exclusive computation of the key is in flight
    let held = manager
        .store()
        .acquire_lock_if_absent("busy", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(held);

    let result = manager
        .fetch("busy", counting(&calls), FetchOptions::non_exclusive())
        .await
        .unwrap();
    assert_eq!(result.into_data(), Some(0));
    assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn test_expired_entry_is_a_miss() {
    let manager = setup_manager(|_| {});
    let calls = Calls::new();
    let options = FetchOptions::default().with_stale_grace(Duration::from_millis(20));

    manager
        .fetch("expiring", counting(&calls), options)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let result = manager
        .fetch("expiring", counting(&calls), options)
        .await
        .unwrap();
    assert_eq!(result.into_data(), Some(1));
    assert!(!manager.has_work());
}
