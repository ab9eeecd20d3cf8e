use std::time::Duration;

use offload::FetchOptions;

use crate::{returning, setup_manager};

#[tokio::test]
async fn test_get_cache_hit() {
    let manager = setup_manager(|_| {});
    manager
        .fetch_cached(
            "hit",
            Duration::from_secs(5),
            returning("data".to_owned()),
            FetchOptions::default(),
        )
        .await
        .unwrap();

    let result = manager.get("hit").await.unwrap();
    assert_eq!(result.data().unwrap(), "data");
    assert!(result.is_from_cache());
    assert!(!result.is_stale());
    assert!(result.expire_time().is_some());
}

#[tokio::test]
async fn test_get_cache_miss() {
    let manager = setup_manager::<String>(|_| {});

    let result = manager.get("miss").await.unwrap();
    assert_eq!(result.data(), None);
    assert!(!result.is_from_cache());
    assert!(!result.is_stale());
    assert_eq!(result.stale_time(), None);
    assert_eq!(result.expire_time(), None);
}

#[tokio::test]
async fn test_get_does_not_queue_refresh() {
    let manager = setup_manager(|_| {});
    manager
        .fetch("stale", returning("data".to_owned()), FetchOptions::default())
        .await
        .unwrap();

    let result = manager.get("stale").await.unwrap();
    assert!(result.is_stale());
    assert!(!manager.has_work());
}

#[tokio::test]
async fn test_get_many_cache_hit() {
    let manager = setup_manager(|_| {});
    for key in ["many1", "many2"] {
        manager
            .fetch_cached(
                key,
                Duration::from_secs(5),
                returning("data".to_owned()),
                FetchOptions::default(),
            )
            .await
            .unwrap();
    }

    let results = manager
        .get_many(&["many1", "manyX", "many2", "many1"])
        .await
        .unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(results[0].data().unwrap(), "data");
    assert_eq!(results[1].data(), None);
    assert!(!results[1].is_from_cache());
    assert_eq!(results[2].data().unwrap(), "data");
    assert_eq!(results[3].data(), results[0].data());
}

#[tokio::test]
async fn test_get_many_empty() {
    let manager = setup_manager::<String>(|_| {});
    let keys: [&str; 0] = [];
    assert!(manager.get_many(&keys).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_cache() {
    let manager = setup_manager(|_| {});
    for key in ["delete1", "delete2"] {
        manager
            .fetch_cached(
                key,
                Duration::from_secs(5),
                returning("data".to_owned()),
                FetchOptions::default(),
            )
            .await
            .unwrap();
    }
    assert!(manager.get("delete1").await.unwrap().is_from_cache());
    assert!(manager.get("delete2").await.unwrap().is_from_cache());

    assert_eq!(manager.delete(&["delete1", "delete2"]).await.unwrap(), 2);
    assert!(!manager.get("delete1").await.unwrap().is_from_cache());
    assert!(!manager.get("delete2").await.unwrap().is_from_cache());

    // absent keys do not count
    assert_eq!(manager.delete(&["delete1", "never"]).await.unwrap(), 0);
}

#[tokio::test]
async fn test_delete_counts_duplicates_once() {
    let manager = setup_manager(|_| {});
    manager
        .fetch("dup", returning(1u32), FetchOptions::default())
        .await
        .unwrap();

    assert_eq!(manager.delete(&["dup", "dup"]).await.unwrap(), 1);
}
