mod common;

use common::{MockFetcher, key, prepend, wait_until};
use linksync::cache::{
    CacheError, CacheKey, FetchError, FetchStatus, Mutation, RefetchTrigger, ResolveOptions,
    ResourceCache, SyncConfig,
};
use linksync::http_fetcher::WriteRequest;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

type TestCache = ResourceCache<Value, WriteRequest>;
type WriteOutcome = Result<Option<Value>, FetchError>;

/// Start a mutation whose write completes when the returned sender fires.
fn spawn_gated(
    cache: &TestCache,
    key: &CacheKey,
    item: Value,
) -> (oneshot::Sender<WriteOutcome>, JoinHandle<Result<Option<Value>, CacheError>>) {
    let (tx, rx) = oneshot::channel::<WriteOutcome>();
    let cache = cache.clone();
    let key = key.clone();
    let task = tokio::spawn(async move {
        let write = async move {
            rx.await
                .unwrap_or_else(|_| Err(FetchError::Other("write abandoned".to_string())))
        };
        cache.mutate_with(&key, prepend(item), [], write).await
    });
    (tx, task)
}

async fn wait_pending(cache: &TestCache, key: &CacheKey, count: usize) {
    wait_until(|| cache.peek(key).is_some_and(|s| s.pending_mutations == count)).await;
}

#[tokio::test]
async fn test_sequential_mutations_apply_in_order() {
    let cache = TestCache::new(SyncConfig::default());
    let list = key("links:list");
    cache.set_value(&list, json!([1]));

    for item in [2, 3, 4] {
        cache
            .mutate_with(&list, prepend(json!(item)), [], async { Ok(None) })
            .await
            .unwrap();
    }

    let snapshot = cache.peek(&list).unwrap();
    assert_eq!(snapshot.value, Some(json!([4, 3, 2, 1])));
    assert_eq!(snapshot.pending_mutations, 0);
    assert_eq!(cache.metrics().mutations_committed, 3);
}

#[tokio::test]
async fn test_out_of_order_confirmations_keep_issuance_order() {
    let cache = TestCache::new(SyncConfig::default());
    let list = key("links:list");
    cache.set_value(&list, json!([1]));

    let (first_tx, first) = spawn_gated(&cache, &list, json!(2));
    wait_pending(&cache, &list, 1).await;
    let (second_tx, second) = spawn_gated(&cache, &list, json!(3));
    wait_pending(&cache, &list, 2).await;
    assert_eq!(cache.peek(&list).unwrap().value, Some(json!([3, 2, 1])));

    // The later write lands first
    second_tx.send(Ok(None)).unwrap();
    second.await.unwrap().unwrap();
    let snapshot = cache.peek(&list).unwrap();
    assert_eq!(snapshot.value, Some(json!([3, 2, 1])));
    assert_eq!(snapshot.pending_mutations, 2);

    first_tx.send(Ok(None)).unwrap();
    first.await.unwrap().unwrap();
    let snapshot = cache.peek(&list).unwrap();
    assert_eq!(snapshot.value, Some(json!([3, 2, 1])));
    assert_eq!(snapshot.pending_mutations, 0);
}

#[tokio::test]
async fn test_failed_mutation_restores_previous_value() {
    let cache = TestCache::new(SyncConfig::default());
    let list = key("links:list");
    cache.set_value(&list, json!([{"id": 1}]));
    let before = cache.peek(&list).unwrap();

    let err = cache
        .mutate_with(&list, prepend(json!({"id": 2})), [], async {
            Err(FetchError::Status {
                code: 500,
                message: "boom".to_string(),
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::WriteFailed { .. }));

    let after = cache.peek(&list).unwrap();
    assert_eq!(after.value, before.value);
    assert_eq!(after.status, FetchStatus::Fresh);
    assert_eq!(after.pending_mutations, 0);
    assert!(after.version > before.version);
}

#[tokio::test]
async fn test_rollback_replays_remaining_pending_deltas() {
    let cache = TestCache::new(SyncConfig::default());
    let list = key("links:list");
    cache.set_value(&list, json!([1]));

    let (first_tx, first) = spawn_gated(&cache, &list, json!(2));
    wait_pending(&cache, &list, 1).await;
    let (second_tx, second) = spawn_gated(&cache, &list, json!(3));
    wait_pending(&cache, &list, 2).await;

    // The earlier mutation fails while the later one is still outstanding
    first_tx
        .send(Err(FetchError::Transport("reset".to_string())))
        .unwrap();
    assert!(first.await.unwrap().is_err());
    let snapshot = cache.peek(&list).unwrap();
    assert_eq!(snapshot.value, Some(json!([3, 1])));
    assert_eq!(snapshot.pending_mutations, 1);

    second_tx.send(Ok(None)).unwrap();
    second.await.unwrap().unwrap();
    let snapshot = cache.peek(&list).unwrap();
    assert_eq!(snapshot.value, Some(json!([3, 1])));
    assert_eq!(snapshot.pending_mutations, 0);
}

#[tokio::test]
async fn test_later_rollback_keeps_earlier_confirmed_delta() {
    let cache = TestCache::new(SyncConfig::default());
    let list = key("links:list");
    cache.set_value(&list, json!([1]));

    let (first_tx, first) = spawn_gated(&cache, &list, json!(2));
    wait_pending(&cache, &list, 1).await;
    let (second_tx, second) = spawn_gated(&cache, &list, json!(3));
    wait_pending(&cache, &list, 2).await;

    first_tx.send(Ok(None)).unwrap();
    first.await.unwrap().unwrap();
    second_tx
        .send(Err(FetchError::Conflict("stale revision".to_string())))
        .unwrap();
    let err = second.await.unwrap().unwrap_err();
    assert!(matches!(err, CacheError::ConcurrentMutationConflict { .. }));

    assert_eq!(cache.peek(&list).unwrap().value, Some(json!([2, 1])));
}

#[tokio::test]
async fn test_server_value_replaces_optimistic_value() {
    let fetcher = Arc::new(
        MockFetcher::returning(json!([{"id": 1}]))
            .with_write_result(Ok(Some(json!([{"id": 2, "slug": "new"}, {"id": 1}])))),
    );
    let cache = TestCache::new(SyncConfig::default());
    cache.register_shared("links", fetcher.clone());
    let list = key("links:list");

    cache.resolve(&list, ResolveOptions::default()).await.unwrap();
    let confirmed = cache
        .mutate(
            &list,
            Mutation::new(WriteRequest::post(json!({"id": 2})), prepend(json!({"id": 2}))),
        )
        .await
        .unwrap();

    let expected = json!([{"id": 2, "slug": "new"}, {"id": 1}]);
    assert_eq!(confirmed, Some(expected.clone()));
    assert_eq!(cache.peek(&list).unwrap().value, Some(expected));
    assert_eq!(fetcher.writes(), 1);
    assert_eq!(fetcher.written()[0], WriteRequest::post(json!({"id": 2})));
}

#[tokio::test]
async fn test_confirmed_mutation_invalidates_declared_prefixes() {
    let fetcher = Arc::new(MockFetcher::returning(json!({"count": 2})));
    let cache = TestCache::new(SyncConfig::default());
    cache.register_shared("links", fetcher.clone());

    let list = key("links:list");
    cache.set_value(&list, json!([1]));
    cache.set_value(&key("links:stats"), json!({"count": 1}));
    cache.set_value(&key("admin:users"), json!([]));

    cache
        .mutate(
            &list,
            Mutation::new(WriteRequest::post(json!(2)), prepend(json!(2)))
                .invalidates(key("links:stats")),
        )
        .await
        .unwrap();

    assert_eq!(cache.peek(&list).unwrap().value, Some(json!([2, 1])));
    assert!(cache.peek(&key("links:stats")).is_none());
    assert!(cache.peek(&key("admin:users")).is_some());
}

#[tokio::test]
async fn test_links_list_optimistic_prepend_and_revert() {
    let fetcher = Arc::new(
        MockFetcher::returning(json!([{"id": 1}])).with_write_result(Err(FetchError::Status {
            code: 503,
            message: "unavailable".to_string(),
        })),
    );
    let cache = TestCache::new(SyncConfig::default());
    cache.register_shared("links", fetcher.clone());
    let list = key("links:list");
    let (_subscription, mut updates) = cache.subscribe_channel(&list);

    let resolved = cache.resolve(&list, ResolveOptions::default()).await.unwrap();
    assert_eq!(resolved.value, json!([{"id": 1}]));
    assert_eq!(cache.peek(&list).unwrap().status, FetchStatus::Fresh);

    let err = cache
        .mutate(
            &list,
            Mutation::new(WriteRequest::post(json!({"id": 2})), prepend(json!({"id": 2}))),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::WriteFailed { .. }));

    let mut seen = Vec::new();
    while let Ok(snapshot) = updates.try_recv() {
        seen.push(snapshot);
    }
    let mut values: Vec<Option<Value>> = seen.iter().map(|s| s.value.clone()).collect();
    values.dedup();
    assert_eq!(
        values,
        vec![
            None,
            Some(json!([{"id": 1}])),
            Some(json!([{"id": 2}, {"id": 1}])),
            Some(json!([{"id": 1}])),
        ]
    );

    let optimistic = seen
        .iter()
        .find(|s| s.value == Some(json!([{"id": 2}, {"id": 1}])))
        .unwrap();
    assert_eq!(optimistic.pending_mutations, 1);

    let last = seen.last().unwrap();
    assert_eq!(last.status, FetchStatus::Fresh);
    assert_eq!(last.pending_mutations, 0);
    assert!(seen.windows(2).all(|w| w[0].version < w[1].version));
    assert_eq!(fetcher.reads(), 1);
}

#[tokio::test]
async fn test_read_racing_confirmed_write_keeps_the_write() {
    let fetcher =
        Arc::new(MockFetcher::returning(json!([1])).with_delay(Duration::from_millis(100)));
    let cache = TestCache::new(SyncConfig::default());
    cache.register_shared("links", fetcher.clone());
    let list = key("links:list");
    cache.set_value(&list, json!([1]));

    // The read is issued before the write and answers with the old state
    assert!(cache.revalidate(&list, RefetchTrigger::Forced));
    cache
        .mutate_with(&list, prepend(json!(2)), [], async { Ok(None) })
        .await
        .unwrap();
    assert_eq!(cache.peek(&list).unwrap().value, Some(json!([2, 1])));

    wait_until(|| cache.peek(&list).is_some_and(|s| s.status == FetchStatus::Fresh)).await;
    let snapshot = cache.peek(&list).unwrap();
    assert_eq!(snapshot.value, Some(json!([2, 1])));
    assert_eq!(snapshot.pending_mutations, 0);
    assert_eq!(fetcher.reads(), 1);
}

fn exploding_delta(_: Option<&Value>) -> Value {
    panic!("delta exploded")
}

#[tokio::test]
async fn test_panicking_delta_is_rejected_without_writing() {
    let fetcher = Arc::new(MockFetcher::returning(json!([1])));
    let cache = TestCache::new(SyncConfig::default());
    cache.register_shared("links", fetcher.clone());
    let list = key("links:list");
    cache.set_value(&list, json!([1]));

    let err = cache
        .mutate(&list, Mutation::new(WriteRequest::post(json!({"id": 2})), exploding_delta))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::FetchAborted { .. }));
    assert_eq!(fetcher.writes(), 0);

    let snapshot = cache.peek(&list).unwrap();
    assert_eq!(snapshot.value, Some(json!([1])));
    assert_eq!(snapshot.pending_mutations, 0);

    // The key stays usable
    cache
        .mutate_with(&list, prepend(json!(3)), [], async { Ok(None) })
        .await
        .unwrap();
    assert_eq!(cache.peek(&list).unwrap().value, Some(json!([3, 1])));
}
