//! End-to-end scenarios exercising the public `Cache`/`Handle` surface over
//! `MemoryStorage`, matching spec §8's testable behaviors.

// Tests are allowed to use unwrap/expect freely.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rescache::{Cache, DefineOptions, MemoryOptions, MemoryStorage, TestClock, TimeSpec};

fn memory_cache(clock: Arc<TestClock>) -> Cache {
    let storage = Arc::new(MemoryStorage::new(MemoryOptions::default(), clock));
    Cache::builder().storage(storage).build().unwrap()
}

#[tokio::test(start_paused = true)]
async fn concurrent_calls_with_same_args_dedupe_to_one_producer_invocation() {
    let cache = memory_cache(Arc::new(TestClock::new()));
    let calls = Arc::new(AtomicUsize::new(0));

    let counted = calls.clone();
    let handle = cache
        .register(
            "slow_double",
            DefineOptions::<i32, i32> {
                ttl: TimeSpec::Fixed(10),
                ..Default::default()
            },
            move |n, _key| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<i32, anyhow::Error>(n * 2)
                }
            },
        )
        .await
        .unwrap();

    let (a, b, c) = tokio::join!(handle.call(21), handle.call(21), handle.call(21));
    assert_eq!(a.unwrap(), 42);
    assert_eq!(b.unwrap(), 42);
    assert_eq!(c.unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A different argument never joins the first call's in-flight cell.
    let different = handle.call(1).await.unwrap();
    assert_eq!(different, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ttl_expiry_triggers_a_fresh_producer_call() {
    let clock = Arc::new(TestClock::new());
    let cache = memory_cache(clock.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    let counted = calls.clone();
    let handle = cache
        .register(
            "ttl_probe",
            DefineOptions::<i32, i32> {
                ttl: TimeSpec::Fixed(2),
                ..Default::default()
            },
            move |n, _key| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok::<i32, anyhow::Error>(n)
                }
            },
        )
        .await
        .unwrap();

    assert_eq!(handle.call(5).await.unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Still within TTL: served from storage, producer not invoked again.
    assert_eq!(handle.call(5).await.unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(3);

    assert_eq!(handle.call(5).await.unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn a_failed_call_is_not_cached_and_the_next_call_retries() {
    let cache = memory_cache(Arc::new(TestClock::new()));
    let calls = Arc::new(AtomicUsize::new(0));

    let counted = calls.clone();
    let handle = cache
        .register(
            "flaky",
            DefineOptions::<i32, i32> {
                ttl: TimeSpec::Fixed(10),
                ..Default::default()
            },
            move |n, _key| {
                let counted = counted.clone();
                async move {
                    let attempt = counted.fetch_add(1, Ordering::SeqCst);
                    if attempt == 0 {
                        anyhow::bail!("transient failure")
                    }
                    Ok::<i32, anyhow::Error>(n)
                }
            },
        )
        .await
        .unwrap();

    let first = handle.call(7).await;
    assert!(first.is_err());

    let second = handle.call(7).await;
    assert_eq!(second.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalidating_a_reference_only_removes_keys_that_carry_it() {
    let cache = memory_cache(Arc::new(TestClock::new()));

    let handle = cache
        .register(
            "tagged",
            DefineOptions::<String, String> {
                ttl: TimeSpec::Fixed(30),
                reference_builder: Some(Arc::new(|args, _key, result| {
                    Box::pin(async move {
                        Ok::<Option<Vec<String>>, anyhow::Error>(Some(vec![
                            format!("group:{args}"),
                            result,
                        ]))
                    }) as futures::future::BoxFuture<'static, anyhow::Result<Option<Vec<String>>>>
                })),
                ..Default::default()
            },
            |args, _key| async move { Ok::<String, anyhow::Error>(format!("value-for-{args}")) },
        )
        .await
        .unwrap();

    handle.call("a".to_string()).await.unwrap();
    handle.call("b".to_string()).await.unwrap();

    assert_eq!(
        handle.get(&"a".to_string()).await,
        Some("value-for-a".to_string())
    );
    assert_eq!(
        handle.get(&"b".to_string()).await,
        Some("value-for-b".to_string())
    );

    let removed = handle.invalidate(&["group:a".to_string()]).await;
    assert_eq!(removed.len(), 1);

    assert_eq!(handle.get(&"a".to_string()).await, None);
    assert_eq!(
        handle.get(&"b".to_string()).await,
        Some("value-for-b".to_string())
    );
}

#[tokio::test]
async fn wildcard_invalidation_only_clears_matching_references() {
    let cache = memory_cache(Arc::new(TestClock::new()));

    let handle = cache
        .register(
            "wildcard_tagged",
            DefineOptions::<i32, i32> {
                ttl: TimeSpec::Fixed(30),
                reference_builder: Some(Arc::new(|args, _key, result| {
                    let _ = &result;
                    Box::pin(async move {
                        Ok::<Option<Vec<String>>, anyhow::Error>(Some(vec![format!("f{args}1x")]))
                    }) as futures::future::BoxFuture<'static, anyhow::Result<Option<Vec<String>>>>
                })),
                ..Default::default()
            },
            |n, _key| async move { Ok::<i32, anyhow::Error>(n) },
        )
        .await
        .unwrap();

    handle.call(0).await.unwrap();
    handle.call(1).await.unwrap();

    assert_eq!(handle.get(&0).await, Some(0));
    assert_eq!(handle.get(&1).await, Some(1));

    let removed = handle.invalidate(&["f*1*".to_string()]).await;
    assert_eq!(removed.len(), 2);

    assert_eq!(handle.get(&0).await, None);
    assert_eq!(handle.get(&1).await, None);
}

#[tokio::test(start_paused = true)]
async fn stale_while_revalidate_serves_the_old_value_then_refreshes_in_background() {
    let clock = Arc::new(TestClock::new());
    let cache = memory_cache(clock.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    let counted = calls.clone();
    let handle = cache
        .register(
            "swr",
            DefineOptions::<i32, i32> {
                ttl: TimeSpec::Fixed(1),
                stale: Some(TimeSpec::Fixed(9)),
                ..Default::default()
            },
            move |_n, _key| {
                let counted = counted.clone();
                async move {
                    let attempt = counted.fetch_add(1, Ordering::SeqCst);
                    Ok::<i32, anyhow::Error>(attempt as i32)
                }
            },
        )
        .await
        .unwrap();

    assert_eq!(handle.call(0).await.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Past the ttl, still inside the stale window: serves the old value and
    // triggers a background revalidation.
    clock.advance(2);
    assert_eq!(handle.call(0).await.unwrap(), 0);

    // Give the spawned revalidation a chance to run and settle.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert_eq!(handle.call(0).await.unwrap(), 1);
}

#[tokio::test]
async fn clear_all_drops_every_entry_for_a_wrapper() {
    let cache = memory_cache(Arc::new(TestClock::new()));
    let handle = cache
        .register(
            "clearable",
            DefineOptions::<i32, i32> {
                ttl: TimeSpec::Fixed(30),
                ..Default::default()
            },
            |n, _key| async move { Ok::<i32, anyhow::Error>(n) },
        )
        .await
        .unwrap();

    handle.call(1).await.unwrap();
    handle.call(2).await.unwrap();
    assert_eq!(handle.get(&1).await, Some(1));

    handle.clear_all().await;
    assert_eq!(handle.get(&1).await, None);
    assert_eq!(handle.get(&2).await, None);
}
