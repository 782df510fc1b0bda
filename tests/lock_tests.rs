use std::sync::Arc;
use std::time::Duration;

use crawlpool::{LockConfig, LockError, LockStore, MemoryStore, RedisLock};

fn quick_cfg() -> LockConfig {
    LockConfig {
        ttl: 10,
        wait_timeout: 0,
        poll_interval: Some(Duration::from_millis(10)),
    }
}

#[tokio::test]
async fn empty_name_is_rejected() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    let result = RedisLock::new("", store, quick_cfg());
    assert!(matches!(result, Err(LockError::EmptyKey)));
}

#[tokio::test]
async fn second_acquire_fails_while_held() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    let mut first = RedisLock::new("job", store.clone(), quick_cfg()).unwrap();
    let mut second = RedisLock::new("job", store, quick_cfg()).unwrap();

    assert!(first.acquire().await.unwrap());
    assert!(!second.acquire().await.unwrap());
    assert!(first.locked());
    assert!(!second.locked());

    first.release(false).await.unwrap();
    assert!(second.acquire().await.unwrap());
}

#[tokio::test]
async fn racing_acquires_admit_exactly_one() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut lock = RedisLock::new("race", store, quick_cfg()).unwrap();
            lock.acquire().await.unwrap()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn double_release_is_a_noop() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    let mut lock = RedisLock::new("job", store, quick_cfg()).unwrap();
    assert!(lock.acquire().await.unwrap());
    lock.release(false).await.unwrap();
    lock.release(false).await.unwrap();
    assert!(!lock.locked());
}

#[tokio::test]
async fn release_without_acquire_leaves_holder_alone() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    let mut holder = RedisLock::new("job", store.clone(), quick_cfg()).unwrap();
    assert!(holder.acquire().await.unwrap());

    let mut bystander = RedisLock::new("job", store.clone(), quick_cfg()).unwrap();
    assert!(!bystander.acquire().await.unwrap());
    bystander.release(false).await.unwrap();

    // The holder's key survived the bystander's no-op release.
    assert!(store.ttl(holder.key()).await.unwrap() > 0);

    // Force release removes it regardless of ownership.
    bystander.release(true).await.unwrap();
    assert_eq!(store.ttl(holder.key()).await.unwrap(), -2);
}

#[tokio::test]
async fn stale_key_without_expiry_is_reaped() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    // A holder that died between SETNX and EXPIRE leaves a key with no TTL.
    store.set_nx("redis_lock:job", 0.0).await.unwrap();
    assert_eq!(store.ttl("redis_lock:job").await.unwrap(), -1);

    let mut lock = RedisLock::new("job", store, quick_cfg()).unwrap();
    assert!(lock.acquire().await.unwrap());
}

#[tokio::test]
async fn oversized_ttl_is_clamped() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    store.set_nx("redis_lock:job", 0.0).await.unwrap();
    store.expire("redis_lock:job", 1000).await.unwrap();

    let mut lock = RedisLock::new("job", store.clone(), quick_cfg()).unwrap();
    assert!(!lock.acquire().await.unwrap());
    assert!(store.ttl("redis_lock:job").await.unwrap() <= 10);
}

#[tokio::test]
async fn prolong_extends_and_reports_missing_key() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    let mut lock = RedisLock::new("job", store, quick_cfg()).unwrap();

    // Nothing to prolong yet: the store's negative sentinel passes through.
    assert!(lock.prolong(5).await.unwrap() < 0);

    assert!(lock.acquire().await.unwrap());
    let extended = lock.prolong(30).await.unwrap();
    assert!(extended > 10, "ttl was {extended}");
}

#[tokio::test]
async fn break_wait_ends_a_contended_wait() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    let mut holder = RedisLock::new("job", store.clone(), quick_cfg()).unwrap();
    assert!(holder.acquire().await.unwrap());

    let cfg = LockConfig {
        ttl: 10,
        wait_timeout: 3600,
        poll_interval: Some(Duration::from_millis(10)),
    };
    let mut waiter = RedisLock::new("job", store, cfg)
        .unwrap()
        .with_break_wait(|| true);
    let acquired = tokio::time::timeout(Duration::from_secs(2), waiter.acquire())
        .await
        .expect("break_wait should end the wait promptly")
        .unwrap();
    assert!(!acquired);
}

#[tokio::test]
async fn locked_scope_runs_and_releases() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    let lock = RedisLock::new("job", store.clone(), quick_cfg()).unwrap();
    let out = lock.locked_scope(|| async { 42 }).await.unwrap();
    assert_eq!(out, Some(42));
    assert_eq!(store.ttl("redis_lock:job").await.unwrap(), -2);
}

#[tokio::test]
async fn locked_scope_skips_when_contended() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    let mut holder = RedisLock::new("job", store.clone(), quick_cfg()).unwrap();
    assert!(holder.acquire().await.unwrap());

    let lock = RedisLock::new("job", store, quick_cfg()).unwrap();
    let out = lock.locked_scope(|| async { 42 }).await.unwrap();
    assert_eq!(out, None);
}
