//! Redis lease provider, run against a live server with `--ignored`

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use supercompose_director::supervisor::{acquire_lease, LeaseOptions, LeaseProvider, RedisLeaseProvider};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

#[tokio::test]
#[ignore = "needs a redis server"]
async fn test_redis_lease_is_exclusive() {
    let provider = Arc::new(RedisLeaseProvider::new(&redis_url()).await.unwrap());
    let key = Uuid::new_v4().to_string();
    let ttl = Duration::from_secs(5);

    assert!(provider.try_acquire(&key, "first", ttl).await.unwrap());
    assert!(!provider.try_acquire(&key, "second", ttl).await.unwrap());
    assert!(provider.extend(&key, "first", ttl).await.unwrap());
    assert!(!provider.extend(&key, "second", ttl).await.unwrap());

    // a stranger's release leaves the lease in place
    provider.release(&key, "second").await.unwrap();
    assert!(!provider.try_acquire(&key, "second", ttl).await.unwrap());

    provider.release(&key, "first").await.unwrap();
    assert!(provider.try_acquire(&key, "second", ttl).await.unwrap());
    provider.release(&key, "second").await.unwrap();
}

#[tokio::test]
#[ignore = "needs a redis server"]
async fn test_redis_lease_is_reacquirable_after_release() {
    let provider: Arc<dyn LeaseProvider> = Arc::new(RedisLeaseProvider::new(&redis_url()).await.unwrap());
    let key = Uuid::new_v4().to_string();
    let options = LeaseOptions::default();
    let cancel = CancellationToken::new();

    let lease = acquire_lease(provider.clone(), &key, &options, &cancel)
        .await
        .unwrap()
        .unwrap();
    assert!(acquire_lease(provider.clone(), &key, &options, &cancel)
        .await
        .unwrap()
        .is_none());

    lease.release().await;
    let again = acquire_lease(provider.clone(), &key, &options, &cancel)
        .await
        .unwrap()
        .unwrap();
    again.release().await;
}
