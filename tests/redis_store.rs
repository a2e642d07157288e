//! RedisStore behavior tests against a live Redis instance.
//!
//! These are ignored by default. Run them with a reachable Redis:
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1/ cargo test --test redis_store -- --ignored
//! ```

use std::time::Duration;

use keygate::{Error, LeakyBucketState, RedisStore, Store, TokenBucketState};

async fn connect() -> (RedisStore, redis::aio::ConnectionManager) {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    let client = redis::Client::open(url).expect("invalid REDIS_URL");
    let manager = redis::aio::ConnectionManager::new(client)
        .await
        .expect("redis unreachable");
    (RedisStore::new(manager.clone()), manager)
}

async fn clear(conn: &mut redis::aio::ConnectionManager, key: &str) {
    let _: () = redis::AsyncCommands::del(conn, key).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn increment_counts_and_clamps_at_zero() {
    let (store, mut conn) = connect().await;
    let key = "keygate-it.counter";
    clear(&mut conn, key).await;

    let ttl = Duration::from_secs(60);
    assert_eq!(store.increment(key, 1, ttl).await.unwrap(), 1);
    assert_eq!(store.increment(key, 1, ttl).await.unwrap(), 2);
    assert_eq!(store.increment(key, -5, ttl).await.unwrap(), 0);
    assert_eq!(store.get_counter(key).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn increment_arms_ttl_only_on_create() {
    let (store, mut conn) = connect().await;
    let key = "keygate-it.ttl";
    clear(&mut conn, key).await;

    store.increment(key, 1, Duration::from_secs(5)).await.unwrap();
    // A later increment with a longer TTL must not refresh the expiry.
    store.increment(key, 1, Duration::from_secs(500)).await.unwrap();

    let ttl: i64 = redis::cmd("TTL")
        .arg(key)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(ttl > 0 && ttl <= 5, "TTL should still be the creation TTL, got {ttl}");
}

#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn count_timestamps_trims_below_start() {
    let (store, mut conn) = connect().await;
    let key = "keygate-it.window";
    clear(&mut conn, key).await;

    let ttl = Duration::from_secs(60);
    store.add_timestamp(key, 100, ttl).await.unwrap();
    store.add_timestamp(key, 200, ttl).await.unwrap();
    store.add_timestamp(key, 300, ttl).await.unwrap();

    assert_eq!(store.count_timestamps(key, 150, 300).await.unwrap(), 2);
    // The trim removed the timestamp below 150 from the set itself.
    assert_eq!(store.count_timestamps(key, 0, 300).await.unwrap(), 2);
}

#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn bucket_states_survive_a_write_read_cycle() {
    let (store, mut conn) = connect().await;
    let ttl = Duration::from_secs(60);

    let tb_key = "keygate-it.token-bucket";
    clear(&mut conn, tb_key).await;
    let tb = TokenBucketState {
        tokens: 2.5,
        last_update_ns: 1_700_000_000_000_000_000,
    };
    store.set_token_bucket(tb_key, tb, ttl).await.unwrap();
    assert_eq!(store.get_token_bucket(tb_key).await.unwrap(), Some(tb));

    let lb_key = "keygate-it.leaky-bucket";
    clear(&mut conn, lb_key).await;
    let lb = LeakyBucketState {
        queue: 3,
        last_leak_ns: 1_700_000_000_000_000_000,
    };
    store.set_leaky_bucket(lb_key, lb, ttl).await.unwrap();
    assert_eq!(store.get_leaky_bucket(lb_key).await.unwrap(), Some(lb));

    assert_eq!(store.get_token_bucket("keygate-it.absent").await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn corrupt_hash_fields_surface_as_malformed_state() {
    let (store, mut conn) = connect().await;
    let key = "keygate-it.corrupt";
    clear(&mut conn, key).await;

    let _: () = redis::AsyncCommands::hset(&mut conn, key, "tokens", "not-a-number")
        .await
        .unwrap();

    let result = store.get_token_bucket(key).await;
    assert!(matches!(result, Err(Error::MalformedState { .. })));
}
