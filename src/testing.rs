//! Shared helpers for tests that talk to a live Redis.

use std::collections::HashMap;

use crate::streaming::STREAM_KEY_PREFIX;

/// Redis client for integration tests, honoring `REDIS_URL`.
pub(crate) fn test_client() -> redis::Client {
    let url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    redis::Client::open(url).expect("redis client")
}

/// A name unique to this test run so parallel tests don't collide.
pub(crate) fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

/// Installs the env-filtered log subscriber once per test binary.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Number of consumer groups on the given stream; 0 when the stream does
/// not exist.
pub(crate) async fn group_count(client: &redis::Client, stream_name: &str) -> usize {
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .expect("redis connection");
    let groups: Result<Vec<HashMap<String, redis::Value>>, redis::RedisError> =
        redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(format!("{STREAM_KEY_PREFIX}{stream_name}"))
            .query_async(&mut conn)
            .await;
    groups.map(|g| g.len()).unwrap_or(0)
}
