//! Redis connection helpers.

use redis::Client;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{info, warn};

/// Connect to Redis and return a ConnectionManager
///
/// The ConnectionManager automatically handles connection failures and
/// reconnections after the initial handshake. The connection is verified
/// with a PING before it is handed out.
pub async fn connect(url: &str) -> redis::RedisResult<ConnectionManager> {
    info!("Attempting to connect to Redis at {}", url);

    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    // Verify connection with PING
    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("Successfully connected to Redis");
    Ok(manager)
}

/// Connect to Redis with automatic retry on failure
///
/// Uses capped exponential backoff between attempts. Useful for handling
/// transient network issues during startup, when Redis may not be up yet.
pub async fn connect_with_retry(
    url: &str,
    max_retries: u32,
) -> redis::RedisResult<ConnectionManager> {
    let mut delay = Duration::from_millis(100);
    const MAX_DELAY: Duration = Duration::from_secs(5);

    let mut attempt = 0;
    loop {
        match connect(url).await {
            Ok(manager) => return Ok(manager),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                warn!(
                    error = %e,
                    attempt = %attempt,
                    delay_ms = %delay.as_millis(),
                    "Redis connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_invalid_url() {
        let result = connect("not-a-redis-url").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn test_connect() {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let result = connect(&redis_url).await;
        assert!(result.is_ok());
    }
}
