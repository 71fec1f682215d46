/// Redis Async Storage - Share persistence and IP bans
///
/// Keys:
/// - shares:<miner_id>        list of recent share records (newest first)
/// - miner:<miner_id>:shares  accepted share counter
/// - miners:last_share        sorted set, miner -> unix timestamp
/// - blocks:list              found blocks (newest first)
/// - banned_ips               set of banned addresses
///
/// Uses redis::aio::ConnectionManager for async operations

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Accepted share as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub miner_id: String,
    pub target: String,
    pub nonce: String,
    pub hash: String,
    pub path: String,
    pub difficulty: f64,
    pub is_block: bool,
    pub timestamp: i64,
}

#[async_trait]
pub trait ShareStore: Send + Sync {
    async fn save_share(&self, share: &ShareRecord) -> Result<()>;
}

#[async_trait]
pub trait BanList: Send + Sync {
    async fn is_banned(&self, ip: &str) -> Result<bool>;
    async fn ban(&self, ip: &str) -> Result<()>;
}

const BANNED_IPS_KEY: &str = "banned_ips";

/// Redis storage manager
pub struct RedisStorage {
    client: redis::Client,
    connection: Arc<RwLock<Option<redis::aio::ConnectionManager>>>,
    share_retention: usize,
}

impl RedisStorage {
    /// Create new Redis storage. Connects lazily on first use.
    pub fn new(redis_url: &str, share_retention: usize) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(None)),
            share_retention: if share_retention == 0 { 10_000 } else { share_retention },
        })
    }

    /// Get async connection (lazy initialization)
    async fn get_connection(&self) -> Result<redis::aio::ConnectionManager> {
        let mut conn_guard = self.connection.write().await;

        if let Some(conn) = conn_guard.as_ref() {
            return Ok(conn.clone());
        }

        let manager = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow!("Failed to get connection manager: {}", e))?;
        *conn_guard = Some(manager.clone());
        Ok(manager)
    }

    /// Health check
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Redis PING failed: {}", e))?;

        if pong != "PONG" {
            return Err(anyhow!("Redis health check failed: got {}", pong));
        }

        Ok(())
    }
}

#[async_trait]
impl ShareStore for RedisStorage {
    async fn save_share(&self, share: &ShareRecord) -> Result<()> {
        let mut conn = self.get_connection().await?;

        let share_json = serde_json::to_string(share)
            .map_err(|e| anyhow!("Failed to serialize share: {}", e))?;

        let list_key = format!("shares:{}", share.miner_id);
        conn.lpush::<_, _, ()>(&list_key, &share_json)
            .await
            .map_err(|e| anyhow!("Failed to store share: {}", e))?;
        conn.ltrim::<_, ()>(&list_key, 0, self.share_retention as isize - 1)
            .await
            .map_err(|e| anyhow!("Failed to trim share list: {}", e))?;

        let counter_key = format!("miner:{}:shares", share.miner_id);
        conn.incr::<_, _, ()>(&counter_key, 1)
            .await
            .map_err(|e| anyhow!("Failed to increment shares: {}", e))?;

        conn.zadd::<_, _, _, ()>("miners:last_share", &share.miner_id, share.timestamp)
            .await
            .map_err(|e| anyhow!("Failed to update miners:last_share: {}", e))?;

        if share.is_block {
            conn.lpush::<_, _, ()>("blocks:list", &share_json)
                .await
                .map_err(|e| anyhow!("Failed to record block: {}", e))?;
        }

        Ok(())
    }
}

#[async_trait]
impl BanList for RedisStorage {
    async fn is_banned(&self, ip: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        conn.sismember::<_, _, bool>(BANNED_IPS_KEY, ip)
            .await
            .map_err(|e| anyhow!("Failed to check ban list: {}", e))
    }

    async fn ban(&self, ip: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        conn.sadd::<_, _, ()>(BANNED_IPS_KEY, ip)
            .await
            .map_err(|e| anyhow!("Failed to ban {}: {}", ip, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_storage_creation() {
        // Client creation succeeds, connection fails later
        let storage = RedisStorage::new("redis://invalid", 0).unwrap();
        assert_eq!(storage.share_retention, 10_000);
        assert!(RedisStorage::new("not a url", 10).is_err());
    }

    #[test]
    fn test_share_serialization() {
        let share = ShareRecord {
            miner_id: "shai1qtest".to_string(),
            target: "1fff".to_string(),
            nonce: "12345678".to_string(),
            hash: "deadbeef".to_string(),
            path: "abc".to_string(),
            difficulty: 2.5,
            is_block: false,
            timestamp: 1234567890,
        };

        let json = serde_json::to_string(&share).unwrap();
        let deserialized: ShareRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(share, deserialized);
    }
}
