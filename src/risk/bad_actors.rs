use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashSet;
use tokio::time::{timeout, Duration};

use crate::error::EngineError;
use crate::Result;

pub const DEFAULT_BAD_ACTORS_KEY: &str = "bad_actors";

/// Lookup of flagged token / issuer ids
#[async_trait]
pub trait BadActorRegistry: Send + Sync {
    async fn contains(&self, id: &str) -> Result<bool>;
}

/// Fixed set, loaded from configuration
#[derive(Debug, Default, Clone)]
pub struct InMemoryBadActorRegistry {
    flagged: HashSet<String>,
}

impl InMemoryBadActorRegistry {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            flagged: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.flagged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flagged.is_empty()
    }
}

#[async_trait]
impl BadActorRegistry for InMemoryBadActorRegistry {
    async fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.flagged.contains(id))
    }
}

/// Redis set of flagged ids, shared with other bots
///
/// Membership is a single `SISMEMBER` on `key`.
pub struct RedisBadActorRegistry {
    conn: ConnectionManager,
    key: String,
}

impl RedisBadActorRegistry {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `key` - Set holding flagged ids
    pub async fn connect(redis_url: &str, key: impl Into<String>) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| EngineError::Registry("Redis connection timeout after 5 seconds".into()))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            key: key.into(),
        })
    }

    /// Add ids to the shared set (seeding from configuration)
    pub async fn flag_all(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(&self.key, ids).await?;
        tracing::debug!("Flagged {} ids in {}", ids.len(), self.key);
        Ok(())
    }
}

#[async_trait]
impl BadActorRegistry for RedisBadActorRegistry {
    async fn contains(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let flagged: bool = conn.sismember(&self.key, id).await?;
        Ok(flagged)
    }
}
