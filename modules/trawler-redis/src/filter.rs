use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use trawler_common::Result;
use trawler_engine::DuplicateFilter;

use crate::{backend_error, connection};

/// Fingerprint set shared by every engine pointed at the same prefix.
pub struct RedisFilter {
    conn: ConnectionManager,
    key: String,
}

impl RedisFilter {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        Ok(Self {
            conn: connection(url).await?,
            key: format!("{prefix}:fingerprints"),
        })
    }
}

#[async_trait]
impl DuplicateFilter for RedisFilter {
    async fn add(&self, fingerprint: &str) -> Result<()> {
        if fingerprint.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(&self.key, fingerprint).await.map_err(backend_error)?;
        Ok(())
    }

    async fn contains(&self, fingerprint: &str) -> Result<bool> {
        if fingerprint.is_empty() {
            return Ok(false);
        }
        let mut conn = self.conn.clone();
        conn.sismember(&self.key, fingerprint).await.map_err(backend_error)
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.scard(&self.key).await.map_err(backend_error)
    }
}
