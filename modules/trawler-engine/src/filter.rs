use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use trawler_common::Result;

/// Membership test over request fingerprints.
///
/// Uniformly asynchronous so shared-backend implementations slot in behind
/// the same interface; the in-memory implementation returns immediately.
#[async_trait]
pub trait DuplicateFilter: Send + Sync {
    async fn add(&self, fingerprint: &str) -> Result<()>;
    async fn contains(&self, fingerprint: &str) -> Result<bool>;
    async fn len(&self) -> Result<usize>;
}

/// Hash-set filter for single-process crawls.
#[derive(Default)]
pub struct MemoryFilter {
    seen: Mutex<HashSet<String>>,
}

impl MemoryFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DuplicateFilter for MemoryFilter {
    async fn add(&self, fingerprint: &str) -> Result<()> {
        if !fingerprint.is_empty() {
            self.seen.lock().unwrap().insert(fingerprint.to_string());
        }
        Ok(())
    }

    async fn contains(&self, fingerprint: &str) -> Result<bool> {
        if fingerprint.is_empty() {
            return Ok(false);
        }
        Ok(self.seen.lock().unwrap().contains(fingerprint))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.seen.lock().unwrap().len())
    }
}
