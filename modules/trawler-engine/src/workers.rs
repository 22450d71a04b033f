use std::sync::{Arc, OnceLock};

use tokio::sync::Semaphore;

use trawler_common::{Result, TrawlError};

const DEFAULT_POOL_SIZE: usize = 50;

/// Process-wide offload pool for synchronous user code.
///
/// Blocking fetchers and pipeline stages run through here so they never
/// stall the engine's event loop; the semaphore bounds how much of tokio's
/// blocking pool the framework may occupy at once.
pub struct SyncPool {
    permits: Arc<Semaphore>,
}

static POOL: OnceLock<SyncPool> = OnceLock::new();

impl SyncPool {
    fn with_size(size: usize) -> Self {
        Self { permits: Arc::new(Semaphore::new(size.max(1))) }
    }

    /// Size the global pool. The first caller wins; later calls (and later
    /// engines on the same process) share the already-built pool.
    pub fn init(size: usize) {
        let _ = POOL.set(SyncPool::with_size(size));
    }

    pub fn global() -> &'static SyncPool {
        POOL.get_or_init(|| SyncPool::with_size(DEFAULT_POOL_SIZE))
    }

    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TrawlError::Cancelled)?;
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        });
        handle.await.map_err(|e| {
            if e.is_cancelled() {
                TrawlError::Cancelled
            } else {
                TrawlError::Anyhow(anyhow::anyhow!("blocking task panicked: {e}"))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_closures_off_the_loop() {
        let pool = SyncPool::with_size(2);
        let result = pool.run(|| 21 * 2).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_the_pool_size() {
        let pool = Arc::new(SyncPool::with_size(2));
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let live = live.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    live.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
