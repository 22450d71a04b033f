use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

use trawler_common::Result;
use trawler_engine::{Request, SchedulerContainer};

use crate::{backend_error, connection};

/// Pushes buffer locally and flush in batches past this size; `pop` also
/// flushes, so buffered work is visible before the remote is read.
const PUSH_FLUSH_THRESHOLD: usize = 100;
/// Requests pulled per remote round-trip into the local prefetch cache.
const POP_PREFETCH: usize = 16;

/// Shared request list on Redis, with three local side-pockets:
///
/// - `fallback` holds requests that cannot serialize (live session) or
///   whose flush failed — they never leave this process, and `pop`
///   prefers them;
/// - `buffer` batches outgoing pushes to amortize round-trips;
/// - `prefetch` caches a popped batch the same way.
pub struct RedisQueue {
    conn: ConnectionManager,
    key: String,
    fallback: Mutex<VecDeque<Request>>,
    buffer: Mutex<Vec<String>>,
    prefetch: Mutex<VecDeque<Request>>,
}

impl RedisQueue {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        Ok(Self {
            conn: connection(url).await?,
            key: format!("{prefix}:requests"),
            fallback: Mutex::new(VecDeque::new()),
            buffer: Mutex::new(Vec::new()),
            prefetch: Mutex::new(VecDeque::new()),
        })
    }

    /// Send every buffered request to the remote list. On failure the
    /// batch goes back to the front of the buffer and stays local.
    pub async fn flush(&self) -> Result<()> {
        let pending: Vec<String> = std::mem::take(&mut *self.buffer.lock().unwrap());
        if pending.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        match conn.rpush::<_, _, ()>(&self.key, &pending).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut buffer = self.buffer.lock().unwrap();
                let mut restored = pending;
                restored.append(&mut *buffer);
                *buffer = restored;
                Err(backend_error(e))
            }
        }
    }
}

fn serialize_request(request: &Request) -> Option<String> {
    if !request.is_serializable() {
        return None;
    }
    match serde_json::to_string(request) {
        Ok(wire) => Some(wire),
        Err(e) => {
            warn!(url = %request.url, error = %e, "Request failed to serialize");
            None
        }
    }
}

#[async_trait]
impl SchedulerContainer for RedisQueue {
    async fn push(&self, request: Request) -> Result<()> {
        let Some(wire) = serialize_request(&request) else {
            debug!(url = %request.url, "Request stays on the local fallback queue");
            self.fallback.lock().unwrap().push_back(request);
            return Ok(());
        };
        let flush_now = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.push(wire);
            buffer.len() >= PUSH_FLUSH_THRESHOLD
        };
        if flush_now {
            if let Err(e) = self.flush().await {
                warn!(error = %e, "Flush failed; requests retained locally");
            }
        }
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Request>> {
        if let Some(request) = self.fallback.lock().unwrap().pop_front() {
            return Ok(Some(request));
        }
        if let Some(request) = self.prefetch.lock().unwrap().pop_front() {
            return Ok(Some(request));
        }

        if let Err(e) = self.flush().await {
            warn!(error = %e, "Flush before pop failed");
        }
        let mut conn = self.conn.clone();
        let wires: Vec<String> = conn
            .lpop(&self.key, NonZeroUsize::new(POP_PREFETCH))
            .await
            .map_err(backend_error)?;
        if wires.is_empty() {
            return Ok(None);
        }

        let mut prefetch = self.prefetch.lock().unwrap();
        for wire in wires {
            match serde_json::from_str::<Request>(&wire) {
                Ok(request) => prefetch.push_back(request),
                Err(e) => warn!(error = %e, "Discarding undecodable request payload"),
            }
        }
        Ok(prefetch.pop_front())
    }

    async fn len(&self) -> Result<usize> {
        let local = self.fallback.lock().unwrap().len()
            + self.buffer.lock().unwrap().len()
            + self.prefetch.lock().unwrap().len();
        let mut conn = self.conn.clone();
        let remote: usize = conn.llen(&self.key).await.map_err(backend_error)?;
        Ok(local + remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trawler_engine::SessionHandle;

    #[test]
    fn requests_round_trip_through_the_wire_format() {
        let request = Request::post("http://example.test/submit")
            .unwrap()
            .with_header("X-Probe", "1")
            .with_meta("depth", 2)
            .with_callback("parse_detail");
        let wire = serialize_request(&request).unwrap();
        let back: Request = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.url, request.url);
        assert_eq!(back.headers, request.headers);
        assert_eq!(back.meta, request.meta);
        assert_eq!(back.callback, "parse_detail");
    }

    #[test]
    fn session_bound_requests_do_not_serialize() {
        let request = Request::get("http://example.test")
            .unwrap()
            .with_session(SessionHandle::new(0u8));
        assert!(serialize_request(&request).is_none());
    }
}
