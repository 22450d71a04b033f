use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use trawler_common::{request_fingerprint, Result, TrawlError};

use crate::spider::Spider;

/// A live transport session pinned to a request (for example a
/// `reqwest::Client` holding cookies or connection state).
///
/// Sessions are type-erased so the request model stays transport-agnostic;
/// a fetcher downcasts to whatever client type it understands. A request
/// carrying a session cannot be serialized and degrades to local-only
/// scheduling in distributed mode.
#[derive(Clone)]
pub struct SessionHandle(Arc<dyn Any + Send + Sync>);

impl SessionHandle {
    pub fn new<T: Any + Send + Sync>(session: T) -> Self {
        Self(Arc::new(session))
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionHandle(..)")
    }
}

/// The unit of work crossing the engine.
///
/// Built by spiders and callbacks, admitted by the scheduler, fetched by
/// the downloader. Serializable except for the spider back-pointer and any
/// live session handle; `is_serializable` gates shared-queue scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub url: Url,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
    /// Per-request timeout in seconds; `None` resolves through the spider
    /// override and then the global default.
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Explicit body encoding; absent means the response auto-detects.
    #[serde(default)]
    pub encoding: Option<String>,
    /// Transport-specific extras forwarded to the fetcher.
    #[serde(default)]
    pub extras: HashMap<String, Value>,
    /// User metadata, forwarded untouched to the response.
    #[serde(default)]
    pub meta: HashMap<String, Value>,
    /// Name of the spider callback that receives the response.
    pub callback: String,
    /// Skip duplicate filtering for this request.
    #[serde(default)]
    pub allow_duplicate: bool,
    /// Fetch attempts made so far; incremented by the downloader.
    #[serde(default)]
    pub retries: u32,

    /// Back-pointer to the owning spider, attached by the engine before
    /// fetch. Weak: the spider owns its requests, never the reverse.
    #[serde(skip)]
    pub(crate) spider: Option<Weak<dyn Spider>>,
    #[serde(skip)]
    pub session: Option<SessionHandle>,
}

impl Request {
    /// Build a GET request. The URL must carry a scheme and a host; a bare
    /// `host/path` input gets an implicit `http://` prefix.
    pub fn get(url: &str) -> Result<Self> {
        Self::new(url, "GET")
    }

    pub fn post(url: &str) -> Result<Self> {
        Self::new(url, "POST")
    }

    pub fn new(url: &str, method: &str) -> Result<Self> {
        Ok(Self::from_url(parse_url(url)?).with_method(method))
    }

    /// Build from an already-validated URL (e.g. `Response::join_url`).
    pub fn from_url(url: Url) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            body: None,
            timeout: None,
            encoding: None,
            extras: HashMap::new(),
            meta: HashMap::new(),
            callback: "parse".to_string(),
            allow_duplicate: false,
            retries: 0,
            spider: None,
            session: None,
        }
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_uppercase();
        self
    }

    /// Set a header. Header names are case-insensitive, so an existing
    /// value under a differently-cased name is replaced, not duplicated.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_encoding(mut self, encoding: &str) -> Self {
        self.encoding = Some(encoding.to_string());
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extras.insert(key.to_string(), value.into());
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    pub fn with_callback(mut self, name: &str) -> Self {
        self.callback = name.to_string();
        self
    }

    pub fn with_allow_duplicate(mut self, allow: bool) -> Self {
        self.allow_duplicate = allow;
        self
    }

    pub fn with_session(mut self, session: SessionHandle) -> Self {
        self.session = Some(session);
        self
    }

    /// Stable identity for the duplicate filter: URL plus retry count, so a
    /// re-scheduled timeout attempt is not rejected as a duplicate.
    pub fn fingerprint(&self) -> String {
        request_fingerprint(self.url.as_str(), self.retries)
    }

    /// Requests holding a live session cannot cross process boundaries.
    pub fn is_serializable(&self) -> bool {
        self.session.is_none()
    }

    pub(crate) fn bind_spider(&mut self, spider: &Arc<dyn Spider>) {
        self.spider = Some(Arc::downgrade(spider));
    }

    pub fn spider(&self) -> Option<Arc<dyn Spider>> {
        self.spider.as_ref().and_then(Weak::upgrade)
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TrawlError::InvalidUrl("empty url".to_string()));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let url = Url::parse(&candidate)
        .map_err(|e| TrawlError::InvalidUrl(format!("{trimmed}: {e}")))?;
    if !url.has_host() {
        return Err(TrawlError::InvalidUrl(format!("{trimmed}: missing host")));
    }
    Ok(url)
}
