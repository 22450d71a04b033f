use std::collections::HashMap;

use bytes::Bytes;
use chardetng::EncodingDetector;
use encoding_rs::Encoding;
use serde_json::Value;
use url::Url;

use trawler_common::{Result, TrawlError};

use crate::request::Request;

/// The fetched payload for one request.
///
/// Carries raw bytes plus transport metadata; derived views (decoded text,
/// parsed JSON, joined URLs) are computed on demand. Selector-style
/// extraction lives outside the engine.
#[derive(Debug, Clone)]
pub struct Response {
    pub body: Bytes,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    /// The originating request; transitively the spider and user metadata.
    pub request: Request,
}

impl Response {
    pub fn new(request: Request, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            status,
            headers: HashMap::new(),
            cookies: HashMap::new(),
            request,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_cookies(mut self, cookies: HashMap<String, String>) -> Self {
        self.cookies = cookies;
        self
    }

    /// A status of 0 marks a synthetic response from a non-HTTP fetcher.
    pub fn succeeded(&self) -> bool {
        self.status == 0 || (200..=299).contains(&self.status)
    }

    pub fn url(&self) -> &Url {
        &self.request.url
    }

    pub fn meta(&self) -> &HashMap<String, Value> {
        &self.request.meta
    }

    /// Decode the body: the request's explicit encoding first, byte-level
    /// detection second. Both failing is a `Decode` error; an explicit
    /// label that is unknown or decodes with errors falls through to
    /// detection rather than failing outright.
    pub fn text(&self) -> Result<String> {
        if self.body.is_empty() {
            return Ok(String::new());
        }
        if let Some(label) = &self.request.encoding {
            if let Some(encoding) = Encoding::for_label(label.as_bytes()) {
                let (text, _, had_errors) = encoding.decode(&self.body);
                if !had_errors {
                    return Ok(text.into_owned());
                }
            }
        }
        let mut detector = EncodingDetector::new();
        detector.feed(&self.body, true);
        let encoding = detector.guess(None, true);
        let (text, _, had_errors) = encoding.decode(&self.body);
        if had_errors {
            return Err(TrawlError::Decode(format!(
                "body does not decode as {} (detected); set an explicit request encoding",
                encoding.name()
            )));
        }
        Ok(text.into_owned())
    }

    pub fn json(&self) -> Result<Value> {
        let text = self.text()?;
        serde_json::from_str(&text).map_err(|e| TrawlError::Decode(format!("invalid json: {e}")))
    }

    /// Resolve a link against this response's URL. Absolute inputs pass
    /// through untouched.
    pub fn join_url(&self, href: &str) -> Result<Url> {
        if href.is_empty() {
            return Err(TrawlError::InvalidUrl("empty href".to_string()));
        }
        self.request
            .url
            .join(href)
            .map_err(|e| TrawlError::InvalidUrl(format!("{href}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &[u8]) -> Response {
        let request = Request::get("http://example.test/page/index.html").unwrap();
        Response::new(request, status, Bytes::copy_from_slice(body))
    }

    #[test]
    fn succeeded_covers_2xx_and_synthetic_zero() {
        assert!(response(200, b"").succeeded());
        assert!(response(204, b"").succeeded());
        assert!(response(0, b"").succeeded());
        assert!(!response(301, b"").succeeded());
        assert!(!response(404, b"").succeeded());
    }

    #[test]
    fn text_decodes_utf8_by_detection() {
        let r = response(200, "héllo wörld".as_bytes());
        assert_eq!(r.text().unwrap(), "héllo wörld");
    }

    #[test]
    fn explicit_encoding_wins() {
        // "é" in latin-1 is a bare 0xE9, invalid as UTF-8.
        let mut r = response(200, &[b'c', b'a', b'f', 0xE9]);
        r.request.encoding = Some("iso-8859-1".to_string());
        assert_eq!(r.text().unwrap(), "café");
    }

    #[test]
    fn empty_body_decodes_to_empty_string() {
        assert_eq!(response(200, b"").text().unwrap(), "");
    }

    #[test]
    fn json_view_parses_decoded_text() {
        let r = response(200, br#"{"ok": true}"#);
        assert_eq!(r.json().unwrap()["ok"], Value::Bool(true));
    }

    #[test]
    fn join_resolves_relative_and_keeps_absolute() {
        let r = response(200, b"");
        assert_eq!(r.join_url("/b").unwrap().as_str(), "http://example.test/b");
        assert_eq!(r.join_url("sub").unwrap().as_str(), "http://example.test/page/sub");
        assert_eq!(
            r.join_url("https://other.test/x").unwrap().as_str(),
            "https://other.test/x"
        );
        assert!(r.join_url("").is_err());
    }
}
