//! News records and the transport encoding of processed article bodies.
//!
//! A processed article carries its translated body as `encoded_data`:
//! `{url, summary, publisher, full_content}` as JSON, gzip-compressed, then
//! URL-safe base64 with the `=` padding stripped.

use crate::dedupe::Identity;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

/// One news article. Identity is the URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsRecord {
    pub symbol: Option<String>,
    pub title: String,
    pub url: String,
    pub publisher: String,
    pub published_at: String,
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, rename = "encoded_data", skip_serializing_if = "Option::is_none")]
    pub encoded_body: Option<String>,
}

impl Identity for NewsRecord {
    fn identity(&self) -> &str {
        &self.url
    }
}

impl NewsRecord {
    /// Attach the summary and encoded body produced by the crawl stage.
    pub fn with_body(mut self, summary: String, encoded_body: String) -> Self {
        self.summary = Some(summary);
        self.encoded_body = Some(encoded_body);
        self
    }
}

/// Payload packed into `encoded_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleBody {
    pub url: String,
    pub summary: String,
    pub publisher: String,
    pub full_content: String,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("body serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("gzip: {0}")]
    Gzip(#[from] std::io::Error),

    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// JSON → gzip → URL-safe base64 without padding.
pub fn encode_body(body: &ArticleBody) -> Result<String, EncodeError> {
    let json = serde_json::to_vec(body)?;
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&json)?;
    let compressed = gz.finish()?;
    Ok(URL_SAFE_NO_PAD.encode(compressed))
}

/// Inverse of [`encode_body`]. Tolerates trailing padding.
pub fn decode_body(encoded: &str) -> Result<ArticleBody, EncodeError> {
    let compressed = URL_SAFE_NO_PAD.decode(encoded.trim_end_matches('='))?;
    let mut json = Vec::new();
    GzDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> ArticleBody {
        ArticleBody {
            url: "https://finance.yahoo.com/news/a?b=c".into(),
            summary: "요약입니다.".into(),
            publisher: "Reuters".into(),
            full_content: "## 제목\n\n**본문** with some / + characters".repeat(20),
        }
    }

    #[test]
    fn encoded_body_is_url_safe_and_unpadded() {
        let encoded = encode_body(&body()).unwrap();
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert_eq!(decode_body(&encoded).unwrap(), body());
    }

    #[test]
    fn garbage_rejected() {
        assert!(decode_body("not*base64").is_err());
        assert!(decode_body(&URL_SAFE_NO_PAD.encode(b"plain, not gzip")).is_err());
    }

    #[test]
    fn record_serializes_consumer_fields() {
        let rec = NewsRecord {
            symbol: Some("AAPL".into()),
            title: "t".into(),
            url: "u".into(),
            publisher: "p".into(),
            published_at: "2025-12-24 00:13:00".into(),
            thumbnail_url: None,
            summary: None,
            encoded_body: None,
        };
        let v = serde_json::to_value(&rec).unwrap();
        assert!(v["thumbnail_url"].is_null());
        assert!(v.get("encoded_data").is_none());

        let v = serde_json::to_value(rec.with_body("s".into(), "e".into())).unwrap();
        assert_eq!(v["encoded_data"], "e");
        assert_eq!(v["summary"], "s");
    }
}
