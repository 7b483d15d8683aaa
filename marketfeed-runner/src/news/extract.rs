//! HTTP-backed article extraction.
//!
//! Fetches the article page and keeps the text of the `<p>` elements inside
//! its `<article>`. Pages whose article is a teaser linking out ("Continue
//! Reading") are external articles and are skipped by the pipeline.

use marketfeed_core::data::FetchError;
use std::time::Duration;

use super::session::{ArticleSession, SessionFactory};

const EXTERNAL_MARKER: &str = "Continue Reading";
/// Paragraphs shorter than this are navigation, captions or bylines.
const MIN_PARAGRAPH_CHARS: usize = 20;

pub struct HttpSessionFactory {
    user_agent: String,
    timeout: Duration,
}

impl HttpSessionFactory {
    pub fn new(user_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            user_agent: user_agent.into(),
            timeout,
        }
    }
}

impl SessionFactory for HttpSessionFactory {
    fn open(&self) -> Result<Box<dyn ArticleSession>, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(|e| FetchError::SessionLost(format!("failed to build HTTP client: {e}")))?;
        Ok(Box::new(HttpArticleSession {
            client: Some(client),
        }))
    }
}

pub struct HttpArticleSession {
    client: Option<reqwest::blocking::Client>,
}

impl ArticleSession for HttpArticleSession {
    fn is_alive(&mut self) -> bool {
        self.client.is_some()
    }

    fn extract(&mut self, url: &str) -> Result<String, FetchError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| FetchError::SessionLost("session closed".into()))?;
        let resp = client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(format!("{url}: {e}"))
            } else {
                FetchError::Extraction(format!("{url}: {e}"))
            }
        })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited { retry_after_secs: None });
        }
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                context: url.to_string(),
            });
        }
        let html = resp
            .text()
            .map_err(|e| FetchError::Extraction(format!("{url}: unreadable body: {e}")))?;
        extract_article(url, &html)
    }

    fn close(&mut self) {
        self.client = None;
    }
}

/// Article text from a page, or the reason there is none.
pub fn extract_article(url: &str, html: &str) -> Result<String, FetchError> {
    let scope = section(html, "article").unwrap_or(html);
    if links_out(scope) {
        return Err(FetchError::ExternalArticle { url: url.to_string() });
    }

    let paragraphs: Vec<String> = elements(scope, "p")
        .map(|inner| collapse_whitespace(&decode_entities(&strip_tags(inner))))
        .filter(|text| text.chars().count() >= MIN_PARAGRAPH_CHARS)
        .collect();

    if paragraphs.is_empty() {
        return Err(FetchError::Extraction(format!("{url}: no article content")));
    }
    Ok(paragraphs.join("\n\n"))
}

/// A link labelled "Continue Reading" inside the article body. Rails and
/// footers outside `<article>` are not considered.
fn links_out(scope: &str) -> bool {
    elements(scope, "a").any(|inner| collapse_whitespace(&strip_tags(inner)).starts_with(EXTERNAL_MARKER))
}

/// Inner HTML of the first `<tag ...>...</tag>` element.
fn section<'a>(html: &'a str, tag: &str) -> Option<&'a str> {
    elements(html, tag).next()
}

/// Inner HTML of every non-nested `<tag ...>...</tag>` element, in order.
fn elements<'a>(html: &'a str, tag: &str) -> impl Iterator<Item = &'a str> + 'a {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut rest = html;
    std::iter::from_fn(move || loop {
        let start = rest.find(&open)?;
        let after_name = &rest[start + open.len()..];
        // `<p` must not match `<path` or `<pre`.
        if !after_name.starts_with(|c: char| c == '>' || c.is_whitespace() || c == '/') {
            rest = after_name;
            continue;
        }
        let body_start = after_name.find('>')? + 1;
        let body = &after_name[body_start..];
        let end = body.find(&close)?;
        rest = &body[end + close.len()..];
        return Some(&body[..end]);
    })
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
