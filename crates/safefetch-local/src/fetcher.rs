//! Streaming retrieval with SSRF re-validation on every redirect hop.

use crate::cancel::Scope;
use crate::config::FetchConfig;
use crate::decode::BodyDecoder;
use crate::sniff;
use crate::url_guard::{NormalizedUrl, UrlGuard};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, LOCATION, RETRY_AFTER};
use reqwest::StatusCode;
use safefetch_core::{Error, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ACCEPT_VALUE: &str =
    "text/html,application/xhtml+xml,text/plain;q=0.9,text/markdown;q=0.9,*/*;q=0.5";
const ACCEPT_ENCODING_VALUE: &str = "gzip, deflate, br";

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub max_bytes: u64,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct FetchedBody {
    /// Decoded (decompressed) bytes, at most `max_bytes`.
    pub bytes: Vec<u8>,
    /// encoding_rs label the text should be decoded with.
    pub encoding_label: String,
    pub truncated: bool,
    pub final_url: NormalizedUrl,
    pub status: u16,
    pub content_type: Option<String>,
    pub redirects: usize,
}

impl FetchedBody {
    pub fn text(&self) -> String {
        sniff::decode_text(&self.bytes, &self.encoding_label)
    }
}

/// Network seam of the pipeline; tests substitute canned bodies.
#[async_trait::async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &NormalizedUrl, opts: &FetchOptions) -> Result<FetchedBody>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    guard: UrlGuard,
    max_redirects: usize,
}

impl HttpFetcher {
    pub fn new(cfg: &FetchConfig, guard: UrlGuard) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            // Redirects are followed by hand so each hop is validated before any IO.
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::NotConfigured(format!("http client: {e}")))?;
        Ok(Self {
            client,
            guard,
            max_redirects: cfg.max_redirects,
        })
    }

    async fn read_body(
        &self,
        resp: reqwest::Response,
        final_url: NormalizedUrl,
        redirects: usize,
        opts: &FetchOptions,
        scope: &Scope,
    ) -> Result<FetchedBody> {
        let status = resp.status().as_u16();
        let content_type = header_str(resp.headers(), CONTENT_TYPE);
        let (media_type, header_charset) = content_type
            .as_deref()
            .map(sniff::parse_content_type)
            .unwrap_or_default();
        if !media_type.is_empty() && !sniff::is_textual_media_type(&media_type) {
            return Err(Error::UnsupportedContent(format!(
                "content type '{media_type}' is not text"
            )));
        }
        let mut decoder =
            BodyDecoder::from_header(header_str(resp.headers(), CONTENT_ENCODING).as_deref())?;
        if let Some(declared) = resp.content_length().filter(|n| *n > opts.max_bytes) {
            tracing::debug!(url = %final_url, declared, max = opts.max_bytes, "declared length over ceiling; reading up to ceiling");
        }

        let mut sink = BodySink {
            body: Vec::new(),
            max: usize::try_from(opts.max_bytes).unwrap_or(usize::MAX),
            truncated: false,
            utf16: header_charset.as_deref().is_some_and(sniff::is_utf16_label),
        };
        let mut stream = resp.bytes_stream();
        loop {
            let next = scope.guard(async { Ok(stream.next().await) }).await?;
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| Error::fetch(format!("response body: {e}")))?;
            let plain = decoder.push(&chunk, sink.room())?;
            if sink.accept(plain)? || decoder.capped() {
                sink.truncated = true;
                break;
            }
        }
        if !sink.truncated {
            let tail = decoder.finish(sink.room())?;
            sink.accept(tail)?;
            sink.truncated |= decoder.capped();
        }
        // Dropping the stream here abandons whatever the server still had to send.
        drop(stream);

        let encoding_label = sniff::resolve_encoding_label(header_charset.as_deref(), &sink.body);
        Ok(FetchedBody {
            bytes: sink.body,
            encoding_label,
            truncated: sink.truncated,
            final_url,
            status,
            content_type,
            redirects,
        })
    }
}

struct BodySink {
    body: Vec<u8>,
    max: usize,
    truncated: bool,
    utf16: bool,
}

impl BodySink {
    fn room(&self) -> usize {
        self.max.saturating_sub(self.body.len())
    }

    /// Append decoded bytes; `Ok(true)` once the ceiling is hit.
    fn accept(&mut self, plain: Vec<u8>) -> Result<bool> {
        if plain.is_empty() {
            return Ok(false);
        }
        if self.body.is_empty() {
            self.utf16 |= sniff::bom_label(&plain).is_some_and(sniff::is_utf16_label);
        }
        if let Some(kind) = sniff::sniff_chunk(&self.body, &plain, self.utf16) {
            return Err(Error::UnsupportedContent(format!(
                "binary content detected ({kind})"
            )));
        }
        let room = self.room();
        if plain.len() > room {
            self.body.extend_from_slice(&plain[..room]);
            self.truncated = true;
            return Ok(true);
        }
        self.body.extend_from_slice(&plain);
        Ok(false)
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `Retry-After` in its delta-seconds form; HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, RETRY_AFTER).and_then(|s| s.parse::<u64>().ok())
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

#[async_trait::async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, url: &NormalizedUrl, opts: &FetchOptions) -> Result<FetchedBody> {
        let scope = Scope::new(opts.cancel.clone()).with_timeout(opts.timeout);
        let mut current = url.clone();
        let mut redirects = 0usize;
        loop {
            scope.check()?;
            let req = self
                .client
                .get(current.as_url().clone())
                .header(ACCEPT, ACCEPT_VALUE)
                .header(ACCEPT_ENCODING, ACCEPT_ENCODING_VALUE);
            let resp = scope
                .guard(async { req.send().await.map_err(|e| Error::fetch(e.to_string())) })
                .await?;
            let status = resp.status();

            if is_redirect(status) {
                redirects += 1;
                if redirects > self.max_redirects {
                    return Err(Error::fetch(format!(
                        "too many redirects (limit {})",
                        self.max_redirects
                    )));
                }
                let location = header_str(resp.headers(), LOCATION)
                    .ok_or_else(|| Error::fetch(format!("HTTP {} without Location", status.as_u16())))?;
                let target = current
                    .as_url()
                    .join(&location)
                    .map_err(|e| Error::Validation(format!("bad redirect target '{location}': {e}")))?;
                let next = self.guard.check(target)?;
                tracing::debug!(from = %current, to = %next, hop = redirects, "following redirect");
                current = next;
                continue;
            }

            if !status.is_success() {
                return Err(Error::http_status(
                    status.as_u16(),
                    parse_retry_after(resp.headers()),
                ));
            }
            return self.read_body(resp, current, redirects, opts, &scope).await;
        }
    }
}
