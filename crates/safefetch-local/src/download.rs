//! Read access to cached artifacts: resource reads by URI and the framework-neutral response
//! for `GET /cache/{namespace}/{hash}`.

use crate::cache::{parse_cache_uri, CacheKey, ContentCache};
use crate::limiter::RESOURCE_MIME_TYPE;
use crate::pipeline::CachedDocument;
use safefetch_core::{Error, Result};
use serde::Serialize;

pub const MAX_FILENAME_LEN: usize = 100;
/// Upper bound on `Cache-Control: max-age`, whatever the cache TTL.
pub const MAX_AGE_CAP_S: u64 = 7 * 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl DownloadResponse {
    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            headers: vec![(
                "content-type".to_string(),
                "application/json".to_string(),
            )],
            body: serde_json::json!({ "error": message }).to_string(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Full artifact behind a `safefetch://cache/...` URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResource {
    pub uri: String,
    pub mime_type: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub text: String,
}

/// Resolve a cache resource URI. Malformed URIs are parameter errors; absent, expired and
/// undecodable entries all report `NotInCache`.
pub fn read_cached_resource(cache: Option<&ContentCache>, uri: &str) -> Result<CachedResource> {
    let key = parse_cache_uri(uri)?;
    let cache = cache.ok_or(Error::CacheDisabled)?;
    let entry = cache
        .get(&key)
        .ok_or_else(|| Error::NotInCache(uri.to_string()))?;
    let doc = CachedDocument::decode(&entry.content)
        .ok_or_else(|| Error::NotInCache(uri.to_string()))?;
    Ok(CachedResource {
        uri: key.uri(),
        mime_type: RESOURCE_MIME_TYPE.to_string(),
        url: doc.url,
        title: doc.title,
        text: doc.markdown,
    })
}

/// Status precedence: malformed address (400), cache disabled (503), absent or undecodable
/// entry (404), otherwise 200 with the full markdown.
pub fn build_download(
    cache: Option<&ContentCache>,
    namespace: &str,
    hash: &str,
    now_ms: u64,
) -> DownloadResponse {
    let key = match CacheKey::from_parts(namespace, hash) {
        Ok(k) => k,
        Err(e) => return DownloadResponse::error(400, &e.to_string()),
    };
    let Some(cache) = cache else {
        return DownloadResponse::error(503, "cache is disabled");
    };
    let Some(entry) = cache.get(&key) else {
        return DownloadResponse::error(404, "not found in cache");
    };
    let Some(doc) = CachedDocument::decode(&entry.content) else {
        return DownloadResponse::error(404, "cached entry could not be decoded");
    };

    let filename = download_filename(&doc.url, doc.title.as_deref(), hash, now_ms);
    let ttl_s = cache.ttl_ms() / 1000;
    let remaining_s = entry.expires_at_ms.saturating_sub(now_ms) / 1000;
    let max_age = remaining_s.min(ttl_s).min(MAX_AGE_CAP_S);
    DownloadResponse {
        status: 200,
        headers: vec![
            (
                "content-type".to_string(),
                "text/markdown; charset=utf-8".to_string(),
            ),
            (
                "content-disposition".to_string(),
                format!("attachment; filename=\"{filename}\""),
            ),
            (
                "cache-control".to_string(),
                format!("private, max-age={max_age}"),
            ),
        ],
        body: doc.markdown,
    }
}

/// Last URL path segment, else slugified title, else the hash, else a timestamp; always `.md`.
pub fn download_filename(url: &str, title: Option<&str>, hash: &str, now_ms: u64) -> String {
    let from_url = url::Url::parse(url).ok().and_then(|u| {
        u.path_segments()
            .and_then(|mut segs| segs.rfind(|s| !s.is_empty()).map(str::to_string))
    });
    let stem = [
        from_url.map(|s| strip_extension(&s).to_string()),
        title.map(str::to_string),
        Some(hash.to_string()),
    ]
    .into_iter()
    .flatten()
    .map(|s| sanitize(&s))
    .find(|s| !s.is_empty())
    .unwrap_or_else(|| format!("download-{now_ms}"));
    format!("{stem}.md")
}

fn strip_extension(seg: &str) -> &str {
    match seg.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() <= 5 => stem,
        _ => seg,
    }
}

/// Keep `[A-Za-z0-9._-]`, map the rest to `-`, collapse runs, cap length.
fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    let trimmed: String = out
        .trim_matches(|c| c == '-' || c == '.')
        .chars()
        .take(MAX_FILENAME_LEN)
        .collect();
    trimmed.trim_end_matches(['-', '.']).to_string()
}
