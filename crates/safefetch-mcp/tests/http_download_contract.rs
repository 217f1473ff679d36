use safefetch_local::cache::{CacheKey, CacheValue, NAMESPACE_MARKDOWN};
use safefetch_local::config::SecurityConfig;
use safefetch_local::pipeline::CachedDocument;
use safefetch_local::{Config, Services, UrlGuard};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

async fn serve(services: Arc<Services>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        safefetch_mcp::http::serve(listener, services, CancellationToken::new())
            .await
            .unwrap();
    });
    addr
}

fn seed(svc: &Services, url: &str, title: Option<&str>, markdown: &str) -> CacheKey {
    let u = UrlGuard::new(&SecurityConfig::default())
        .normalize(url)
        .unwrap();
    let key = CacheKey::derive(NAMESPACE_MARKDOWN, &u, None);
    let doc = CachedDocument {
        url: u.href().to_string(),
        final_url: u.href().to_string(),
        title: title.map(str::to_string),
        markdown: markdown.to_string(),
        truncated_source: false,
    };
    svc.cache.as_ref().unwrap().set(
        &key,
        CacheValue {
            url: doc.url.clone(),
            title: doc.title.clone(),
            content: serde_json::to_string(&doc).unwrap(),
        },
    );
    key
}

#[tokio::test]
async fn download_serves_cached_markdown() {
    let svc = Arc::new(Services::start(Config::default()).unwrap());
    let key = seed(&svc, "https://example.com/notes/", Some("Notes"), "# Notes\n\nfull text");
    let addr = serve(Arc::clone(&svc)).await;

    let resp = reqwest::get(format!(
        "http://{addr}/cache/markdown/{}",
        key.hash_fragment()
    ))
    .await
    .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let h = resp.headers().clone();
    assert_eq!(h["content-type"], "text/markdown; charset=utf-8");
    assert_eq!(h["content-disposition"], "attachment; filename=\"notes.md\"");
    let cc = h["cache-control"].to_str().unwrap();
    assert!(cc.starts_with("private, max-age="), "{cc}");
    let max_age: u64 = cc.trim_start_matches("private, max-age=").parse().unwrap();
    assert!(max_age <= 86_400);
    assert_eq!(resp.text().await.unwrap(), "# Notes\n\nfull text");
    svc.shutdown().await;
}

#[tokio::test]
async fn download_status_codes() {
    let svc = Arc::new(Services::start(Config::default()).unwrap());
    let addr = serve(Arc::clone(&svc)).await;
    let status = move |path: String| async move {
        reqwest::get(format!("http://{addr}{path}"))
            .await
            .unwrap()
            .status()
            .as_u16()
    };
    assert_eq!(status("/cache/markdown/NOT-HEX".into()).await, 400);
    assert_eq!(status("/cache/html/0123456789abcdef".into()).await, 400);
    assert_eq!(status("/cache/markdown/0123456789abcdef".into()).await, 404);
    svc.shutdown().await;

    let mut cfg = Config::default();
    cfg.cache.enabled = false;
    let off = Arc::new(Services::start(cfg).unwrap());
    let addr = serve(Arc::clone(&off)).await;
    let code = reqwest::get(format!("http://{addr}/cache/markdown/0123456789abcdef"))
        .await
        .unwrap()
        .status()
        .as_u16();
    assert_eq!(code, 503);
    off.shutdown().await;
}
