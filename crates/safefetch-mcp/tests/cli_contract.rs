use assert_cmd::Command;
use predicates::prelude::*;

fn safefetch() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("safefetch"));
    cmd.env_remove("SAFEFETCH_ENV_FILE")
        .env_remove("SAFEFETCH_ALLOWED_HOSTS")
        .env_remove("SAFEFETCH_CACHE_ENABLED");
    cmd
}

fn stdout_json(out: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&out.stdout).expect("stdout is json")
}

#[test]
fn version_contract() {
    let out = safefetch().arg("version").output().unwrap();
    assert!(out.status.success());
    let v = stdout_json(&out);
    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["name"].as_str(), Some("safefetch"));
    assert!(!v["version"].as_str().unwrap_or("").is_empty());

    safefetch()
        .args(["version", "--output", "text"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("safefetch "));
}

#[test]
fn doctor_reports_effective_config() {
    let out = safefetch()
        .arg("doctor")
        .env("SAFEFETCH_CACHE_MAX_KEYS", "7")
        .env("SAFEFETCH_MAX_REDIRECTS", "not-a-number")
        .env("SAFEFETCH_BLOCKED_HOSTS", "Intranet.Example, ,wiki.corp")
        .output()
        .unwrap();
    assert!(out.status.success());
    let v = stdout_json(&out);
    assert_eq!(v["kind"], "doctor");
    assert_eq!(v["ok"], true);
    assert_eq!(v["config"]["cache"]["max_keys"], 7);
    assert_eq!(v["config"]["fetch"]["max_redirects"], 5);
    assert_eq!(
        v["config"]["security"]["blocked_hosts"],
        serde_json::json!(["intranet.example", "wiki.corp"])
    );
    assert_eq!(v["features"]["stdio"].as_bool(), Some(cfg!(feature = "stdio")));
    let checks = v["checks"].as_array().expect("checks array");
    assert!(checks.iter().any(|c| c["name"] == "http_client"));
}

#[test]
fn env_file_fills_unset_vars_only() {
    let dir = std::env::temp_dir().join(format!("safefetch-envfile-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("safefetch.env");
    std::fs::write(
        &path,
        "# comment\nSAFEFETCH_CACHE_TTL_S=42\nSAFEFETCH_CACHE_MAX_KEYS=3\nnot a pair\n",
    )
    .unwrap();

    let out = safefetch()
        .arg("doctor")
        .env("SAFEFETCH_ENV_FILE", &path)
        .env("SAFEFETCH_CACHE_MAX_KEYS", "9")
        .output()
        .unwrap();
    let v = stdout_json(&out);
    assert_eq!(v["config"]["cache"]["ttl_s"], 42);
    assert_eq!(v["config"]["cache"]["max_keys"], 9);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn fetch_of_blocked_url_fails_with_structured_error() {
    let out = safefetch()
        .args(["fetch", "http://169.254.169.254/latest/meta-data/"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    let v = stdout_json(&out);
    assert_eq!(v["ok"], false);
    assert_eq!(v["error"]["code"], "invalid_url");
    assert_eq!(v["error"]["retryable"], false);
    assert_eq!(
        v["error"]["failure"]["url"],
        "http://169.254.169.254/latest/meta-data/"
    );
}

#[test]
fn fetch_converts_a_local_page() {
    use axum::{routing::get, Router};

    let rt = tokio::runtime::Runtime::new().unwrap();
    let addr = rt.block_on(async {
        let app = Router::new().route(
            "/page",
            get(|| async {
                (
                    [("content-type", "text/html")],
                    "<html><head><title>Hello</title></head><body><p>Hello</p></body></html>",
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    });

    let out = safefetch()
        .args(["fetch", &format!("http://{addr}/page")])
        .env("SAFEFETCH_ALLOWED_HOSTS", "127.0.0.1")
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let v = stdout_json(&out);
    assert_eq!(v["ok"], true);
    assert_eq!(v["fromCache"], false);
    assert_eq!(v["title"], "Hello");
    assert!(v["content"].as_str().unwrap_or("").contains("Hello"));
    drop(rt);
}
