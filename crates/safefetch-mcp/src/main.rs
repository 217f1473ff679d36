use anyhow::Result;
use clap::{Parser, Subcommand};
use safefetch_local::config::Config;
use safefetch_local::{FetchRequest, HttpFetcher, RequestContext, Services, UrlGuard};
use safefetch_mcp::handlers::Handlers;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[path = "mcp/envelope.rs"]
mod envelope;
use envelope::*;

const SCHEMA_VERSION: u64 = 1;

#[derive(Parser, Debug)]
#[command(name = "safefetch")]
#[command(about = "SSRF-safe URL fetching with a bounded cache and cancellable tasks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as an MCP stdio server (for MCP clients).
    #[cfg(feature = "stdio")]
    McpStdio,
    /// Serve cached artifacts over HTTP: `GET /cache/{namespace}/{hash}`.
    Serve(ServeCmd),
    /// Fetch one URL through the full pipeline and print the outcome.
    Fetch(FetchCmd),
    /// Report the effective configuration and self-checks (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct ServeCmd {
    /// Bind address.
    #[arg(long, env = "SAFEFETCH_HTTP_ADDR", default_value = "127.0.0.1:8787")]
    addr: std::net::SocketAddr,
}

#[derive(clap::Args, Debug)]
struct FetchCmd {
    /// Absolute http(s) URL.
    url: String,
    /// Extra cache-key input that makes two fetches of one URL distinct.
    #[arg(long)]
    vary: Option<String>,
    /// Inline character limit for this call (0 defers to SAFEFETCH_MAX_INLINE_CHARS).
    #[arg(long)]
    max_inline_chars: Option<usize>,
    /// Fetch deadline (ms); capped by SAFEFETCH_FETCH_TIMEOUT_MS.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[cfg(feature = "stdio")]
mod mcp {
    use super::*;
    use rmcp::{
        handler::server::router::tool::ToolRouter as RmcpToolRouter,
        handler::server::wrapper::Parameters,
        model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
        service::RequestContext as McpRequestContext,
        tool, tool_handler, tool_router,
        transport::stdio,
        ErrorData as McpError, RoleServer, ServiceExt,
    };
    use schemars::JsonSchema;
    use serde::Deserialize;

    /// A stdio server talks to exactly one client, so every task belongs to it.
    pub(crate) const STDIO_OWNER: &str = "stdio";

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct WebFetchArgs {
        /// Absolute http(s) URL.
        url: Option<String>,
        /// Extra cache-key input (e.g. a conversion mode).
        vary: Option<String>,
        /// Inline character limit; longer content is cut and points at the cached resource.
        max_inline_chars: Option<usize>,
        /// Fetch deadline in milliseconds.
        timeout_ms: Option<u64>,
        /// Run in the background and return a task id (poll with task_get / task_result).
        as_task: Option<bool>,
        /// Task time-to-live in milliseconds (only with as_task).
        task_ttl_ms: Option<u64>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct TaskIdArgs {
        task_id: Option<String>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct TaskListArgs {
        /// Opaque cursor from a previous page's nextCursor.
        cursor: Option<String>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct CacheReadArgs {
        /// `safefetch://cache/{namespace}/{hash}` from a resource_ref.
        uri: Option<String>,
    }

    fn tool_result(payload: serde_json::Value) -> CallToolResult {
        // Structured content for machine consumers plus a text fallback for clients that only
        // read `content[0].text`.
        let mut r = CallToolResult::structured(payload.clone());
        r.content = vec![Content::text(payload.to_string())];
        r
    }

    #[derive(Clone)]
    pub(crate) struct SafefetchMcp {
        tool_router: RmcpToolRouter<Self>,
        handlers: Handlers,
    }

    #[tool_router]
    impl SafefetchMcp {
        pub(crate) fn new(handlers: Handlers) -> Self {
            Self {
                tool_router: Self::tool_router(),
                handlers,
            }
        }

        /// `cancel` is the client's per-request token. Inline fetches stop when it fires; a
        /// background task outlives the request and is stopped through `task_cancel` instead.
        async fn run_web_fetch(
            &self,
            args: WebFetchArgs,
            cancel: CancellationToken,
        ) -> serde_json::Value {
            let t0 = std::time::Instant::now();
            let url = args.url.unwrap_or_default();
            let req = FetchRequest {
                url: url.clone(),
                vary: args.vary,
                max_inline_chars: args.max_inline_chars,
                timeout_ms: args.timeout_ms,
            };
            let request = serde_json::to_value(&req).unwrap_or(serde_json::Value::Null);
            let mut payload = if args.as_task.unwrap_or(false) {
                let ctx = RequestContext::new(STDIO_OWNER);
                let r = self.handlers.fetch_task(ctx, req, args.task_ttl_ms);
                payload_from("web_fetch", t0.elapsed().as_millis(), &url, r.map(|task| {
                    serde_json::json!({ "task": task })
                }))
            } else {
                let ctx = RequestContext::new(STDIO_OWNER).with_cancel(cancel);
                let r = self.handlers.fetch(&ctx, req).await;
                payload_from("web_fetch", t0.elapsed().as_millis(), &url, r)
            };
            payload["request"] = request;
            payload
        }

        async fn run_task_result(&self, id: &str, cancel: &CancellationToken) -> serde_json::Value {
            let t0 = std::time::Instant::now();
            let r = self.handlers.task_result(STDIO_OWNER, id, Some(cancel)).await;
            payload_from("task_result", t0.elapsed().as_millis(), id, r)
        }

        #[tool(
            description = "Fetch a public URL as bounded markdown (cache-first; SSRF-guarded; optional background task)"
        )]
        async fn web_fetch(
            &self,
            params: Parameters<Option<WebFetchArgs>>,
            context: McpRequestContext<RoleServer>,
        ) -> Result<CallToolResult, McpError> {
            let payload = self
                .run_web_fetch(params.0.unwrap_or_default(), context.ct)
                .await;
            Ok(tool_result(payload))
        }

        #[tool(description = "Get a task's current status")]
        async fn task_get(
            &self,
            params: Parameters<Option<TaskIdArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let t0 = std::time::Instant::now();
            let id = params.0.unwrap_or_default().task_id.unwrap_or_default();
            let r = self.handlers.task_get(STDIO_OWNER, &id);
            Ok(tool_result(payload_from("task_get", t0.elapsed().as_millis(), &id, r)))
        }

        #[tool(description = "List this session's tasks (paged, oldest first)")]
        async fn task_list(
            &self,
            params: Parameters<Option<TaskListArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let t0 = std::time::Instant::now();
            let cursor = params.0.unwrap_or_default().cursor;
            let r = self.handlers.task_list(STDIO_OWNER, cursor.as_deref());
            let subject = cursor.unwrap_or_default();
            Ok(tool_result(payload_from("task_list", t0.elapsed().as_millis(), &subject, r)))
        }

        #[tool(description = "Cancel a running task (aborts its network fetch)")]
        async fn task_cancel(
            &self,
            params: Parameters<Option<TaskIdArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let t0 = std::time::Instant::now();
            let id = params.0.unwrap_or_default().task_id.unwrap_or_default();
            let r = self.handlers.task_cancel(STDIO_OWNER, &id);
            Ok(tool_result(payload_from("task_cancel", t0.elapsed().as_millis(), &id, r)))
        }

        #[tool(description = "Wait for a task to finish and return its result or error")]
        async fn task_result(
            &self,
            params: Parameters<Option<TaskIdArgs>>,
            context: McpRequestContext<RoleServer>,
        ) -> Result<CallToolResult, McpError> {
            let id = params.0.unwrap_or_default().task_id.unwrap_or_default();
            Ok(tool_result(self.run_task_result(&id, &context.ct).await))
        }

        #[tool(description = "Read the full cached markdown behind a resource_ref uri")]
        async fn cache_read(
            &self,
            params: Parameters<Option<CacheReadArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let t0 = std::time::Instant::now();
            let uri = params.0.unwrap_or_default().uri.unwrap_or_default();
            let r = self.handlers.resource_read(&uri);
            Ok(tool_result(payload_from("cache_read", t0.elapsed().as_millis(), &uri, r)))
        }

        #[tool(description = "Report safefetch configuration + version (no secrets)")]
        async fn safefetch_meta(&self) -> Result<CallToolResult, McpError> {
            let t0 = std::time::Instant::now();
            let svc = self.handlers.services();
            let mut payload = serde_json::json!({
                "ok": true,
                "name": "safefetch",
                "version": env!("CARGO_PKG_VERSION"),
                "config": svc.config,
                "cache_entries": svc.cache.as_ref().map(|c| c.len()),
                "live_tasks": svc.tasks.len(),
            });
            add_envelope_fields(&mut payload, "safefetch_meta", t0.elapsed().as_millis());
            Ok(tool_result(payload))
        }
    }

    #[tool_handler]
    impl rmcp::ServerHandler for SafefetchMcp {
        fn get_info(&self) -> ServerInfo {
            ServerInfo {
                instructions: Some(
                    "SSRF-safe URL fetching. Outputs are schema-versioned JSON; long content is cut and points at a cache_read uri."
                        .to_string(),
                ),
                capabilities: ServerCapabilities::builder().enable_tools().build(),
                ..Default::default()
            }
        }
    }

    pub(crate) async fn serve_stdio(handlers: Handlers) -> Result<(), McpError> {
        let svc = SafefetchMcp::new(handlers);
        let running = svc
            .serve(stdio())
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        // Keep the stdio server alive until the client closes.
        running
            .waiting()
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(())
    }

}

/// Opt-in env-file loader (`SAFEFETCH_ENV_FILE`). MCP hosts often launch servers outside an
/// interactive shell; this gives them one place for settings. Never overrides process env and
/// never logs values.
fn load_env_file() {
    let Ok(p) = std::env::var("SAFEFETCH_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v.trim());
        }
    }
}

/// Logs go to stderr only: stdout carries the MCP stdio transport.
fn init_tracing() {
    let directive = ["SAFEFETCH_LOG", "RUST_LOG"]
        .iter()
        .filter_map(|k| std::env::var(k).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::try_new(&directive)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            t.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        #[cfg(feature = "stdio")]
        Commands::McpStdio => {
            let services = Arc::new(Services::start(Config::from_env())?);
            let res = mcp::serve_stdio(Handlers::new(Arc::clone(&services))).await;
            services.shutdown().await;
            res.map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        Commands::Serve(args) => {
            let services = Arc::new(Services::start(Config::from_env())?);
            let listener = tokio::net::TcpListener::bind(args.addr).await?;
            tracing::info!(addr = %listener.local_addr()?, "download endpoint listening");
            let stop = cancel_on_ctrl_c();
            let res = safefetch_mcp::http::serve(listener, Arc::clone(&services), stop).await;
            services.shutdown().await;
            res?;
        }
        Commands::Fetch(args) => {
            let t0 = std::time::Instant::now();
            let handlers = Handlers::new(Arc::new(Services::start(Config::from_env())?));
            let ctx = RequestContext::new("cli").with_cancel(cancel_on_ctrl_c());
            let req = FetchRequest {
                url: args.url.clone(),
                vary: args.vary,
                max_inline_chars: args.max_inline_chars,
                timeout_ms: args.timeout_ms,
            };
            let r = handlers.fetch(&ctx, req).await;
            handlers.services().shutdown().await;
            let ok = r.is_ok();
            match args.output.to_ascii_lowercase().as_str() {
                "text" => match r {
                    Ok(o) => println!("{}", o.content),
                    Err(e) => eprintln!("safefetch: {e}"),
                },
                _ => println!(
                    "{}",
                    payload_from("fetch", t0.elapsed().as_millis(), &args.url, r)
                ),
            }
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Doctor(args) => {
            let t0 = std::time::Instant::now();
            let cfg = Config::from_env();

            let mut checks: Vec<serde_json::Value> = Vec::new();
            let client = HttpFetcher::new(&cfg.fetch, UrlGuard::new(&cfg.security));
            checks.push(serde_json::json!({
                "name": "http_client",
                "ok": client.is_ok(),
                "message": match &client {
                    Ok(_) => "http client builds".to_string(),
                    Err(e) => e.to_string(),
                },
            }));
            checks.push(serde_json::json!({
                "name": "cache",
                "ok": true,
                "message": if cfg.cache.enabled { "cache enabled" } else { "cache disabled" },
                "hint": if cfg.cache.enabled { "" } else { "Downloads return 503 and resource_ref is omitted while the cache is disabled." },
            }));
            checks.push(serde_json::json!({
                "name": "allow_list",
                "ok": true,
                "message": format!("{} host(s) bypass the SSRF checks", cfg.security.allowed_hosts.len()),
            }));
            let ok = checks.iter().all(|c| c["ok"].as_bool() == Some(true));

            let mut v = serde_json::json!({
                "ok": ok,
                "name": "safefetch",
                "version": env!("CARGO_PKG_VERSION"),
                "features": { "stdio": cfg!(feature = "stdio") },
                "config": cfg,
                "checks": checks,
            });
            add_envelope_fields(&mut v, "doctor", t0.elapsed().as_millis());
            match args.output.to_ascii_lowercase().as_str() {
                "text" => {
                    println!("safefetch {}", env!("CARGO_PKG_VERSION"));
                    for c in v["checks"].as_array().into_iter().flatten() {
                        let mark = if c["ok"].as_bool() == Some(true) { "ok" } else { "FAIL" };
                        println!(
                            "  [{mark}] {}: {}",
                            c["name"].as_str().unwrap_or(""),
                            c["message"].as_str().unwrap_or("")
                        );
                    }
                }
                _ => println!("{v}"),
            }
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": SCHEMA_VERSION,
                "kind": "version",
                "ok": true,
                "name": "safefetch",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("safefetch {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{v}"),
            }
        }
    }
    Ok(())
}
