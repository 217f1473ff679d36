#![cfg(feature = "stdio")]

use std::collections::BTreeSet;

fn text_json(r: &rmcp::model::CallToolResult) -> serde_json::Value {
    let s = r
        .content
        .first()
        .and_then(|c| c.as_text())
        .map(|t| t.text.clone())
        .unwrap_or_default();
    serde_json::from_str(&s).unwrap_or_default()
}

#[test]
fn safefetch_stdio_fetch_and_tasks() {
    // Spawns a child process; skipped unless explicitly requested.
    if std::env::var("SAFEFETCH_E2E").ok().as_deref() != Some("1") {
        eprintln!("skipping: set SAFEFETCH_E2E=1 to run this test");
        return;
    }

    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    rt.block_on(async {
        use axum::{routing::get, Router};
        use rmcp::model::CallToolRequestParam;
        use rmcp::{
            service::ServiceExt,
            transport::{ConfigureCommandExt, TokioChildProcess},
        };
        use std::net::SocketAddr;

        let app = Router::new().route(
            "/",
            get(|| async {
                (
                    [("content-type", "text/html")],
                    "<html><head><title>Hello</title></head><body><p>Hello</p></body></html>",
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr: SocketAddr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("axum serve");
        });

        let bin = assert_cmd::cargo::cargo_bin!("safefetch");
        let service = ()
            .serve(TokioChildProcess::new(
                tokio::process::Command::new(bin).configure(|cmd| {
                    cmd.args(["mcp-stdio"]);
                    cmd.env("SAFEFETCH_ALLOWED_HOSTS", "127.0.0.1");
                    cmd.env_remove("SAFEFETCH_ENV_FILE");
                }),
            )?)
            .await?;

        let tools = service.list_tools(Default::default()).await?;
        let names: BTreeSet<String> = tools
            .tools
            .iter()
            .map(|t| t.name.clone().into_owned())
            .collect();
        for must_have in [
            "web_fetch",
            "task_get",
            "task_list",
            "task_cancel",
            "task_result",
            "cache_read",
            "safefetch_meta",
        ] {
            assert!(names.contains(must_have), "missing tool {must_have}");
        }

        let call = |name: &'static str, args: serde_json::Value| CallToolRequestParam {
            name: name.into(),
            arguments: args.as_object().cloned(),
        };

        let first = text_json(
            &service
                .call_tool(call("web_fetch", serde_json::json!({"url": format!("http://{addr}/")})))
                .await?,
        );
        assert_eq!(first["ok"], true);
        assert_eq!(first["fromCache"], false);
        let second = text_json(
            &service
                .call_tool(call("web_fetch", serde_json::json!({"url": format!("http://{addr}/")})))
                .await?,
        );
        assert_eq!(second["fromCache"], true);
        assert_eq!(second["content"], first["content"]);

        let task = text_json(
            &service
                .call_tool(call(
                    "web_fetch",
                    serde_json::json!({"url": format!("http://{addr}/"), "as_task": true}),
                ))
                .await?,
        );
        let task_id = task["task"]["taskId"].as_str().unwrap_or("").to_string();
        assert!(!task_id.is_empty());
        let done = text_json(
            &service
                .call_tool(call("task_result", serde_json::json!({"task_id": task_id})))
                .await?,
        );
        assert_eq!(done["status"], "completed");
        assert_eq!(done["result"]["fromCache"], true);

        service.cancel().await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
    .expect("mcp stdio contract");
}
