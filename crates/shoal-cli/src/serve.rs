use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shoal_core::{Services, ToolRegistry};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

impl JsonRpcResponse {
    fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Newline-delimited JSON-RPC over stdio.
///
/// Two methods: `tools/list` returns every tool definition; `tools/call`
/// takes `{name, arguments, token?}` and returns the tool's response
/// envelope. Transport-level auth (the API key) is the embedding
/// process's concern, not handled here.
pub async fn run(services: Services) -> Result<()> {
    let registry = services.registry();
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<JsonRpcRequest>(line) {
            Ok(request) => handle_request(&registry, request).await,
            Err(e) => JsonRpcResponse::error(None, -32700, format!("parse error: {e}")),
        };

        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}

async fn handle_request(registry: &ToolRegistry, request: JsonRpcRequest) -> JsonRpcResponse {
    match request.method.as_str() {
        "tools/list" => {
            let defs = registry.tool_defs();
            JsonRpcResponse::result(
                request.id,
                serde_json::json!({ "tools": defs }),
            )
        }
        "tools/call" => {
            let Some(name) = request.params.get("name").and_then(Value::as_str) else {
                return JsonRpcResponse::error(request.id, -32602, "params.name is required");
            };
            let token = request
                .params
                .get("token")
                .and_then(Value::as_str)
                .map(str::to_string);
            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));

            let envelope = registry
                .dispatch(token.as_deref(), name, arguments)
                .await;
            JsonRpcResponse::result(request.id, envelope)
        }
        other => JsonRpcResponse::error(
            request.id,
            -32601,
            format!("method not found: {other}"),
        ),
    }
}
