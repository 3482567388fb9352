use dtf_webhooks::catalog::{
    NewSubscription, ReferenceSetInput, SubmissionInput, SubscriptionUpdate, TestReferenceInput,
    TestResultInput,
};
use dtf_webhooks::{Catalog, EntityKind, WebhookConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

// ─── JSON-RPC wire types ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    id: Value,
}

#[derive(Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Value,
}

#[derive(Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

fn ok_response(id: Value, data: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(serde_json::json!({
            "success": true,
            "data": data,
            "message": null
        })),
        error: None,
        id,
    }
}

fn err_response(id: Value, code: i64, message: String) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: None,
        error: Some(JsonRpcError { code, message }),
        id,
    }
}

// ─── Shared app state ────────────────────────────────────────────────────────

#[derive(Default)]
struct AppState {
    catalog: Option<Catalog>,
    config: WebhookConfig,
}

impl AppState {
    fn catalog(&self) -> Result<&Catalog, String> {
        self.catalog.as_ref().ok_or_else(|| "server not initialized".to_string())
    }
}

type SharedState = Arc<RwLock<AppState>>;

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol, logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let state: SharedState = Arc::new(RwLock::new(AppState::default()));
    serve(BufReader::new(io::stdin()), io::stdout(), state).await
}

/// Answer requests from `input` until it closes or `shutdown` arrives, then
/// drain pending deliveries so process exit does not cancel them.
async fn serve<R, W>(mut input: R, mut out: W, state: SharedState) -> anyhow::Result<()>
where
    R: BufRead + Send + 'static,
    W: Write + Send + 'static,
{
    let handle = tokio::runtime::Handle::current();
    let loop_state = state.clone();

    // Stdin loop on a blocking thread to avoid blocking the async runtime.
    tokio::task::spawn_blocking(move || {
        let mut line = String::new();

        loop {
            line.clear();
            match input.read_line(&mut line) {
                Ok(0) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to read request");
                    break;
                }
                _ => {}
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
                Ok(r) => r,
                Err(e) => {
                    let resp =
                        err_response(Value::Number(0.into()), -32700, format!("Parse error: {e}"));
                    emit_line(&mut out, &resp);
                    continue;
                }
            };

            let is_shutdown = request.method == "shutdown";
            let response = handle.block_on(handle_request(&request, &loop_state));
            emit_line(&mut out, &response);

            if is_shutdown {
                break;
            }
        }
    })
    .await?;

    // A no-op when `shutdown` already drained.
    let st = state.read().await;
    if let Some(catalog) = &st.catalog {
        catalog.drain(st.config.drain_timeout()).await;
    }
    Ok(())
}

fn emit_line(out: &mut impl Write, resp: &JsonRpcResponse) {
    match serde_json::to_string(resp) {
        Ok(line) => {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize response"),
    }
}

// ─── Request dispatch ─────────────────────────────────────────────────────────

async fn handle_request(req: &JsonRpcRequest, state: &SharedState) -> JsonRpcResponse {
    if req.jsonrpc != "2.0" {
        return err_response(
            req.id.clone(),
            -32600,
            format!("Invalid Request: unsupported jsonrpc version {:?}", req.jsonrpc),
        );
    }
    match req.method.as_str() {
        "initialize" => handle_initialize(req, state).await,
        "shutdown" => handle_shutdown(req, state).await,
        "execute" => handle_execute(req, state).await,
        _ => err_response(req.id.clone(), -32601, format!("Unknown method: {}", req.method)),
    }
}

async fn handle_initialize(req: &JsonRpcRequest, state: &SharedState) -> JsonRpcResponse {
    let config: WebhookConfig = if req.params.is_null() {
        WebhookConfig::default()
    } else {
        match serde_json::from_value(req.params.clone()) {
            Ok(c) => c,
            Err(e) => return err_response(req.id.clone(), -32602, format!("Invalid config: {e}")),
        }
    };

    let catalog = match Catalog::from_config(&config) {
        Ok(c) => c,
        Err(e) => return err_response(req.id.clone(), -32603, format!("Transport setup failed: {e}")),
    };
    if let Err(e) = catalog.load() {
        tracing::error!(error = %e, "failed to load catalog");
    }
    tracing::info!(mode = ?config.mode, enabled = config.enabled, "webhook delivery initialized");

    let mut st = state.write().await;
    st.catalog = Some(catalog);
    st.config = config;

    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(serde_json::json!({ "ready": true })),
        error: None,
        id: req.id.clone(),
    }
}

async fn handle_shutdown(req: &JsonRpcRequest, state: &SharedState) -> JsonRpcResponse {
    let st = state.read().await;
    let drained = match &st.catalog {
        Some(catalog) => catalog.drain(st.config.drain_timeout()).await,
        None => true,
    };
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(serde_json::json!({ "drained": drained })),
        error: None,
        id: req.id.clone(),
    }
}

// ─── Execute handler ──────────────────────────────────────────────────────────

async fn handle_execute(req: &JsonRpcRequest, state: &SharedState) -> JsonRpcResponse {
    let operation = req
        .params
        .get("operation")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let input = req
        .params
        .get("input")
        .cloned()
        .unwrap_or(Value::Object(Default::default()));

    let st = state.read().await;
    let result = match st.catalog() {
        Ok(catalog) => run_operation(operation, input, catalog).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(data) => ok_response(req.id.clone(), data),
        Err(msg) => err_response(req.id.clone(), -32000, msg),
    }
}

async fn run_operation(operation: &str, input: Value, catalog: &Catalog) -> Result<Value, String> {
    match operation {
        "list_projects" => to_value(catalog.projects()),
        "create_project" => {
            let name = required_str(&input, "name")?;
            let slug = input
                .get("slug")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| name.to_lowercase().replace(' ', "-"));
            to_value(catalog.create_project(name, slug))
        }
        "list_subscriptions" => to_value(catalog.subscriptions(required_u64(&input, "project_id")?)),
        "create_subscription" => {
            let new: NewSubscription = parse(input)?;
            to_value(catalog.create_subscription(new).map_err(|e| e.to_string())?)
        }
        "update_subscription" => {
            let id = required_u64(&input, "subscription_id")?;
            let update: SubscriptionUpdate = parse(input)?;
            to_value(catalog.update_subscription(id, update).map_err(|e| e.to_string())?)
        }
        "delete_subscription" => {
            let id = required_u64(&input, "subscription_id")?;
            catalog.delete_subscription(id).map_err(|e| e.to_string())?;
            Ok(serde_json::json!({ "deleted": true }))
        }
        "save_submission" => {
            let input: SubmissionInput = parse(input)?;
            to_value(catalog.save_submission(input).await.map_err(|e| e.to_string())?)
        }
        "save_test_result" => {
            let input: TestResultInput = parse(input)?;
            to_value(catalog.save_test_result(input).await.map_err(|e| e.to_string())?)
        }
        "save_reference_set" => {
            let input: ReferenceSetInput = parse(input)?;
            to_value(catalog.save_reference_set(input).await.map_err(|e| e.to_string())?)
        }
        "save_test_reference" => {
            let input: TestReferenceInput = parse(input)?;
            to_value(catalog.save_test_reference(input).await.map_err(|e| e.to_string())?)
        }
        "delete_entity" => {
            let kind_name = required_str(&input, "kind")?;
            let kind = EntityKind::parse(&kind_name)
                .ok_or_else(|| format!("unknown entity kind: {kind_name}"))?;
            let id = required_u64(&input, "id")?;
            let removed = catalog.delete_entity(kind, id).map_err(|e| e.to_string())?;
            Ok(serde_json::json!({ "deleted": true, "kind": kind, "id": removed.id() }))
        }
        "list_deliveries" => {
            let id = required_u64(&input, "subscription_id")?;
            if catalog.subscription(id).is_none() {
                return Err(format!("subscription not found: {id}"));
            }
            let deliveries = catalog.deliveries(id);
            Ok(serde_json::json!({ "deliveries": deliveries, "count": deliveries.len() }))
        }
        "last_delivery_status" => {
            let id = required_u64(&input, "subscription_id")?;
            if catalog.subscription(id).is_none() {
                return Err(format!("subscription not found: {id}"));
            }
            let status = match catalog.last_delivery_status(id) {
                Some(code) => Value::from(code),
                None => Value::from("none"),
            };
            Ok(serde_json::json!({ "subscription_id": id, "status": status }))
        }
        "set_webhooks_enabled" => {
            let enabled = input
                .get("enabled")
                .and_then(|v| v.as_bool())
                .ok_or("missing required field: enabled")?;
            catalog.switch().set(enabled);
            tracing::info!(enabled, "webhook processing toggled");
            Ok(serde_json::json!({ "enabled": enabled }))
        }
        _ => Err(format!("Unknown operation: {operation}")),
    }
}

// ─── Input helpers ────────────────────────────────────────────────────────────

fn parse<T: DeserializeOwned>(input: Value) -> Result<T, String> {
    serde_json::from_value(input).map_err(|e| format!("invalid input: {e}"))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("failed to serialize result: {e}"))
}

fn required_str(input: &Value, field: &str) -> Result<String, String> {
    input
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| format!("missing required field: {field}"))
}

fn required_u64(input: &Value, field: &str) -> Result<u64, String> {
    input
        .get(field)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| format!("missing required field: {field}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dtf_webhooks::error::TransportError;
    use dtf_webhooks::transport::{Transport, TransportResponse};
    use dtf_webhooks::DispatchMode;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Ok200;

    #[async_trait]
    impl Transport for Ok200 {
        async fn post(
            &self,
            _url: &str,
            _headers: &BTreeMap<String, String>,
            _body: &str,
        ) -> Result<TransportResponse, TransportError> {
            Ok(TransportResponse {
                status: 200,
                body: String::new(),
                headers: BTreeMap::new(),
            })
        }
    }

    fn inline_catalog() -> Catalog {
        let config = WebhookConfig {
            mode: DispatchMode::Inline,
            ..WebhookConfig::default()
        };
        Catalog::with_transport(&config, Arc::new(Ok200))
    }

    fn request(jsonrpc: &str, method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: jsonrpc.to_string(),
            method: method.to_string(),
            params,
            id: json!(1),
        }
    }

    /// Subscriber that answers 204 after a delay, one connection.
    async fn slow_subscriber(delay: Duration) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            tokio::time::sleep(delay).await;
            let _ = socket.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await;
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/hook")
    }

    #[tokio::test]
    async fn operator_operations_on_the_wire() {
        let c = inline_catalog();

        let project = run_operation("create_project", json!({ "name": "Test Project" }), &c)
            .await
            .unwrap();
        assert_eq!(project["slug"], json!("test-project"));
        let project_id = project["id"].as_u64().unwrap();

        let sub = run_operation(
            "create_subscription",
            json!({
                "project_id": project_id,
                "name": "all",
                "target_url": "http://example.com/all",
                "shared_secret": "all_token",
                "on_submission": true
            }),
            &c,
        )
        .await
        .unwrap();
        let sub_id = sub["id"].as_u64().unwrap();

        let status = run_operation("last_delivery_status", json!({ "subscription_id": sub_id }), &c)
            .await
            .unwrap();
        assert_eq!(status["status"], json!("none"));

        let submission = run_operation("save_submission", json!({ "project_id": project_id }), &c)
            .await
            .unwrap();
        let status = run_operation("last_delivery_status", json!({ "subscription_id": sub_id }), &c)
            .await
            .unwrap();
        assert_eq!(status["status"], json!(200));
        let listed = run_operation("list_deliveries", json!({ "subscription_id": sub_id }), &c)
            .await
            .unwrap();
        assert_eq!(listed["count"], json!(1));
        assert_eq!(listed["deliveries"][0]["trigger_kind"], json!("Submission"));

        let deleted = run_operation(
            "delete_entity",
            json!({ "kind": "submission", "id": submission["id"] }),
            &c,
        )
        .await
        .unwrap();
        assert_eq!(deleted["kind"], json!("Submission"));

        let missing = run_operation("delete_entity", json!({ "kind": "test_result", "id": 999 }), &c)
            .await
            .unwrap_err();
        assert!(missing.contains("not found"), "{missing}");
        let bogus = run_operation("delete_entity", json!({ "kind": "widget", "id": 1 }), &c)
            .await
            .unwrap_err();
        assert!(bogus.contains("unknown entity kind"), "{bogus}");

        let toggled = run_operation("set_webhooks_enabled", json!({ "enabled": false }), &c)
            .await
            .unwrap();
        assert_eq!(toggled["enabled"], json!(false));
        assert!(!c.switch().is_enabled());

        assert!(run_operation("last_delivery_status", json!({ "subscription_id": 4242 }), &c)
            .await
            .is_err());
        assert!(run_operation("frobnicate", json!({}), &c).await.is_err());
    }

    #[tokio::test]
    async fn wrong_protocol_version_is_rejected() {
        let state: SharedState = Arc::new(RwLock::new(AppState::default()));
        let resp = handle_request(&request("1.0", "initialize", Value::Null), &state).await;
        assert_eq!(resp.error.map(|e| e.code), Some(-32600));
        assert!(state.read().await.catalog.is_none());
    }

    #[tokio::test]
    async fn execute_before_initialize_fails() {
        let state: SharedState = Arc::new(RwLock::new(AppState::default()));
        let resp = handle_request(
            &request("2.0", "execute", json!({ "operation": "list_projects" })),
            &state,
        )
        .await;
        let error = resp.error.unwrap();
        assert_eq!(error.code, -32000);
        assert_eq!(error.message, "server not initialized");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_input_drains_pending_deliveries() {
        let target = slow_subscriber(Duration::from_millis(300)).await;
        let lines = [
            json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize",
                    "params": { "mode": "pooled", "drain_timeout_secs": 10 } }),
            json!({ "jsonrpc": "2.0", "id": 2, "method": "execute",
                    "params": { "operation": "create_project", "input": { "name": "P" } } }),
            json!({ "jsonrpc": "2.0", "id": 3, "method": "execute",
                    "params": { "operation": "create_subscription", "input": {
                        "project_id": 1, "name": "slow", "target_url": target,
                        "shared_secret": "slow_token", "on_submission": true } } }),
            json!({ "jsonrpc": "2.0", "id": 4, "method": "execute",
                    "params": { "operation": "save_submission", "input": { "project_id": 1 } } }),
        ];
        let input: String = lines.iter().map(|l| format!("{l}\n")).collect();

        let state: SharedState = Arc::new(RwLock::new(AppState::default()));
        serve(io::Cursor::new(input.into_bytes()), io::sink(), state.clone())
            .await
            .unwrap();

        let st = state.read().await;
        let catalog = st.catalog.as_ref().unwrap();
        assert_eq!(catalog.last_delivery_status(2), Some(204));
    }
}
