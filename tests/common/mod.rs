#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use dtf_webhooks::catalog::NewSubscription;
use dtf_webhooks::error::TransportError;
use dtf_webhooks::transport::{Transport, TransportResponse};
use dtf_webhooks::{Catalog, DispatchMode, InterestFlags, Project, Subscription, WebhookConfig};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// One request as seen by the capture server.
#[derive(Debug, Clone)]
pub struct Captured {
    pub hook: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

#[derive(Clone, Default)]
struct ServerState {
    captured: Arc<Mutex<Vec<Captured>>>,
}

/// Local HTTP endpoint recording every POST to `/hooks/{name}`.
///
/// Hooks named `fail` answer 500 with a body; everything else answers 200.
pub struct CaptureServer {
    pub base_url: String,
    captured: Arc<Mutex<Vec<Captured>>>,
}

impl CaptureServer {
    pub async fn start() -> Self {
        let state = ServerState::default();
        let captured = state.captured.clone();

        let app = Router::new()
            .route("/hooks/{name}", post(handle_hook))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            captured,
        }
    }

    pub fn url(&self, hook: &str) -> String {
        format!("{}/hooks/{hook}", self.base_url)
    }

    pub fn captured(&self) -> Vec<Captured> {
        self.captured.lock().unwrap().clone()
    }

    pub fn captured_for(&self, hook: &str) -> Vec<Captured> {
        self.captured()
            .into_iter()
            .filter(|c| c.hook == hook)
            .collect()
    }
}

async fn handle_hook(
    Path(hook): Path<String>,
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, [(&'static str, &'static str); 1], &'static str) {
    let headers = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
        .collect();
    let failing = hook == "fail";
    state.captured.lock().unwrap().push(Captured { hook, headers, body });

    if failing {
        (StatusCode::INTERNAL_SERVER_ERROR, [("x-capture", "fail")], "subscriber exploded")
    } else {
        (StatusCode::OK, [("x-capture", "ok")], "thanks")
    }
}

/// A url nothing listens on.
pub fn unreachable_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/hooks/gone")
}

pub fn config(mode: DispatchMode) -> WebhookConfig {
    WebhookConfig {
        mode,
        request_timeout_secs: 5,
        ..WebhookConfig::default()
    }
}

pub fn subscribe(
    catalog: &Catalog,
    project: &Project,
    name: &str,
    url: String,
    interests: InterestFlags,
) -> Subscription {
    catalog
        .create_subscription(NewSubscription {
            project_id: project.id,
            name: name.to_string(),
            target_url: url,
            shared_secret: format!("{name}_token"),
            interests,
        })
        .unwrap()
}

/// Transport that records calls and holds every request until opened.
pub struct GatedTransport {
    pub calls: Mutex<Vec<(String, String)>>,
    gate: watch::Sender<bool>,
}

impl GatedTransport {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            gate: watch::Sender::new(false),
        }
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn post(
        &self,
        url: &str,
        _headers: &BTreeMap<String, String>,
        body: &str,
    ) -> Result<TransportResponse, TransportError> {
        let mut open = self.gate.subscribe();
        let _ = open.wait_for(|o| *o).await;
        self.calls.lock().unwrap().push((url.to_string(), body.to_string()));
        Ok(TransportResponse {
            status: 202,
            body: String::new(),
            headers: BTreeMap::new(),
        })
    }
}
