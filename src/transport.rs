use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::TransportError;

/// A response as received from the subscriber, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
    pub headers: BTreeMap<String, String>,
}

/// Sends one POST. Implementations must bound the time they spend waiting.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &str,
    ) -> Result<TransportResponse, TransportError>;
}

// ---------------------------------------------------------------------------
// reqwest
// ---------------------------------------------------------------------------

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &str,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self.client.post(url).body(body.to_owned());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let resp = request.send().await.map_err(classify)?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();
        // The status line arrived, so this is a response even if the body
        // cannot be read.
        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(url, status, error = %describe(&e), "failed to read response body");
                format!("failed to read response body: {}", describe(&e))
            }
        };

        Ok(TransportResponse {
            status,
            body,
            headers,
        })
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    let description = describe(&e);
    if e.is_timeout() {
        TransportError::Timeout(description)
    } else if e.is_connect() {
        TransportError::Connect(description)
    } else {
        TransportError::Other(description)
    }
}

/// reqwest hides the useful part (DNS, refused, TLS) in the source chain.
fn describe(e: &reqwest::Error) -> String {
    let mut out = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}
