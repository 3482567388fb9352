use thiserror::Error;

/// Validation failures when constructing subscriptions or records.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("target url '{url}' is not a valid absolute url: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("target url '{0}' must use http or https")]
    UnsupportedScheme(String),

    #[error("shared secret must not be empty")]
    EmptySecret,

    #[error("unknown test status: {0}")]
    UnknownStatus(String),
}

/// Failures persisting or loading the delivery log or catalog on disk.
#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Transport-level failure: no HTTP response was received.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Other(String),
}

/// Lookup failures in the record catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: u64 },

    #[error(transparent)]
    Invalid(#[from] ModelError),

    #[error(transparent)]
    Store(#[from] LogStoreError),
}
