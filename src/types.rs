use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::ModelError;

/// Header carrying the subscription's shared secret on every delivery.
pub const TOKEN_HEADER: &str = "X-DTF-Token";

/// Header carrying the optional HMAC signature of the body.
pub const SIGNATURE_HEADER: &str = "X-DTF-Signature";

/// The four record kinds whose mutations can be forwarded to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Submission,
    TestResult,
    ReferenceSet,
    TestReference,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Submission,
        EntityKind::TestResult,
        EntityKind::ReferenceSet,
        EntityKind::TestReference,
    ];

    /// Lower-cased name used as the `source` field of the envelope.
    pub fn source_name(self) -> &'static str {
        match self {
            EntityKind::Submission => "submission",
            EntityKind::TestResult => "testresult",
            EntityKind::ReferenceSet => "referenceset",
            EntityKind::TestReference => "testreference",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name.to_ascii_lowercase().replace(['_', '-'], "");
        Self::ALL.into_iter().find(|k| k.source_name() == normalized)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.source_name())
    }
}

/// Which entity kinds a subscription wants to hear about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestFlags {
    #[serde(default)]
    pub on_submission: bool,
    #[serde(default)]
    pub on_test_result: bool,
    #[serde(default)]
    pub on_reference_set: bool,
    #[serde(default)]
    pub on_test_reference: bool,
}

impl InterestFlags {
    pub fn all() -> Self {
        Self {
            on_submission: true,
            on_test_result: true,
            on_reference_set: true,
            on_test_reference: true,
        }
    }

    pub fn only(kind: EntityKind) -> Self {
        Self::default().with(kind, true)
    }

    pub fn with(mut self, kind: EntityKind, enabled: bool) -> Self {
        *self.slot(kind) = enabled;
        self
    }

    pub fn wants(&self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::Submission => self.on_submission,
            EntityKind::TestResult => self.on_test_result,
            EntityKind::ReferenceSet => self.on_reference_set,
            EntityKind::TestReference => self.on_test_reference,
        }
    }

    fn slot(&mut self, kind: EntityKind) -> &mut bool {
        match kind {
            EntityKind::Submission => &mut self.on_submission,
            EntityKind::TestResult => &mut self.on_test_result,
            EntityKind::ReferenceSet => &mut self.on_reference_set,
            EntityKind::TestReference => &mut self.on_test_reference,
        }
    }
}

/// A project-scoped webhook registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: u64,
    pub project_id: u64,
    pub name: String,
    pub target_url: String,
    pub shared_secret: String,
    #[serde(flatten)]
    pub interests: InterestFlags,
}

impl Subscription {
    /// Builds a subscription, rejecting relative or non-http urls and empty secrets.
    pub fn new(
        id: u64,
        project_id: u64,
        name: impl Into<String>,
        target_url: impl Into<String>,
        shared_secret: impl Into<String>,
        interests: InterestFlags,
    ) -> Result<Self, ModelError> {
        let sub = Self {
            id,
            project_id,
            name: name.into(),
            target_url: target_url.into(),
            shared_secret: shared_secret.into(),
            interests,
        };
        sub.validate()?;
        Ok(sub)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let parsed = reqwest::Url::parse(&self.target_url).map_err(|e| ModelError::InvalidUrl {
            url: self.target_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ModelError::UnsupportedScheme(self.target_url.clone()));
        }
        if self.shared_secret.is_empty() {
            return Err(ModelError::EmptySecret);
        }
        Ok(())
    }
}

/// One recorded delivery attempt. Never updated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    /// Store-assigned sequence number; breaks `created_at` ties.
    pub id: u64,
    pub delivery_id: Uuid,
    pub subscription_id: u64,
    pub created_at: DateTime<Utc>,
    pub trigger_kind: EntityKind,
    pub request_url: String,
    pub request_body: serde_json::Value,
    pub request_headers: BTreeMap<String, String>,
    /// 0 means no response was received.
    pub response_status: u16,
    pub response_body: String,
    pub response_headers: BTreeMap<String, String>,
}

impl DeliveryLogEntry {
    pub fn is_transport_failure(&self) -> bool {
        self.response_status == 0
    }
}

/// An attempt waiting to be appended; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDelivery {
    pub subscription_id: u64,
    pub trigger_kind: EntityKind,
    pub request_url: String,
    pub request_body: serde_json::Value,
    pub request_headers: BTreeMap<String, String>,
    pub response_status: u16,
    pub response_body: String,
    pub response_headers: BTreeMap<String, String>,
}
