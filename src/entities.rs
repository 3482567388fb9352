//! Records tracked by the result database, in their read-API shape.
//!
//! These are the objects whose create/edit transitions are forwarded to
//! subscribers. Serializing one of them yields exactly the JSON a client
//! would get when pulling it from the API, so pushed payloads can be checked
//! against the same schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ModelError;
use crate::types::EntityKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: u64,
    pub name: String,
    pub slug: String,
}

/// One run of a whole test suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: u64,
    /// Cleared when the owning project is removed.
    pub project_id: Option<u64>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub info: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Skip,
    Successful,
    Unstable,
    Failed,
    Unknown,
    Broken,
}

impl TestStatus {
    /// Higher is worse.
    fn severity(self) -> u8 {
        match self {
            TestStatus::Skip => 0,
            TestStatus::Successful => 10,
            TestStatus::Unstable => 20,
            TestStatus::Failed => 30,
            TestStatus::Unknown => 40,
            TestStatus::Broken => 50,
        }
    }

    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s {
            "skip" => Ok(TestStatus::Skip),
            "successful" => Ok(TestStatus::Successful),
            "unstable" => Ok(TestStatus::Unstable),
            "failed" => Ok(TestStatus::Failed),
            "unknown" => Ok(TestStatus::Unknown),
            "broken" => Ok(TestStatus::Broken),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }

    /// Worst status across the individual result entries; `successful` when empty.
    pub fn aggregate(results: &[ResultEntry]) -> Self {
        results
            .iter()
            .map(|r| r.status)
            .fold(TestStatus::Successful, |worst, s| {
                if s.severity() > worst.severity() {
                    s
                } else {
                    worst
                }
            })
    }
}

/// A single measured value inside a test result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub name: String,
    pub value: Value,
    pub valuetype: String,
    pub status: TestStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub id: u64,
    pub name: String,
    pub submission_id: Option<u64>,
    pub first_submitted: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub results: Vec<ResultEntry>,
    pub status: TestStatus,
}

/// Named set of reference values, keyed by the submission properties it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSet {
    pub id: u64,
    pub project_id: Option<u64>,
    #[serde(default)]
    pub property_values: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReference {
    pub id: u64,
    pub reference_set_id: Option<u64>,
    pub test_name: String,
    #[serde(default)]
    pub references: Map<String, Value>,
}

impl TestReference {
    /// Merges `incoming` into the stored references, stamping each new
    /// value with the id of the test result it was taken from.
    pub fn update_references(&mut self, incoming: Map<String, Value>, test_id: u64) {
        for (name, mut value) in incoming {
            if let Value::Object(obj) = &mut value {
                obj.insert("ref_id".to_string(), Value::from(test_id));
            }
            self.references.insert(name, value);
        }
    }
}

/// Any record whose mutations are observable by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchedEntity {
    Submission(Submission),
    TestResult(TestResult),
    ReferenceSet(ReferenceSet),
    TestReference(TestReference),
}

impl WatchedEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            WatchedEntity::Submission(_) => EntityKind::Submission,
            WatchedEntity::TestResult(_) => EntityKind::TestResult,
            WatchedEntity::ReferenceSet(_) => EntityKind::ReferenceSet,
            WatchedEntity::TestReference(_) => EntityKind::TestReference,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            WatchedEntity::Submission(e) => e.id,
            WatchedEntity::TestResult(e) => e.id,
            WatchedEntity::ReferenceSet(e) => e.id,
            WatchedEntity::TestReference(e) => e.id,
        }
    }

    pub fn snapshot(&self) -> Result<Value, serde_json::Error> {
        match self {
            WatchedEntity::Submission(e) => serde_json::to_value(e),
            WatchedEntity::TestResult(e) => serde_json::to_value(e),
            WatchedEntity::ReferenceSet(e) => serde_json::to_value(e),
            WatchedEntity::TestReference(e) => serde_json::to_value(e),
        }
    }
}
