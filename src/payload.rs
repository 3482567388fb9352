//! Notification envelope construction.
//!
//! An envelope is built and serialized once per mutation; the resulting
//! [`PreparedEnvelope`] is shared by reference across every delivery for that
//! mutation so all subscribers see byte-identical bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::entities::{Project, WatchedEntity};
use crate::types::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Edit,
    Delete,
}

impl EventKind {
    pub fn from_created(was_created: bool) -> Self {
        if was_created {
            EventKind::Create
        } else {
            EventKind::Edit
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub event: EventKind,
    pub source: String,
    pub project: Value,
    pub object: Value,
}

/// Serialized, immutable form of an envelope.
#[derive(Debug, Clone)]
pub struct PreparedEnvelope {
    pub kind: EntityKind,
    pub body: Arc<str>,
    pub value: Arc<Value>,
}

pub fn build(
    event: EventKind,
    entity: &WatchedEntity,
    project: &Project,
) -> Result<NotificationEnvelope, serde_json::Error> {
    Ok(NotificationEnvelope {
        event,
        source: entity.kind().source_name().to_string(),
        project: serde_json::to_value(project)?,
        object: entity.snapshot()?,
    })
}

pub fn prepare(
    event: EventKind,
    entity: &WatchedEntity,
    project: &Project,
) -> Result<PreparedEnvelope, serde_json::Error> {
    let envelope = build(event, entity, project)?;
    let value = serde_json::to_value(&envelope)?;
    let body = serde_json::to_string(&value)?;
    Ok(PreparedEnvelope {
        kind: entity.kind(),
        body: Arc::from(body),
        value: Arc::new(value),
    })
}
