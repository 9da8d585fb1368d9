//! Client-facing request model. Payloads are opaque to the engine; the type
//! tag and priority exist for the host application, consensus only orders
//! digests.

use accord_core::auth::{digest_chunks, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Update,
    Booking,
    Rsvp,
    Payment,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Booking => "booking",
            Self::Rsvp => "rsvp",
            Self::Payment => "payment",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Caller-supplied shape of a submission; optional fields are filled in by
/// the manager.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewRequest {
    pub id: Option<String>,
    pub kind: Option<RequestKind>,
    pub payload: serde_json::Value,
    pub priority: Option<Priority>,
    pub requester: Option<String>,
}

impl NewRequest {
    pub fn update(payload: serde_json::Value) -> Self {
        Self {
            kind: Some(RequestKind::Update),
            payload,
            ..Self::default()
        }
    }
}

/// A fully-formed request owned by the manager until it commits or fails.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub kind: RequestKind,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub requester: String,
    pub submitted_at: DateTime<Utc>,
}

impl Request {
    pub fn from_new(new: NewRequest, local_node: &str) -> Self {
        Self {
            id: new.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            kind: new.kind.unwrap_or(RequestKind::Update),
            payload: new.payload,
            priority: new.priority.unwrap_or(Priority::Medium),
            requester: new.requester.unwrap_or_else(|| local_node.to_string()),
            submitted_at: Utc::now(),
        }
    }

    /// Fill request a new leader proposes for a sequence number its faulty
    /// predecessor assigned but never revealed; commits as an empty slot so
    /// the ordered watermark can pass it.
    pub fn noop(view: u64, seq: u64, proposer: &str) -> Self {
        Self {
            id: format!("noop-{view}-{seq}"),
            kind: RequestKind::Update,
            payload: serde_json::Value::Null,
            priority: Priority::Low,
            requester: proposer.to_string(),
            submitted_at: Utc::now(),
        }
    }

    /// Deterministic fingerprint the cluster agrees on. serde_json maps are
    /// key-sorted by default, so the payload encoding is canonical.
    pub fn digest(&self) -> Digest {
        let payload = serde_json::to_vec(&self.payload).unwrap_or_default();
        digest_chunks([
            self.id.as_bytes(),
            self.kind.as_str().as_bytes(),
            self.priority.as_str().as_bytes(),
            payload.as_slice(),
        ])
    }
}
