//! Data model: items, priorities, admission results, and delivery outcomes.

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Delivery priority. Lane 0 drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Queue lane index; smaller drains first.
    pub fn lane(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    pub fn from_lane(lane: usize) -> Option<Self> {
        match lane {
            0 => Some(Self::High),
            1 => Some(Self::Normal),
            2 => Some(Self::Low),
            _ => None,
        }
    }

    /// One lane up; `High` stays `High`.
    pub fn promoted(self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal | Self::High => Self::High,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

/// What kind of content the payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Article,
    Video,
    Social,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Article => "article",
            Self::Video => "video",
            Self::Social => "social",
        }
    }
}

/// A unit of delivery work.
///
/// The queue owns an item while it is queued; a worker holds it exclusively
/// while in flight. Only the pool mutates `attempts` and `last_error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    /// Delivery target; canonicalized into the endpoint key for limiter and
    /// breaker scoping.
    pub endpoint: String,
    /// Deterministic hash of delivery-relevant content, used for dedup.
    pub fingerprint: String,
    pub kind: ContentKind,
    pub priority: Priority,
    pub payload: serde_json::Value,
    /// Millis on the pipeline clock when admitted; set by the queue.
    #[serde(skip)]
    pub enqueued_at: Option<u64>,
    /// Attempt count, strictly monotonic over the item's lifetime.
    #[serde(skip)]
    pub attempts: u32,
    /// Optional global deadline, millis on the pipeline clock.
    #[serde(skip)]
    pub deadline_at: Option<u64>,
    #[serde(skip)]
    pub last_error: Option<ErrorKind>,
}

/// Why an item failed validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidItem {
    #[error("item id is empty")]
    MissingId,
    #[error("endpoint is empty")]
    MissingEndpoint,
    #[error("fingerprint is empty")]
    MissingFingerprint,
    #[error("payload is {size} bytes, limit {limit}")]
    OversizePayload { size: usize, limit: usize },
}

impl Item {
    /// Build an item, computing the fingerprint from endpoint and payload.
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        kind: ContentKind,
        priority: Priority,
        payload: serde_json::Value,
    ) -> Self {
        let endpoint = endpoint.into();
        let fingerprint = Self::fingerprint_of(&endpoint, &payload);
        Self {
            id: id.into(),
            endpoint,
            fingerprint,
            kind,
            priority,
            payload,
            enqueued_at: None,
            attempts: 0,
            deadline_at: None,
            last_error: None,
        }
    }

    /// Deterministic fingerprint over the delivery-relevant content.
    ///
    /// Name-based UUID (v5) over endpoint plus serialized payload, so the
    /// same content always maps to the same fingerprint regardless of
    /// receipt time or metadata.
    pub fn fingerprint_of(endpoint: &str, payload: &serde_json::Value) -> String {
        let mut material = Vec::with_capacity(endpoint.len() + 64);
        material.extend_from_slice(endpoint.as_bytes());
        material.push(0);
        material.extend_from_slice(payload.to_string().as_bytes());
        Uuid::new_v5(&Uuid::NAMESPACE_OID, &material).simple().to_string()
    }

    /// Precondition checks applied at admission.
    pub fn validate(&self, max_payload_bytes: usize) -> Result<(), InvalidItem> {
        if self.id.is_empty() {
            return Err(InvalidItem::MissingId);
        }
        if self.endpoint.trim().is_empty() {
            return Err(InvalidItem::MissingEndpoint);
        }
        if self.fingerprint.is_empty() {
            return Err(InvalidItem::MissingFingerprint);
        }
        let size = self.payload.to_string().len();
        if size > max_payload_bytes {
            return Err(InvalidItem::OversizePayload { size, limit: max_payload_bytes });
        }
        Ok(())
    }
}

/// Why the queue refused an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull,
    Duplicate,
    ValidationFailed,
    ShuttingDown,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Duplicate => "duplicate",
            Self::ValidationFailed => "validation_failed",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Synchronous answer from `Pipeline::enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionResult {
    Admitted,
    Rejected(RejectReason),
}

impl AdmissionResult {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Why an item was dropped without a delivery attempt sequence completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Displaced by a higher-priority item under the overflow policy.
    Displaced,
    /// The pipeline shut down before delivery finished.
    ShuttingDown,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Displaced => "displaced",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Terminal classification of one item's delivery attempt sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Succeeded { latency: Duration, status: u16, attempts: u32 },
    Failed { kind: ErrorKind, attempts: u32, last_status: Option<u16> },
    Dropped { reason: DropReason },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Metric label for `sends_total{outcome}`.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "success",
            Self::Failed { kind, .. } => kind.as_str(),
            Self::Dropped { reason } => reason.as_str(),
        }
    }
}
