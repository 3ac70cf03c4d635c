//! Explicit trace context for outbound requests.
//!
//! The context travels through the per-send call path instead of any
//! thread-local. Each item send opens a root context; every retry attempt
//! gets a child linked to it, and the wire form is a W3C `traceparent`
//! header.

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: u128,
    span_id: u64,
    parent_id: Option<u64>,
}

impl TraceContext {
    /// Fresh root context for one item's delivery.
    pub fn root() -> Self {
        Self {
            trace_id: Uuid::new_v4().as_u128(),
            span_id: rand::random::<u64>().max(1),
            parent_id: None,
        }
    }

    /// Child context for a retry attempt, linked to this span.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: rand::random::<u64>().max(1),
            parent_id: Some(self.span_id),
        }
    }

    pub fn trace_id(&self) -> u128 {
        self.trace_id
    }

    pub fn span_id(&self) -> u64 {
        self.span_id
    }

    pub fn parent_id(&self) -> Option<u64> {
        self.parent_id
    }

    /// W3C trace-context header value.
    pub fn traceparent(&self) -> String {
        format!("00-{:032x}-{:016x}-01", self.trace_id, self.span_id)
    }
}
