#![allow(dead_code)]

use async_trait::async_trait;
use feedrelay::{
    ContentKind, Item, Priority, Transport, TransportError, TransportResponse, WebhookRequest,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Transport that replays a scripted list of replies and records every
/// request with its arrival instant. Replies past the end of the script are
/// plain 200s. An optional gate holds requests until permits are released,
/// which lets tests pin a worker deterministically.
#[derive(Debug)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    log: Mutex<Vec<(Instant, WebhookRequest)>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            log: Mutex::new(Vec::new()),
            gate: None,
        })
    }

    /// Like `new`, but every request must first acquire a gate permit.
    pub fn gated(replies: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            log: Mutex::new(Vec::new()),
            gate: Some(Arc::new(Semaphore::new(0))),
        })
    }

    /// Let `n` gated requests through.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn requests(&self) -> Vec<WebhookRequest> {
        self.log.lock().unwrap().iter().map(|(_, req)| req.clone()).collect()
    }

    /// Request URLs in arrival order.
    pub fn urls(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(_, req)| req.url.clone()).collect()
    }

    /// Arrival instants for requests to one URL.
    pub fn times_for(&self, url: &str) -> Vec<Instant> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, req)| req.url == url)
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.log.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, request: WebhookRequest) -> Result<TransportResponse, TransportError> {
        self.log.lock().unwrap().push((Instant::now(), request));
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate never closes").forget();
        }
        self.replies.lock().unwrap().pop_front().unwrap_or_else(|| Ok(ok(200)))
    }
}

pub fn ok(status: u16) -> TransportResponse {
    TransportResponse { status, retry_after: None, body: None }
}

pub fn reply(status: u16) -> Result<TransportResponse, TransportError> {
    Ok(ok(status))
}

pub fn item_to(id: &str, endpoint: &str, priority: Priority) -> Item {
    Item::new(id, endpoint, ContentKind::Article, priority, serde_json::json!({ "id": id }))
}

/// Poll `condition` until it holds or `timeout` expires.
pub async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
