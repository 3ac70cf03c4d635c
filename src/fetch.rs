//! Upstream feed source interface and the pull loop the pipeline drives.

use crate::item::Item;
use crate::pipeline::Pipeline;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed source unavailable: {0}")]
    Unavailable(String),
    #[error("fetch failed: {0}")]
    Other(String),
}

/// Upstream feed reader.
///
/// `pull` must be idempotent per cursor: replaying the same cursor returns
/// the same page, so a failed enqueue pass can be resumed safely.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn pull(
        &self,
        cursor: Option<String>,
        max: usize,
    ) -> Result<(Vec<Item>, Option<String>), FetchError>;
}

/// Pull-driven ingestion: page through the fetcher and feed the pipeline
/// until cancelled.
///
/// The cursor only advances after a page was offered to the queue, and a
/// failed pull keeps the previous cursor, so pages are never skipped.
/// Admission rejections are the queue's backpressure and are logged, not
/// retried here.
pub async fn run_fetch_loop(
    fetcher: Arc<dyn Fetcher>,
    pipeline: Arc<Pipeline>,
    page_size: usize,
    idle_wait: Duration,
    cancel: CancellationToken,
) {
    let mut cursor: Option<String> = None;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match fetcher.pull(cursor.clone(), page_size).await {
            Ok((items, next_cursor)) => {
                let pulled = items.len();
                for item in items {
                    let item_id = item.id.clone();
                    let result = pipeline.enqueue(item);
                    if !result.is_admitted() {
                        tracing::debug!(item_id = %item_id, ?result, "fetched item not admitted");
                    }
                }
                cursor = next_cursor;
                if pulled > 0 {
                    continue;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "feed pull failed; keeping cursor");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(idle_wait) => {}
        }
    }
}
