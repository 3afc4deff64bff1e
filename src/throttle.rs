//! Download concurrency limiting
//!
//! Caps concurrent BODY/ARTICLE transfers behind a [`PrioritizedSemaphore`]
//! sized to the configured maximum download connections — application-level
//! throttling, independent of the pools' transport-level capacity. Metadata
//! verbs pass through unthrottled.
//!
//! A permit is released when the transfer completes, not when the call
//! returns: the release rides the response stream's completion hooks, so
//! draining, erroring, dropping and cancellation all free the slot exactly
//! once.

use crate::client::{ArticleClient, ArticleHeaders, ArticleResponse, BodyResponse, SegmentId};
use crate::error::{Error, Result};
use crate::semaphore::{PrioritizedSemaphore, Priority, PriorityOdds};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Wraps an article client and throttles its download verbs
pub struct DownloadLimiter<C> {
    inner: C,
    gate: Arc<PrioritizedSemaphore>,
}

impl<C: ArticleClient> DownloadLimiter<C> {
    /// Limit `inner` to `max_downloads` concurrent transfers, favoring
    /// high-priority waiters with the given odds
    pub fn new(inner: C, max_downloads: usize, odds: PriorityOdds) -> Self {
        Self {
            inner,
            gate: Arc::new(PrioritizedSemaphore::new(max_downloads.max(1), odds)),
        }
    }

    /// Download slots currently free
    pub fn available_slots(&self) -> usize {
        self.gate.available()
    }

    async fn acquire_slot(&self, priority: Priority, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.gate.acquire(priority) => Ok(()),
        }
    }
}

#[async_trait]
impl<C: ArticleClient> ArticleClient for DownloadLimiter<C> {
    async fn stat(&self, segment: &SegmentId, cancel: &CancellationToken) -> Result<()> {
        self.inner.stat(segment, cancel).await
    }

    async fn head(
        &self,
        segment: &SegmentId,
        cancel: &CancellationToken,
    ) -> Result<ArticleHeaders> {
        self.inner.head(segment, cancel).await
    }

    async fn date(&self, cancel: &CancellationToken) -> Result<DateTime<Utc>> {
        self.inner.date(cancel).await
    }

    async fn body(
        &self,
        segment: &SegmentId,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<BodyResponse> {
        self.acquire_slot(priority, cancel).await?;
        match self.inner.body(segment, priority, cancel).await {
            Ok(mut response) => {
                let gate = self.gate.clone();
                response.stream.completion().push(move |_| gate.release());
                Ok(response)
            }
            Err(e) => {
                self.gate.release();
                Err(e)
            }
        }
    }

    async fn article(
        &self,
        segment: &SegmentId,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<ArticleResponse> {
        self.acquire_slot(priority, cancel).await?;
        match self.inner.article(segment, priority, cancel).await {
            Ok(mut response) => {
                let gate = self.gate.clone();
                response.stream.completion().push(move |_| gate.release());
                Ok(response)
            }
            Err(e) => {
                self.gate.release();
                Err(e)
            }
        }
    }
}
