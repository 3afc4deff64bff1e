//! Multi-provider failover
//!
//! Fronts any number of provider clients and preserves the illusion of one
//! reliable article source: "no article with that message-id" advances to
//! the next provider (unless it is the last), transient errors advance too,
//! and the last provider's outcome — success or failure — is authoritative.

use crate::client::{ArticleClient, ArticleHeaders, ArticleResponse, BodyResponse, SegmentId};
use crate::error::{Error, Result};
use crate::semaphore::Priority;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// An article client with enough identity for failover ordering
pub trait Provider: ArticleClient {
    /// Provider identifier (host:port) for logs
    fn id(&self) -> &str;

    /// Lease capacity currently available, the ordering key
    fn available_connections(&self) -> usize;
}

/// Orders providers by availability and fails over between them
pub struct MultiProviderClient {
    providers: Vec<Arc<dyn Provider>>,
}

impl MultiProviderClient {
    /// Front the given providers
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self { providers }
    }

    /// Number of configured providers
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Providers ordered most-available-first; ties keep configuration order
    fn ordered_providers(&self) -> Vec<Arc<dyn Provider>> {
        let mut ordered = self.providers.clone();
        ordered.sort_by(|a, b| b.available_connections().cmp(&a.available_connections()));
        ordered
    }

    async fn run_with_failover<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(Arc<dyn Provider>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ordered = self.ordered_providers();
        if ordered.is_empty() {
            return Err(Error::NoProviders);
        }

        let count = ordered.len();
        let mut last_error: Option<Error> = None;
        for (i, provider) in ordered.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(e) = &last_error {
                debug!(
                    "Encountered error during NNTP operation: `{}`. Trying provider {}.",
                    e,
                    provider.id()
                );
            }

            let is_last = i + 1 == count;
            match op(provider).await {
                Ok(value) => return Ok(value),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                // The last provider's answer stands, even a 430.
                Err(e) if is_last => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or(Error::NoProviders))
    }
}

#[async_trait]
impl ArticleClient for MultiProviderClient {
    async fn stat(&self, segment: &SegmentId, cancel: &CancellationToken) -> Result<()> {
        self.run_with_failover(cancel, |p| async move { p.stat(segment, cancel).await })
            .await
    }

    async fn head(
        &self,
        segment: &SegmentId,
        cancel: &CancellationToken,
    ) -> Result<ArticleHeaders> {
        self.run_with_failover(cancel, |p| async move { p.head(segment, cancel).await })
            .await
    }

    async fn date(&self, cancel: &CancellationToken) -> Result<DateTime<Utc>> {
        self.run_with_failover(cancel, |p| async move { p.date(cancel).await })
            .await
    }

    async fn body(
        &self,
        segment: &SegmentId,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<BodyResponse> {
        self.run_with_failover(cancel, |p| async move { p.body(segment, priority, cancel).await })
            .await
    }

    async fn article(
        &self,
        segment: &SegmentId,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<ArticleResponse> {
        self.run_with_failover(cancel, |p| async move {
            p.article(segment, priority, cancel).await
        })
        .await
    }
}
