//! Pool-backed provider client
//!
//! Issues one NNTP verb per pooled connection lease. Metadata verbs
//! (STAT/HEAD/DATE) release the lease as soon as the response is read;
//! BODY/ARTICLE hand the lease to the returned [`DecodedStream`], which
//! keeps the connection exclusively until the body is drained (returned to
//! idle) or the stream is dropped early (destroyed, since it may hold
//! unread protocol data). Transient failures are retried exactly once on a
//! freshly leased connection.

use crate::client::{
    ArticleClient, ArticleHeaders, ArticleResponse, BodyResponse, CompletionHooks, DecodedStream,
    SegmentId, TransferOutcome,
};
use crate::config::ProviderConfig;
use crate::connection::NntpConnection;
use crate::error::{Error, Result};
use crate::failover::Provider;
use crate::pool::{ConnectionFactory, ConnectionLease, ConnectionPool};
use crate::semaphore::Priority;
use crate::yenc::{YencDecoder, YencHeader};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Single-response verbs that release their lease on completion
#[derive(Clone, Copy)]
enum MetadataVerb<'a> {
    Stat(&'a SegmentId),
    Head(&'a SegmentId),
    Date,
}

impl MetadataVerb<'_> {
    fn name(&self) -> &'static str {
        match self {
            MetadataVerb::Stat(_) => "STAT",
            MetadataVerb::Head(_) => "HEAD",
            MetadataVerb::Date => "DATE",
        }
    }
}

enum MetadataReply {
    Stat,
    Head(ArticleHeaders),
    Date(DateTime<Utc>),
}

/// Opens and authenticates provider connections for the pool
pub struct NntpConnectionFactory {
    config: Arc<ProviderConfig>,
}

impl NntpConnectionFactory {
    /// Factory for the given provider
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl ConnectionFactory for NntpConnectionFactory {
    type Connection = NntpConnection;

    async fn create(&self, cancel: &CancellationToken) -> Result<NntpConnection> {
        let connect = async {
            let mut conn = NntpConnection::connect(&self.config).await?;
            conn.authenticate(&self.config.username, &self.config.password)
                .await?;
            Ok(conn)
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = connect => result,
        }
    }
}

/// One usenet provider fronted by a connection pool
pub struct ProviderClient {
    id: String,
    pool: ConnectionPool<NntpConnectionFactory>,
}

impl ProviderClient {
    /// Build the provider's pool; connections are opened lazily
    pub fn new(config: ProviderConfig, idle_timeout: Duration) -> Self {
        let id = config.id();
        let max_connections = config.max_connections.max(1);
        let pool = ConnectionPool::new(
            NntpConnectionFactory::new(config),
            max_connections,
            idle_timeout,
        );
        Self { id, pool }
    }

    /// Dispose the pool and every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run a single-response verb on a leased connection, retrying once on
    /// a fresh connection after a transient failure.
    async fn run_metadata(
        &self,
        verb: MetadataVerb<'_>,
        cancel: &CancellationToken,
    ) -> Result<MetadataReply> {
        let name = verb.name();
        let mut retries_left = 1u32;
        loop {
            let mut lease = match self
                .lease_with_retry(Priority::Low, cancel, name, &mut retries_left)
                .await?
            {
                Some(lease) => lease,
                None => continue,
            };

            let result = match verb {
                MetadataVerb::Stat(segment) => {
                    lease.stat(segment.as_str()).await.map(|()| MetadataReply::Stat)
                }
                MetadataVerb::Head(segment) => lease
                    .head(segment.as_str())
                    .await
                    .map(MetadataReply::Head),
                MetadataVerb::Date => lease.date().await.map(MetadataReply::Date),
            };

            match result {
                // A clean single-line answer either way; the connection is
                // reusable.
                Ok(value) => return Ok(value),
                Err(e @ Error::NoSuchArticle(_)) => return Err(e),
                Err(Error::Cancelled) => {
                    lease.mark_broken();
                    return Err(Error::Cancelled);
                }
                Err(e) if e.is_retryable() && retries_left > 0 => {
                    lease.mark_broken();
                    drop(lease);
                    debug!(
                        "Error executing nntp {} command: {}. Retrying with a new connection.",
                        name, e
                    );
                    retries_left -= 1;
                }
                Err(e) => {
                    lease.mark_broken();
                    warn!("Error executing nntp {} command: {}", name, e);
                    return Err(e);
                }
            }
        }
    }

    /// Lease a connection, consuming one retry on transient lease failures.
    ///
    /// `Ok(None)` means a retry was consumed and the caller should loop.
    async fn lease_with_retry(
        &self,
        priority: Priority,
        cancel: &CancellationToken,
        verb: &str,
        retries_left: &mut u32,
    ) -> Result<Option<ConnectionLease<NntpConnection>>> {
        match self.pool.lease(priority, cancel).await {
            Ok(lease) => Ok(Some(lease)),
            Err(e @ (Error::Cancelled | Error::PoolDisposed)) => Err(e),
            Err(e) if *retries_left > 0 => {
                debug!(
                    "Error leasing connection for {}: {}. Retrying with a new connection.",
                    verb, e
                );
                *retries_left -= 1;
                Ok(None)
            }
            Err(e) => {
                warn!("Error leasing connection for {}: {}", verb, e);
                Err(e)
            }
        }
    }

    /// Start a BODY or ARTICLE transfer, retrying once on transient errors.
    async fn start_download(
        &self,
        segment: &SegmentId,
        want_headers: bool,
        cancel: &CancellationToken,
    ) -> Result<(Option<ArticleHeaders>, NetworkYencStream)> {
        let verb = if want_headers { "ARTICLE" } else { "BODY" };
        let mut retries_left = 1u32;
        loop {
            // Downloads always contend at high pool priority so metadata
            // probing cannot crowd out streaming.
            let mut lease = match self.lease_with_retry(Priority::High, cancel, verb, &mut retries_left).await? {
                Some(lease) => lease,
                None => continue,
            };

            let started = if want_headers {
                lease.article_start(segment.as_str()).await.map(Some)
            } else {
                lease.body_start(segment.as_str()).await.map(|()| None)
            };

            match started {
                Ok(headers) => {
                    return Ok((headers, NetworkYencStream::new(segment.clone(), lease)));
                }
                Err(e @ Error::NoSuchArticle(_)) => return Err(e),
                Err(Error::Cancelled) => {
                    lease.mark_broken();
                    return Err(Error::Cancelled);
                }
                Err(e) if e.is_retryable() && retries_left > 0 => {
                    lease.mark_broken();
                    drop(lease);
                    debug!(
                        "Error executing nntp {} command: {}. Retrying with a new connection.",
                        verb, e
                    );
                    retries_left -= 1;
                }
                Err(e) => {
                    lease.mark_broken();
                    warn!("Error executing nntp {} command: {}", verb, e);
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl ArticleClient for ProviderClient {
    async fn stat(&self, segment: &SegmentId, cancel: &CancellationToken) -> Result<()> {
        self.run_metadata(MetadataVerb::Stat(segment), cancel)
            .await
            .map(|_| ())
    }

    async fn head(
        &self,
        segment: &SegmentId,
        cancel: &CancellationToken,
    ) -> Result<ArticleHeaders> {
        match self.run_metadata(MetadataVerb::Head(segment), cancel).await? {
            MetadataReply::Head(headers) => Ok(headers),
            _ => Err(Error::Other("unexpected HEAD reply".to_string())),
        }
    }

    async fn date(&self, cancel: &CancellationToken) -> Result<DateTime<Utc>> {
        match self.run_metadata(MetadataVerb::Date, cancel).await? {
            MetadataReply::Date(date) => Ok(date),
            _ => Err(Error::Other("unexpected DATE reply".to_string())),
        }
    }

    async fn body(
        &self,
        segment: &SegmentId,
        _priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<BodyResponse> {
        let (_, stream) = self.start_download(segment, false, cancel).await?;
        Ok(BodyResponse {
            segment: segment.clone(),
            stream: Box::new(stream),
        })
    }

    async fn article(
        &self,
        segment: &SegmentId,
        _priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<ArticleResponse> {
        let (headers, stream) = self.start_download(segment, true, cancel).await?;
        Ok(ArticleResponse {
            segment: segment.clone(),
            headers: headers.unwrap_or_default(),
            stream: Box::new(stream),
        })
    }
}

impl Provider for ProviderClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn available_connections(&self) -> usize {
        self.pool.available_connections()
    }
}

/// Decoded body stream that owns the pooled connection for its lifetime
///
/// The lease returns to the idle set only after the dot terminator is read;
/// a stream dropped mid-body destroys the connection instead, because it
/// still holds unread article data.
struct NetworkYencStream {
    segment: SegmentId,
    lease: Option<ConnectionLease<NntpConnection>>,
    decoder: YencDecoder,
    pending: Vec<u8>,
    pos: usize,
    done: bool,
    hooks: CompletionHooks,
}

impl NetworkYencStream {
    fn new(segment: SegmentId, lease: ConnectionLease<NntpConnection>) -> Self {
        Self {
            segment,
            lease: Some(lease),
            decoder: YencDecoder::new(),
            pending: Vec::new(),
            pos: 0,
            done: false,
            hooks: CompletionHooks::new(),
        }
    }

    /// Pull one article line through the decoder. Returns false at the dot
    /// terminator.
    async fn fill_one_line(&mut self) -> Result<bool> {
        let lease = self
            .lease
            .as_mut()
            .ok_or(Error::ConnectionClosed)?;

        match lease.read_data_line().await {
            Ok(Some(line)) => {
                if let Err(e) = self.decoder.feed_line(&line, &mut self.pending) {
                    self.abandon();
                    return Err(e);
                }
                Ok(true)
            }
            Ok(None) => {
                self.finish();
                Ok(false)
            }
            Err(e) => {
                self.abandon();
                Err(e)
            }
        }
    }

    /// Body fully received: recycle the connection and fire the hooks.
    fn finish(&mut self) {
        self.done = true;
        if let Err(e) = self.decoder.verify_crc() {
            // Data already left the server as-is; surfacing would fail
            // otherwise playable streams, so record and continue.
            warn!("Segment {}: {}", self.segment, e);
        }
        drop(self.lease.take());
        self.hooks.fire(TransferOutcome::Retrieved);
    }

    /// Transfer failed or was abandoned: the connection is tainted.
    fn abandon(&mut self) {
        self.done = true;
        if let Some(mut lease) = self.lease.take() {
            lease.mark_broken();
        }
        self.hooks.fire(TransferOutcome::NotRetrieved);
    }
}

impl Drop for NetworkYencStream {
    fn drop(&mut self) {
        if !self.done {
            self.abandon();
        }
    }
}

#[async_trait]
impl DecodedStream for NetworkYencStream {
    async fn yenc_header(&mut self) -> Result<YencHeader> {
        loop {
            if self.decoder.header_ready() {
                // header_ready guarantees header() is Some.
                #[expect(clippy::expect_used)]
                return Ok(self
                    .decoder
                    .header()
                    .expect("BUG: header_ready without header"));
            }
            if self.done || !self.fill_one_line().await? {
                return Err(Error::InvalidResponse(format!(
                    "Segment {} carries no yEnc header",
                    self.segment
                )));
            }
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.pending.len() {
                let n = (self.pending.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
                self.pos += n;
                if self.pos == self.pending.len() {
                    self.pending.clear();
                    self.pos = 0;
                }
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            if !self.fill_one_line().await? && self.pending.is_empty() {
                return Ok(0);
            }
        }
    }

    fn completion(&mut self) -> &mut CompletionHooks {
        &mut self.hooks
    }
}
