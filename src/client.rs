//! The article client seam shared by every layer of the stack
//!
//! [`ArticleClient`] is the one-capability interface the decorator chain is
//! composed from: pool-backed provider, failover front, download limiter and
//! article cache each implement it and wrap another implementation.
//!
//! BODY/ARTICLE responses carry a [`DecodedStream`]: the decoded bytes plus
//! a [`CompletionHooks`] stack that fires exactly once on every exit path
//! (drained, error, drop). Layers holding permits or leases register their
//! release there instead of threading callbacks through the call chain.

use crate::error::{Error, Result};
use crate::yenc::YencHeader;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Opaque identifier of one NNTP article (message-id without brackets)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(String);

impl SegmentId {
    /// View as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SegmentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SegmentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw article headers from a HEAD or ARTICLE response
#[derive(Debug, Clone, Default)]
pub struct ArticleHeaders {
    lines: Vec<String>,
}

impl ArticleHeaders {
    /// Build from the raw header lines of the response
    pub fn from_lines(lines: Vec<String>) -> Self {
        Self { lines }
    }

    /// Look up a header value by case-insensitive name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }

    /// The raw header lines
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// How a transfer ended, as reported to completion hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The article body was fully delivered
    Retrieved,
    /// The transfer errored, was cancelled, or was abandoned
    NotRetrieved,
}

/// Stack of release actions fired when a transfer completes
///
/// Guaranteed-once: `fire` drains the stack, so a second call (or the drop
/// after an explicit fire) is a no-op. Dropping unfired hooks reports
/// [`TransferOutcome::NotRetrieved`] — an abandoned stream still frees every
/// permit held on its behalf.
#[derive(Default)]
pub struct CompletionHooks {
    hooks: Vec<Box<dyn FnOnce(TransferOutcome) + Send>>,
}

impl CompletionHooks {
    /// Empty hook stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release action
    pub fn push(&mut self, hook: impl FnOnce(TransferOutcome) + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Fire all registered hooks once
    pub fn fire(&mut self, outcome: TransferOutcome) {
        for hook in self.hooks.drain(..) {
            hook(outcome);
        }
    }
}

impl Drop for CompletionHooks {
    fn drop(&mut self) {
        self.fire(TransferOutcome::NotRetrieved);
    }
}

impl std::fmt::Debug for CompletionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHooks")
            .field("pending", &self.hooks.len())
            .finish()
    }
}

/// A decoded article body delivered incrementally
///
/// `read` returning 0 means the body is fully drained; at that point the
/// stream has fired its completion hooks with `Retrieved` and released any
/// underlying connection. Dropping the stream early releases everything
/// with `NotRetrieved`.
#[async_trait]
pub trait DecodedStream: Send {
    /// The segment's yEnc header, parsing it from the front of the body if
    /// it has not been seen yet
    async fn yenc_header(&mut self) -> Result<YencHeader>;

    /// Read decoded bytes into `buf`; 0 = end of body
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// The completion hook stack, for layers that must release on completion
    fn completion(&mut self) -> &mut CompletionHooks;
}

/// Response to a BODY command
pub struct BodyResponse {
    /// The requested segment
    pub segment: SegmentId,
    /// The decoded body
    pub stream: Box<dyn DecodedStream>,
}

/// Response to an ARTICLE command
pub struct ArticleResponse {
    /// The requested segment
    pub segment: SegmentId,
    /// Parsed article headers
    pub headers: ArticleHeaders,
    /// The decoded body
    pub stream: Box<dyn DecodedStream>,
}

/// One reliable source of decoded articles
///
/// Implemented by the pool-backed provider client and by each wrapper in
/// the chain (failover, download limiter, cache). `priority` on BODY and
/// ARTICLE is the download-scheduling class: interactive stream reads pass
/// [`Priority::High`](crate::Priority), background probing passes
/// [`Priority::Low`](crate::Priority).
#[async_trait]
pub trait ArticleClient: Send + Sync {
    /// STAT: does the article exist
    async fn stat(&self, segment: &SegmentId, cancel: &CancellationToken) -> Result<()>;

    /// HEAD: article headers only
    async fn head(&self, segment: &SegmentId, cancel: &CancellationToken)
    -> Result<ArticleHeaders>;

    /// DATE: server clock
    async fn date(&self, cancel: &CancellationToken) -> Result<DateTime<Utc>>;

    /// BODY: decoded article body
    async fn body(
        &self,
        segment: &SegmentId,
        priority: crate::Priority,
        cancel: &CancellationToken,
    ) -> Result<BodyResponse>;

    /// ARTICLE: headers plus decoded body
    async fn article(
        &self,
        segment: &SegmentId,
        priority: crate::Priority,
        cancel: &CancellationToken,
    ) -> Result<ArticleResponse>;

    /// The segment's yEnc header
    ///
    /// Default: fetch the body at low priority and parse the header off its
    /// front; the remainder of the transfer is abandoned. The cache layer
    /// overrides this with its memoized entry.
    async fn yenc_header(
        &self,
        segment: &SegmentId,
        cancel: &CancellationToken,
    ) -> Result<YencHeader> {
        let mut response = self.body(segment, crate::Priority::Low, cancel).await?;
        response.stream.yenc_header().await
    }
}

/// Stream for a segment treated as absent: zero bytes, no yEnc header
pub(crate) struct EmptyStream {
    segment: SegmentId,
    hooks: CompletionHooks,
}

impl EmptyStream {
    pub(crate) fn new(segment: SegmentId) -> Self {
        Self {
            segment,
            hooks: CompletionHooks::new(),
        }
    }
}

#[async_trait]
impl DecodedStream for EmptyStream {
    async fn yenc_header(&mut self) -> Result<YencHeader> {
        Err(Error::NoSuchArticle(self.segment.to_string()))
    }

    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        self.hooks.fire(TransferOutcome::Retrieved);
        Ok(0)
    }

    fn completion(&mut self) -> &mut CompletionHooks {
        &mut self.hooks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_segment_id_display() {
        let id = SegmentId::from("part1@example.com");
        assert_eq!(id.to_string(), "part1@example.com");
        assert_eq!(id.as_str(), "part1@example.com");
    }

    #[test]
    fn test_article_headers_lookup() {
        let headers = ArticleHeaders::from_lines(vec![
            "Subject: test post".to_string(),
            "Message-ID: <abc@example.com>".to_string(),
        ]);
        assert_eq!(headers.get("subject"), Some("test post"));
        assert_eq!(headers.get("message-id"), Some("<abc@example.com>"));
        assert_eq!(headers.get("from"), None);
    }

    #[test]
    fn test_completion_hooks_fire_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut hooks = CompletionHooks::new();
        let c = count.clone();
        hooks.push(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        hooks.fire(TransferOutcome::Retrieved);
        hooks.fire(TransferOutcome::Retrieved);
        drop(hooks);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_completion_hooks_fire_on_drop() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        {
            let mut hooks = CompletionHooks::new();
            let s = seen.clone();
            hooks.push(move |outcome| {
                *s.lock().unwrap() = Some(outcome);
            });
        }
        assert_eq!(*seen.lock().unwrap(), Some(TransferOutcome::NotRetrieved));
    }

    #[tokio::test]
    async fn test_empty_stream_reads_nothing() {
        let mut stream = EmptyStream::new(SegmentId::from("gone@example.com"));
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(
            stream.yenc_header().await,
            Err(Error::NoSuchArticle(_))
        ));
    }
}
