//! Decoded-article disk cache with per-segment request deduplication
//!
//! Sits outermost in the client chain. Each segment's decoded bytes land in
//! one file at a stable path (hex SHA-256 of the segment id) so repeated
//! reads — reopening a file, seeking backwards — never re-download. A
//! per-segment mutex collapses concurrent requests for the same segment
//! into a single underlying fetch. Entries are never evicted here; size
//! management belongs to an outer layer.

use crate::client::{
    ArticleClient, ArticleHeaders, ArticleResponse, BodyResponse, CompletionHooks, DecodedStream,
    SegmentId, TransferOutcome,
};
use crate::error::{Error, Result};
use crate::semaphore::Priority;
use crate::yenc::YencHeader;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Clone)]
struct CacheEntry {
    yenc: YencHeader,
    article_headers: Option<ArticleHeaders>,
    has_article_headers: bool,
}

/// Caching wrapper around an article client
pub struct ArticleCache<C> {
    inner: C,
    dir: PathBuf,
    entries: Mutex<HashMap<SegmentId, CacheEntry>>,
    // Grows by one mutex per distinct segment ever requested; entries are
    // never removed while a waiter may hold them.
    pending: Mutex<HashMap<SegmentId, Arc<AsyncMutex<()>>>>,
}

impl<C: ArticleClient> ArticleCache<C> {
    /// Cache `inner`'s downloads under `dir` (created on first use)
    pub fn new(inner: C, dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            dir: dir.into(),
            entries: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Stable on-disk location for a segment's decoded bytes
    pub fn cache_path(&self, segment: &SegmentId) -> PathBuf {
        let hash = Sha256::digest(segment.as_str().as_bytes());
        let mut name = String::with_capacity(64);
        for byte in hash {
            name.push_str(&format!("{:02x}", byte));
        }
        self.dir.join(name)
    }

    fn key_lock(&self, segment: &SegmentId) -> Arc<AsyncMutex<()>> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(segment.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn entry(&self, segment: &SegmentId) -> Option<CacheEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(segment)
            .cloned()
    }

    fn insert_entry(&self, segment: &SegmentId, entry: CacheEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(segment.clone(), entry);
    }

    /// Copy the full decoded body to the segment's cache file
    ///
    /// Draining the stream here is also what releases the underlying
    /// connection and download slot.
    async fn copy_to_cache(
        &self,
        segment: &SegmentId,
        stream: &mut Box<dyn DecodedStream>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.cache_path(segment);

        let result = Self::copy_loop(&path, stream, cancel).await;
        if result.is_err() {
            // A partial cache file must not be served later.
            let _ = tokio::fs::remove_file(&path).await;
        }
        result
    }

    async fn copy_loop(
        path: &Path,
        stream: &mut Box<dyn DecodedStream>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn open_cached(
        &self,
        segment: &SegmentId,
        header: YencHeader,
    ) -> Result<Box<dyn DecodedStream>> {
        let file = tokio::fs::File::open(self.cache_path(segment)).await?;
        Ok(Box::new(CachedSegmentStream {
            header,
            file,
            done: false,
            hooks: CompletionHooks::new(),
        }))
    }

    async fn lock_key(
        &self,
        lock: &Arc<AsyncMutex<()>>,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            guard = lock.clone().lock_owned() => Ok(guard),
        }
    }
}

#[async_trait]
impl<C: ArticleClient> ArticleClient for ArticleCache<C> {
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
        let lock = self.key_lock(segment);
        let _guard = self.lock_key(&lock, cancel).await?;

        if let Some(entry) = self.entry(segment) {
            return Ok(BodyResponse {
                segment: segment.clone(),
                stream: self.open_cached(segment, entry.yenc).await?,
            });
        }

        // A file left by an earlier process run is unusable without its
        // memoized yEnc header; refetch and overwrite it.
        let mut response = self.inner.body(segment, priority, cancel).await?;
        let yenc = response.stream.yenc_header().await?;
        self.copy_to_cache(segment, &mut response.stream, cancel)
            .await?;
        self.insert_entry(
            segment,
            CacheEntry {
                yenc: yenc.clone(),
                article_headers: None,
                has_article_headers: false,
            },
        );
        debug!("Cached segment {}", segment);

        Ok(BodyResponse {
            segment: segment.clone(),
            stream: self.open_cached(segment, yenc).await?,
        })
    }

    async fn article(
        &self,
        segment: &SegmentId,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<ArticleResponse> {
        let lock = self.key_lock(segment);
        let _guard = self.lock_key(&lock, cancel).await?;

        if let Some(entry) = self.entry(segment) {
            if entry.has_article_headers {
                return Ok(ArticleResponse {
                    segment: segment.clone(),
                    headers: entry.article_headers.clone().unwrap_or_default(),
                    stream: self.open_cached(segment, entry.yenc).await?,
                });
            }

            // Body already cached; backfill the article headers with HEAD.
            let headers = self.inner.head(segment, cancel).await?;
            self.insert_entry(
                segment,
                CacheEntry {
                    yenc: entry.yenc.clone(),
                    article_headers: Some(headers.clone()),
                    has_article_headers: true,
                },
            );
            return Ok(ArticleResponse {
                segment: segment.clone(),
                headers,
                stream: self.open_cached(segment, entry.yenc).await?,
            });
        }

        let mut response = self.inner.article(segment, priority, cancel).await?;
        let yenc = response.stream.yenc_header().await?;
        self.copy_to_cache(segment, &mut response.stream, cancel)
            .await?;
        self.insert_entry(
            segment,
            CacheEntry {
                yenc: yenc.clone(),
                article_headers: Some(response.headers.clone()),
                has_article_headers: true,
            },
        );
        debug!("Cached segment {} with article headers", segment);

        Ok(ArticleResponse {
            segment: segment.clone(),
            headers: response.headers,
            stream: self.open_cached(segment, yenc).await?,
        })
    }

    async fn yenc_header(
        &self,
        segment: &SegmentId,
        cancel: &CancellationToken,
    ) -> Result<YencHeader> {
        if let Some(entry) = self.entry(segment) {
            return Ok(entry.yenc);
        }
        // Populates the cache as a side effect; the header then comes from
        // the freshly recorded entry via the returned stream.
        let mut response = self.body(segment, Priority::Low, cancel).await?;
        response.stream.yenc_header().await
    }
}

/// Serves already-decoded bytes from the cache file, reporting the
/// pre-parsed yEnc header without re-decoding
struct CachedSegmentStream {
    header: YencHeader,
    file: tokio::fs::File,
    done: bool,
    hooks: CompletionHooks,
}

#[async_trait]
impl DecodedStream for CachedSegmentStream {
    async fn yenc_header(&mut self) -> Result<YencHeader> {
        Ok(self.header.clone())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.file.read(buf).await?;
        if n == 0 && !self.done {
            self.done = true;
            self.hooks.fire(TransferOutcome::Retrieved);
        }
        Ok(n)
    }

    fn completion(&mut self) -> &mut CompletionHooks {
        &mut self.hooks
    }
}
