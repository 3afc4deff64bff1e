//! Stream abstractions over ordered segment lists
//!
//! [`MultiSegmentStream`] turns an ordered list of segment ids into one
//! byte stream, pipelining segment downloads ahead of consumption up to a
//! bounded buffer (0 = fully synchronous). A segment the providers cannot
//! find is served as an empty stream so partial availability degrades to
//! missing bytes instead of a dead file; any other fetch error fails the
//! read.
//!
//! [`SeekableFileStream`] is the logical file: known length, absolute and
//! relative seeking. A non-zero seek resolves the target byte to a segment
//! with interpolation search over lazily fetched yEnc part ranges, opens a
//! multi-segment stream there and discards the partial-segment prefix.

use crate::client::{ArticleClient, DecodedStream, EmptyStream, SegmentId};
use crate::error::{Error, Result};
use crate::search::{ByteRange, interpolation_search};
use crate::semaphore::Priority;
use async_trait::async_trait;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Byte-stream surface shared by the stream abstractions
#[async_trait]
pub trait ReadStream: Send {
    /// Read into `buf`; 0 = end of stream
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

enum SegmentSource {
    /// Producer task pipelines fetches into a bounded channel
    Buffered {
        rx: mpsc::Receiver<Result<Box<dyn DecodedStream>>>,
    },
    /// Each segment is fetched right before it is needed
    Sequential {
        client: Arc<dyn ArticleClient>,
        segment_ids: Vec<SegmentId>,
        next_index: usize,
        priority: Priority,
    },
}

/// Sequential byte stream over an ordered list of segments
pub struct MultiSegmentStream {
    source: SegmentSource,
    current: Option<Box<dyn DecodedStream>>,
    cancel: CancellationToken,
}

impl MultiSegmentStream {
    /// Open a stream over `segment_ids`
    ///
    /// With `buffer > 0` a background task fetches ahead, blocking once
    /// `buffer` unconsumed segment streams are queued (each of which holds
    /// its connection and download slot until read). The task stops when
    /// the stream is dropped or `cancel` fires.
    pub fn new(
        segment_ids: Vec<SegmentId>,
        client: Arc<dyn ArticleClient>,
        priority: Priority,
        buffer: usize,
        cancel: &CancellationToken,
    ) -> Self {
        let cancel = cancel.child_token();

        let source = if buffer == 0 {
            SegmentSource::Sequential {
                client,
                segment_ids,
                next_index: 0,
                priority,
            }
        } else {
            let (tx, rx) = mpsc::channel(buffer);
            let producer_cancel = cancel.clone();
            tokio::spawn(async move {
                for segment in segment_ids {
                    if producer_cancel.is_cancelled() {
                        break;
                    }
                    let item = match client.body(&segment, priority, &producer_cancel).await {
                        Ok(response) => Ok(response.stream),
                        Err(Error::NoSuchArticle(_)) => {
                            warn!(
                                "Article {} not found, skipping and providing empty stream",
                                segment
                            );
                            Ok(Box::new(EmptyStream::new(segment.clone())) as Box<dyn DecodedStream>)
                        }
                        Err(Error::Cancelled) => break,
                        Err(e) => Err(e),
                    };
                    let stop_after = item.is_err();
                    // A failed send drops the queued stream, firing its
                    // completion hooks.
                    if tx.send(item).await.is_err() || stop_after {
                        break;
                    }
                }
            });
            SegmentSource::Buffered { rx }
        };

        Self {
            source,
            current: None,
            cancel,
        }
    }

    /// Read and throw away `count` bytes (partial-segment prefix after a seek)
    pub async fn discard(&mut self, count: u64) -> Result<()> {
        let mut remaining = count;
        let mut scratch = [0u8; 4096];
        while remaining > 0 {
            let want = remaining.min(scratch.len() as u64) as usize;
            let n = self.read(&mut scratch[..want]).await?;
            if n == 0 {
                break;
            }
            remaining -= n as u64;
        }
        Ok(())
    }

    async fn next_stream(&mut self) -> Result<Option<Box<dyn DecodedStream>>> {
        match &mut self.source {
            SegmentSource::Buffered { rx } => match rx.recv().await {
                None => Ok(None),
                Some(Ok(stream)) => Ok(Some(stream)),
                Some(Err(e)) => Err(e),
            },
            SegmentSource::Sequential {
                client,
                segment_ids,
                next_index,
                priority,
            } => loop {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let Some(segment) = segment_ids.get(*next_index) else {
                    return Ok(None);
                };
                *next_index += 1;
                match client.body(segment, *priority, &self.cancel).await {
                    Ok(response) => return Ok(Some(response.stream)),
                    Err(Error::NoSuchArticle(_)) => {
                        warn!("Article {} not found, skipping", segment);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            },
        }
    }
}

#[async_trait]
impl ReadStream for MultiSegmentStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(stream) = self.current.as_mut() {
                let n = stream.read(buf).await?;
                if n > 0 {
                    return Ok(n);
                }
                // Current segment drained; advance.
                self.current = None;
                continue;
            }
            match self.next_stream().await? {
                Some(stream) => self.current = Some(stream),
                None => return Ok(0),
            }
        }
    }
}

impl Drop for MultiSegmentStream {
    fn drop(&mut self) {
        // Stops the producer; queued streams drop with the channel and
        // release their permits through their completion hooks.
        self.cancel.cancel();
    }
}

/// A logical file over segments: known length, seekable, streamable
pub struct SeekableFileStream {
    segment_ids: Arc<Vec<SegmentId>>,
    size: u64,
    client: Arc<dyn ArticleClient>,
    priority: Priority,
    buffer: usize,
    cancel: CancellationToken,
    position: u64,
    inner: Option<MultiSegmentStream>,
}

impl SeekableFileStream {
    /// A file of `size` bytes reconstructed from `segment_ids` in order
    ///
    /// `priority` tags every segment fetch: interactive consumers pass
    /// [`Priority::High`], background scans [`Priority::Low`].
    pub fn new(
        segment_ids: Vec<SegmentId>,
        size: u64,
        client: Arc<dyn ArticleClient>,
        priority: Priority,
        buffer: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            segment_ids: Arc::new(segment_ids),
            size,
            client,
            priority,
            buffer,
            cancel,
            position: 0,
            inner: None,
        }
    }

    /// Declared total size in bytes
    pub fn len(&self) -> u64 {
        self.size
    }

    /// Whether the file is empty
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Current read position
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the read position (`Start` and `Current` origins only)
    ///
    /// The target is clamped to `[0, len]`. Seeking to the current position
    /// keeps the open segment pipeline; anything else tears it down and the
    /// next read reopens at the new offset.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(_) => {
                return Err(Error::Other(
                    "SeekFrom::End is not supported".to_string(),
                ));
            }
        };
        let target = target.clamp(0, self.size as i128) as u64;

        if target == self.position && self.inner.is_some() {
            return Ok(self.position);
        }
        self.position = target;
        self.inner = None;
        Ok(self.position)
    }

    fn multi_stream(&self, first_segment: usize) -> MultiSegmentStream {
        MultiSegmentStream::new(
            self.segment_ids[first_segment..].to_vec(),
            self.client.clone(),
            self.priority,
            self.buffer,
            &self.cancel,
        )
    }

    /// Open the segment pipeline at an absolute byte offset
    ///
    /// Returns an owned future that captures only cloned, `Send` fields (never
    /// `&self`), so the resulting future stays `Send`.
    fn open_at(
        &self,
        offset: u64,
    ) -> impl std::future::Future<Output = Result<MultiSegmentStream>> + Send {
        let client = self.client.clone();
        let segment_ids = self.segment_ids.clone();
        let cancel = self.cancel.clone();
        let size = self.size;
        let priority = self.priority;
        let buffer = self.buffer;

        async move {
            let make_stream = |first_segment: usize| {
                MultiSegmentStream::new(
                    segment_ids[first_segment..].to_vec(),
                    client.clone(),
                    priority,
                    buffer,
                    &cancel,
                )
            };

            if offset == 0 {
                return Ok(make_stream(0));
            }

            let found = interpolation_search(
                offset,
                ByteRange::new(0, segment_ids.len() as u64),
                ByteRange::new(0, size),
                |index| {
                    let client = client.clone();
                    let segment_ids = segment_ids.clone();
                    let cancel = cancel.clone();
                    async move {
                        let header = client
                            .yenc_header(&segment_ids[index as usize], &cancel)
                            .await?;
                        Ok(ByteRange::from_start_and_len(
                            header.part_offset,
                            header.part_size,
                        ))
                    }
                },
                &cancel,
            )
            .await?;

            let mut stream = make_stream(found.index as usize);
            stream.discard(offset - found.range.start).await?;
            Ok(stream)
        }
    }
}

#[async_trait]
impl ReadStream for SeekableFileStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.position >= self.size || buf.is_empty() {
            return Ok(0);
        }

        let mut reopened = false;
        loop {
            if self.inner.is_none() {
                self.inner = Some(self.open_at(self.position).await?);
                reopened = true;
            }
            // inner was just ensured Some.
            #[expect(clippy::expect_used)]
            let stream = self.inner.as_mut().expect("BUG: inner stream missing");
            let n = stream.read(buf).await?;
            if n > 0 {
                self.position += n as u64;
                return Ok(n);
            }

            self.inner = None;
            // A freshly opened pipeline that yields nothing means the
            // remaining segments are gone; report end of stream rather
            // than reopening forever.
            if self.position >= self.size || reopened {
                return Ok(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{
        ArticleHeaders, ArticleResponse, BodyResponse, CompletionHooks, TransferOutcome,
    };
    use crate::yenc::YencHeader;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MemoryStream {
        header: YencHeader,
        data: Vec<u8>,
        pos: usize,
        hooks: CompletionHooks,
    }

    #[async_trait]
    impl DecodedStream for MemoryStream {
        async fn yenc_header(&mut self) -> Result<YencHeader> {
            Ok(self.header.clone())
        }

        async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = (self.data.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            if n == 0 {
                self.hooks.fire(TransferOutcome::Retrieved);
            }
            Ok(n)
        }

        fn completion(&mut self) -> &mut CompletionHooks {
            &mut self.hooks
        }
    }

    /// In-memory article source: one logical file split into fixed segments
    struct SegmentServer {
        segments: HashMap<SegmentId, (YencHeader, Vec<u8>)>,
        header_fetches: AtomicUsize,
    }

    impl SegmentServer {
        /// Split `data` into `segment_size` chunks named seg0@x, seg1@x, ...
        fn build(data: &[u8], segment_size: usize) -> (Arc<Self>, Vec<SegmentId>) {
            let mut segments = HashMap::new();
            let mut ids = Vec::new();
            for (i, chunk) in data.chunks(segment_size).enumerate() {
                let id = SegmentId::from(format!("seg{}@x", i).as_str());
                let header = YencHeader {
                    file_name: "file.bin".to_string(),
                    file_size: data.len() as u64,
                    part: Some(i as u32 + 1),
                    total: None,
                    part_offset: (i * segment_size) as u64,
                    part_size: chunk.len() as u64,
                };
                segments.insert(id.clone(), (header, chunk.to_vec()));
                ids.push(id);
            }
            (
                Arc::new(Self {
                    segments,
                    header_fetches: AtomicUsize::new(0),
                }),
                ids,
            )
        }
    }

    #[async_trait]
    impl ArticleClient for Arc<SegmentServer> {
        async fn stat(&self, segment: &SegmentId, _cancel: &CancellationToken) -> Result<()> {
            self.segments
                .get(segment)
                .map(|_| ())
                .ok_or_else(|| Error::NoSuchArticle(segment.to_string()))
        }

        async fn head(
            &self,
            _segment: &SegmentId,
            _cancel: &CancellationToken,
        ) -> Result<ArticleHeaders> {
            Ok(ArticleHeaders::default())
        }

        async fn date(&self, _cancel: &CancellationToken) -> Result<DateTime<Utc>> {
            Ok(Utc::now())
        }

        async fn body(
            &self,
            segment: &SegmentId,
            _priority: Priority,
            _cancel: &CancellationToken,
        ) -> Result<BodyResponse> {
            let (header, data) = self
                .segments
                .get(segment)
                .ok_or_else(|| Error::NoSuchArticle(segment.to_string()))?;
            Ok(BodyResponse {
                segment: segment.clone(),
                stream: Box::new(MemoryStream {
                    header: header.clone(),
                    data: data.clone(),
                    pos: 0,
                    hooks: CompletionHooks::new(),
                }),
            })
        }

        async fn article(
            &self,
            segment: &SegmentId,
            priority: Priority,
            cancel: &CancellationToken,
        ) -> Result<ArticleResponse> {
            let body = self.body(segment, priority, cancel).await?;
            Ok(ArticleResponse {
                segment: body.segment,
                headers: ArticleHeaders::default(),
                stream: body.stream,
            })
        }

        async fn yenc_header(
            &self,
            segment: &SegmentId,
            _cancel: &CancellationToken,
        ) -> Result<YencHeader> {
            self.header_fetches.fetch_add(1, Ordering::SeqCst);
            self.segments
                .get(segment)
                .map(|(h, _)| h.clone())
                .ok_or_else(|| Error::NoSuchArticle(segment.to_string()))
        }
    }

    async fn read_to_end(stream: &mut dyn ReadStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    fn test_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_multi_segment_concatenates_in_order() {
        let data = test_data(10_000);
        let (server, ids) = SegmentServer::build(&data, 1024);
        let cancel = CancellationToken::new();

        for buffer in [0, 4] {
            let mut stream = MultiSegmentStream::new(
                ids.clone(),
                Arc::new(server.clone()),
                Priority::Low,
                buffer,
                &cancel,
            );
            assert_eq!(read_to_end(&mut stream).await, data);
        }
    }

    #[tokio::test]
    async fn test_missing_segment_is_skipped() {
        let data = test_data(3000);
        let (server, mut ids) = SegmentServer::build(&data, 1000);
        // Insert an id the server does not know about.
        ids.insert(1, SegmentId::from("missing@x"));
        let cancel = CancellationToken::new();

        for buffer in [0, 2] {
            let mut stream = MultiSegmentStream::new(
                ids.clone(),
                Arc::new(server.clone()),
                Priority::Low,
                buffer,
                &cancel,
            );
            // Missing article degrades to absent bytes, not an error.
            assert_eq!(read_to_end(&mut stream).await, data);
        }
    }

    #[tokio::test]
    async fn test_seek_resolves_correct_bytes() {
        let data = test_data(50_000);
        let (server, ids) = SegmentServer::build(&data, 1000);
        let cancel = CancellationToken::new();
        let mut stream = SeekableFileStream::new(
            ids,
            data.len() as u64,
            Arc::new(server),
            Priority::High,
            4,
            cancel,
        );

        for &offset in &[0u64, 1, 999, 1000, 25_500, 49_999] {
            stream.seek(SeekFrom::Start(offset)).unwrap();
            assert_eq!(stream.position(), offset);
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "read at offset {} returned nothing", offset);
            assert_eq!(
                &buf[..n],
                &data[offset as usize..offset as usize + n],
                "bytes at offset {} do not match",
                offset
            );
        }
    }

    #[tokio::test]
    async fn test_seek_does_not_fetch_preceding_segments() {
        let data = test_data(100_000);
        let (server, ids) = SegmentServer::build(&data, 1000);
        let cancel = CancellationToken::new();
        let mut stream = SeekableFileStream::new(
            ids,
            data.len() as u64,
            Arc::new(server.clone()),
            Priority::High,
            0,
            cancel,
        );

        stream.seek(SeekFrom::Start(87_654)).unwrap();
        let mut buf = [0u8; 16];
        stream.read(&mut buf).await.unwrap();

        // Uniform segments: interpolation lands in one probe, far fewer
        // than the 87 preceding segments.
        assert!(server.header_fetches.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_relative_seek_and_clamping() {
        let data = test_data(5000);
        let (server, ids) = SegmentServer::build(&data, 1000);
        let cancel = CancellationToken::new();
        let mut stream = SeekableFileStream::new(
            ids,
            data.len() as u64,
            Arc::new(server),
            Priority::High,
            0,
            cancel,
        );

        stream.seek(SeekFrom::Start(4000)).unwrap();
        stream.seek(SeekFrom::Current(-1500)).unwrap();
        assert_eq!(stream.position(), 2500);

        // Clamp both directions.
        stream.seek(SeekFrom::Current(-99_999)).unwrap();
        assert_eq!(stream.position(), 0);
        stream.seek(SeekFrom::Start(99_999)).unwrap();
        assert_eq!(stream.position(), 5000);

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(stream.seek(SeekFrom::End(0)).is_err());
    }

    #[tokio::test]
    async fn test_read_after_seek_continues_to_end() {
        let data = test_data(10_000);
        let (server, ids) = SegmentServer::build(&data, 1000);
        let cancel = CancellationToken::new();
        let mut stream = SeekableFileStream::new(
            ids,
            data.len() as u64,
            Arc::new(server),
            Priority::High,
            2,
            cancel,
        );

        stream.seek(SeekFrom::Start(5500)).unwrap();
        let tail = read_to_end(&mut stream).await;
        assert_eq!(tail, &data[5500..]);
        assert_eq!(stream.position(), 10_000);
    }
}
