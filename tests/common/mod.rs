//! Shared fakes for integration tests: an in-memory article server that
//! answers the [`ArticleClient`] surface from posted fixture files.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nzb_streamer::{
    ArticleClient, ArticleHeaders, ArticleResponse, BodyResponse, CompletionHooks, DecodedStream,
    Error, Priority, Provider, Result, SegmentId, TransferOutcome, YencHeader,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// In-memory decoded article stream
pub struct MemoryStream {
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

/// Fake article source holding posted files segment by segment
#[derive(Default)]
pub struct FakeServer {
    pub id: String,
    segments: Mutex<HashMap<SegmentId, (YencHeader, Vec<u8>)>>,
    pub body_calls: AtomicUsize,
    pub available: usize,
}

impl FakeServer {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            available: 10,
            ..Default::default()
        }
    }

    /// Post `data` as `name`, split into `segment_size` parts with ids
    /// `<prefix>.<n>@test`; returns the segment ids in order.
    pub fn post_file(
        &self,
        name: &str,
        data: &[u8],
        segment_size: usize,
        id_prefix: &str,
    ) -> Vec<SegmentId> {
        let mut ids = Vec::new();
        let mut segments = self.segments.lock().unwrap();
        let chunks: Vec<&[u8]> = data.chunks(segment_size).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let id = SegmentId::from(format!("{}.{}@test", id_prefix, i + 1).as_str());
            let header = YencHeader {
                file_name: name.to_string(),
                file_size: data.len() as u64,
                part: Some(i as u32 + 1),
                total: Some(chunks.len() as u32),
                part_offset: (i * segment_size) as u64,
                part_size: chunk.len() as u64,
            };
            segments.insert(id.clone(), (header, chunk.to_vec()));
            ids.push(id);
        }
        ids
    }

    /// Forget a posted segment so it reads as missing
    pub fn remove_segment(&self, id: &SegmentId) {
        self.segments.lock().unwrap().remove(id);
    }

    fn lookup(&self, segment: &SegmentId) -> Result<(YencHeader, Vec<u8>)> {
        self.segments
            .lock()
            .unwrap()
            .get(segment)
            .cloned()
            .ok_or_else(|| Error::NoSuchArticle(segment.to_string()))
    }
}

#[async_trait]
impl ArticleClient for FakeServer {
    async fn stat(&self, segment: &SegmentId, _cancel: &CancellationToken) -> Result<()> {
        self.lookup(segment).map(|_| ())
    }

    async fn head(
        &self,
        segment: &SegmentId,
        _cancel: &CancellationToken,
    ) -> Result<ArticleHeaders> {
        self.lookup(segment)?;
        Ok(ArticleHeaders::from_lines(vec![format!(
            "Message-ID: <{}>",
            segment
        )]))
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
        self.body_calls.fetch_add(1, Ordering::SeqCst);
        let (header, data) = self.lookup(segment)?;
        Ok(BodyResponse {
            segment: segment.clone(),
            stream: Box::new(MemoryStream {
                header,
                data,
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
        let headers = self.head(segment, cancel).await?;
        let body = self.body(segment, priority, cancel).await?;
        Ok(ArticleResponse {
            segment: body.segment,
            headers,
            stream: body.stream,
        })
    }
}

impl Provider for FakeServer {
    fn id(&self) -> &str {
        &self.id
    }

    fn available_connections(&self) -> usize {
        self.available
    }
}

/// Render an NZB manifest for the given (subject, segment ids) entries
pub fn nzb_xml(title: Option<&str>, files: &[(&str, &[SegmentId])]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<nzb xmlns=\"http://www.newzbin.com/DTD/2003/nzb\">\n");
    if let Some(title) = title {
        xml.push_str(&format!(
            "  <head><meta type=\"title\">{}</meta></head>\n",
            title
        ));
    }
    for (subject, ids) in files {
        xml.push_str(&format!(
            "  <file poster=\"tester@test\" date=\"1700000000\" subject=\"{}\">\n",
            subject.replace('"', "&quot;")
        ));
        xml.push_str("    <groups><group>alt.binaries.test</group></groups>\n    <segments>\n");
        for (i, id) in ids.iter().enumerate() {
            xml.push_str(&format!(
                "      <segment bytes=\"750000\" number=\"{}\">{}</segment>\n",
                i + 1,
                id
            ));
        }
        xml.push_str("    </segments>\n  </file>\n");
    }
    xml.push_str("</nzb>\n");
    xml
}

/// Deterministic pseudo-random payload
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u64 * 31 + seed as u64 * 17).wrapping_rem(251) as u8)
        .collect()
}
