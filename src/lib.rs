#![doc = include_str!("../README.md")]

/// Decoded-article disk cache with request deduplication
pub mod cache;
/// Article client trait and shared streaming types
pub mod client;
mod config;
/// NNTP transport and wire verbs
pub mod connection;
mod error;
/// Multi-provider failover client
pub mod failover;
/// Job model and persistence seam
pub mod jobs;
/// NZB manifest parser
pub mod nzb;
/// PAR2 recovery-index parsing for filename recovery
pub mod par2;
mod pool;
/// Pool-backed provider client
pub mod provider;
/// NZB ingestion queue manager
pub mod queue;
mod response;
/// Interpolation search over segment byte ranges
pub mod search;
mod semaphore;
/// Multi-segment and seekable stream abstractions
pub mod streams;
/// Download concurrency limiting
pub mod throttle;
/// yEnc codec for Usenet binary articles
pub mod yenc;

pub use cache::ArticleCache;
pub use client::{
    ArticleClient, ArticleHeaders, ArticleResponse, BodyResponse, CompletionHooks, DecodedStream,
    SegmentId, TransferOutcome,
};
pub use config::{Config, DuplicatePolicy, ProviderConfig};
pub use connection::NntpConnection;
pub use error::{Error, Result};
pub use failover::{MultiProviderClient, Provider};
pub use jobs::{Job, JobFile, JobStatus, JobStore, MemoryJobStore};
pub use nzb::{Nzb, NzbFile, NzbSegment, parse_nzb};
pub use par2::{FileDescription, PacketHeader, has_par2_magic, read_file_descriptions};
pub use pool::{ConnectionFactory, ConnectionLease, ConnectionPool};
pub use provider::{NntpConnectionFactory, ProviderClient};
pub use queue::QueueManager;
pub use response::{NntpResponse, codes};
pub use search::{ByteRange, SearchResult, interpolation_search};
pub use semaphore::{PrioritizedSemaphore, Priority, PriorityOdds};
pub use streams::{MultiSegmentStream, ReadStream, SeekableFileStream};
pub use throttle::DownloadLimiter;
pub use yenc::{YencDecoder, YencHeader, YencTrailer};

use std::sync::Arc;

/// Compose the standard client chain from configuration: article cache over
/// download limiter over multi-provider failover over per-provider pools.
///
/// Must be called within a tokio runtime — each provider pool spawns its
/// idle sweeper on construction.
pub fn build_streaming_client(config: &Config) -> Arc<dyn ArticleClient> {
    let providers: Vec<Arc<dyn Provider>> = config
        .providers
        .iter()
        .map(|provider| {
            Arc::new(ProviderClient::new(provider.clone(), config.idle_timeout))
                as Arc<dyn Provider>
        })
        .collect();

    Arc::new(ArticleCache::new(
        DownloadLimiter::new(
            MultiProviderClient::new(providers),
            config.max_download_connections,
            PriorityOdds {
                high: config.streaming_priority_odds,
            },
        ),
        config.cache_dir.clone(),
    ))
}
