//! Provider and crate configuration

use std::path::PathBuf;
use std::time::Duration;

/// NNTP provider configuration
///
/// Contains all the information needed to connect to one usenet provider.
///
/// # Example
///
/// ```
/// use nzb_streamer::ProviderConfig;
///
/// // Recommended: use the constructor methods
/// let config = ProviderConfig::tls("news.example.com", "user", "pass");
///
/// // Or adjust fields manually
/// let mut config = ProviderConfig::plain("news.example.com", "user", "pass");
/// config.max_connections = 20;
/// ```
#[must_use]
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProviderConfig {
    /// Server hostname (e.g., "news.example.com")
    pub host: String,

    /// Server port (typically 119 for plain, 563 for TLS)
    pub port: u16,

    /// Use TLS/SSL encryption
    #[cfg_attr(feature = "serde", serde(default = "default_tls"))]
    pub tls: bool,

    /// Allow insecure TLS connections (self-signed or expired certificates)
    ///
    /// **Security Warning:** Setting this to `true` disables certificate
    /// validation, making your connection vulnerable to man-in-the-middle
    /// attacks. Only use this for testing or with servers you trust.
    #[cfg_attr(feature = "serde", serde(default))]
    pub allow_insecure_tls: bool,

    /// Username for authentication (empty string disables AUTHINFO)
    pub username: String,

    /// Password for authentication
    pub password: String,

    /// Maximum concurrent connections this provider allows
    #[cfg_attr(feature = "serde", serde(default = "default_max_connections"))]
    pub max_connections: usize,
}

#[cfg(feature = "serde")]
fn default_tls() -> bool {
    true
}

#[cfg(feature = "serde")]
fn default_max_connections() -> usize {
    10
}

impl ProviderConfig {
    /// Create a new provider configuration
    pub fn new(
        host: impl Into<String>,
        port: u16,
        tls: bool,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
            allow_insecure_tls: false,
            username: username.into(),
            password: password.into(),
            max_connections: 10,
        }
    }

    /// Create a configuration for a TLS connection on the standard secure port (563)
    pub fn tls(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, 563, true, username, password)
    }

    /// Create a configuration for a plain connection on the standard port (119)
    ///
    /// **Warning:** Plain connections transmit credentials in clear text.
    pub fn plain(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, 119, false, username, password)
    }

    /// Provider identifier used in logs and ordering (host:port)
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How to treat a manifest that was already submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DuplicatePolicy {
    /// Reject the submission with a duplicate error
    #[default]
    RejectAsFailed,
    /// Accept it under a fresh synthetic hash and a `"name (n)"` suffix
    AllowWithSuffix,
}

/// Crate-level configuration for the streaming stack
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Usenet providers, tried in failover order
    #[cfg_attr(feature = "serde", serde(default))]
    pub providers: Vec<ProviderConfig>,

    /// How long an idle pooled connection may live before the reaper closes it
    #[cfg_attr(feature = "serde", serde(default = "default_idle_timeout", with = "duration_secs"))]
    pub idle_timeout: Duration,

    /// Maximum concurrent BODY/ARTICLE transfers, independent of pool capacity
    #[cfg_attr(feature = "serde", serde(default = "default_download_connections"))]
    pub max_download_connections: usize,

    /// Probability (percent) that a freed download slot goes to a waiting
    /// high-priority request when both priority classes are waiting
    #[cfg_attr(feature = "serde", serde(default = "default_streaming_odds"))]
    pub streaming_priority_odds: u8,

    /// Segments pipelined ahead of consumption per stream (0 = fully synchronous)
    #[cfg_attr(feature = "serde", serde(default = "default_pipeline_buffer"))]
    pub pipeline_buffer: usize,

    /// Only ingest manifest files whose resolved name matches this regex
    #[cfg_attr(feature = "serde", serde(default))]
    pub include_filter: Option<String>,

    /// Drop manifest files whose resolved name matches this regex
    /// (only consulted when `include_filter` is unset)
    #[cfg_attr(feature = "serde", serde(default))]
    pub exclude_filter: Option<String>,

    /// Duplicate manifest handling
    #[cfg_attr(feature = "serde", serde(default))]
    pub duplicate_policy: DuplicatePolicy,

    /// Fail ingestion when no grouped file has a video extension
    #[cfg_attr(feature = "serde", serde(default))]
    pub fail_if_no_video: bool,

    /// Directory for the decoded-article disk cache
    #[cfg_attr(feature = "serde", serde(default = "default_cache_dir"))]
    pub cache_dir: PathBuf,
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_download_connections() -> usize {
    10
}

fn default_streaming_odds() -> u8 {
    80
}

fn default_pipeline_buffer() -> usize {
    40
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache/articles")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            idle_timeout: default_idle_timeout(),
            max_download_connections: default_download_connections(),
            streaming_priority_odds: default_streaming_odds(),
            pipeline_buffer: default_pipeline_buffer(),
            include_filter: None,
            exclude_filter: None,
            duplicate_policy: DuplicatePolicy::default(),
            fail_if_no_video: false,
            cache_dir: default_cache_dir(),
        }
    }
}

#[cfg(feature = "serde")]
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
