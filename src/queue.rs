//! NZB ingestion: probing, health checks, naming, grouping, persistence
//!
//! Turns a submitted manifest into a persisted [`Job`] of logical files:
//! each entry's subject is cleaned into a candidate name, the network is
//! probed for real filenames/sizes, a PAR2 index (when present) recovers
//! authoritative names, multi-part archives merge into single files, and
//! duplicate submissions are rejected or suffixed per policy.

use crate::client::{ArticleClient, SegmentId};
use crate::config::{Config, DuplicatePolicy};
use crate::error::{Error, Result};
use crate::jobs::{Job, JobFile, JobStatus, JobStore};
use crate::nzb::{Nzb, parse_nzb};
use crate::par2::{FileDescription, has_par2_magic, read_file_descriptions};
use crate::semaphore::Priority;
use crate::streams::SeekableFileStream;
use md5::Md5;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Estimated decoded size per segment when a file cannot be probed
const ESTIMATED_SEGMENT_SIZE: u64 = 750 * 1024;

/// Leading bytes captured per file for PAR2 hash matching
const PAR2_HASH_PREFIX: usize = 16 * 1024;

/// Fraction of missing important files above which a batch is unhealthy
const MISSING_IMPORTANT_THRESHOLD: f64 = 0.5;

/// Bounded search for a free `"name (n)"` slot
const MAX_NAME_SUFFIX: u32 = 100;

const VIDEO_EXTENSIONS: &[&str] = &[
    ".webm", ".m4v", ".3gp", ".nsv", ".ty", ".strm", ".rm", ".rmvb", ".m3u", ".ifo", ".mov",
    ".qt", ".divx", ".xvid", ".bivx", ".nrg", ".pva", ".wmv", ".asf", ".asx", ".ogm", ".ogv",
    ".m2v", ".avi", ".bin", ".dat", ".dvr-ms", ".mpg", ".mpeg", ".mp4", ".avc", ".vp3", ".svq3",
    ".nuv", ".viv", ".dv", ".fli", ".flv", ".wpl", ".img", ".iso", ".vob", ".mkv", ".mk3d",
    ".ts", ".wtv", ".m2ts",
];

// Static patterns are literals; a failed compile is a bug, not a runtime
// condition.
#[expect(clippy::expect_used)]
mod patterns {
    use super::*;

    pub(super) static QUOTED: LazyLock<Regex> =
        LazyLock::new(|| Regex::new("\"([^\"]+)\"").expect("BUG: static regex"));
    pub(super) static BRACKET_COUNTER: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\s*\[\d+/\d+\]\s*").expect("BUG: static regex"));
    pub(super) static PAREN_COUNTER: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\s*\(\d+/\d+\)\s*$").expect("BUG: static regex"));
    pub(super) static HEX32: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)^[a-f0-9]{32}$").expect("BUG: static regex"));
    pub(super) static DOTTED_HEX: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)^[a-f0-9.]{40,}$").expect("BUG: static regex"));
    pub(super) static RAR_DIGIT_EXT: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\.r\d+$").expect("BUG: static regex"));
    pub(super) static MKV_PART: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)^(.*\.mkv)\.\d+$").expect("BUG: static regex"));
    pub(super) static RAR_PART: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)^(.*)\.part\d+\.rar$").expect("BUG: static regex"));
}

/// One manifest entry after network probing
struct Candidate {
    subject_name: String,
    segments: Vec<SegmentId>,
    first_16k: Vec<u8>,
    header_name: Option<String>,
    size: u64,
    missing: bool,
}

/// A candidate with its canonical name and authoritative size resolved
struct NamedFile {
    path: String,
    size: u64,
    segments: Vec<SegmentId>,
}

/// Ingests manifests into jobs backed by a [`JobStore`]
pub struct QueueManager {
    client: Arc<dyn ArticleClient>,
    store: Arc<dyn JobStore>,
    config: Config,
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl QueueManager {
    /// Build a manager over the composed client chain and a job store
    ///
    /// # Errors
    ///
    /// Fails when the configured include/exclude filters are not valid
    /// regular expressions.
    pub fn new(
        client: Arc<dyn ArticleClient>,
        store: Arc<dyn JobStore>,
        config: Config,
    ) -> Result<Self> {
        let include = compile_filter(config.include_filter.as_deref())?;
        let exclude = compile_filter(config.exclude_filter.as_deref())?;
        Ok(Self {
            client,
            store,
            config,
            include,
            exclude,
        })
    }

    /// Submit a manifest; returns the job hash
    ///
    /// # Errors
    ///
    /// [`Error::Duplicate`] under the reject policy for a manifest or
    /// (name, category) pair already submitted; [`Error::Unhealthy`] when
    /// the batch fails its health checks; [`Error::InvalidNzb`] for
    /// unparseable manifests.
    pub async fn add_nzb(
        &self,
        bytes: &[u8],
        file_name: &str,
        category: Option<&str>,
        priority: i32,
        cancel: &CancellationToken,
    ) -> Result<String> {
        info!("Adding NZB file: {}", file_name);

        let mut hash = hex(&Sha256::digest(bytes));
        if self.store.get_by_hash(&hash).await?.is_some() {
            match self.config.duplicate_policy {
                DuplicatePolicy::RejectAsFailed => {
                    return Err(Error::Duplicate(format!(
                        "this NZB has already been added (hash: {})",
                        hash
                    )));
                }
                DuplicatePolicy::AllowWithSuffix => {
                    // A synthetic hash lets the same manifest bytes exist
                    // twice; content-hash identity is given up for this job.
                    hash = Uuid::new_v4().simple().to_string();
                    info!("NZB already known by hash; re-adding as {}", hash);
                }
            }
        }

        let text = String::from_utf8_lossy(bytes).into_owned();
        let manifest = parse_nzb(&text)?;
        let (parsed_name, files) = self.assemble_files(&manifest, cancel).await?;

        if files.is_empty() {
            return Err(Error::Unhealthy(
                "no valid files found in NZB after applying include/exclude filters".to_string(),
            ));
        }

        let base_name = parsed_name.unwrap_or_else(|| file_stem(file_name).to_string());
        let final_name = self
            .resolve_job_name(&base_name, category)
            .await?;

        let total_size = files.iter().map(|f| f.size).sum();
        let now = chrono::Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            hash: hash.clone(),
            name: final_name,
            nzb_file_name: file_name.to_string(),
            nzb_contents: text,
            category: category.map(str::to_string),
            priority,
            added: now,
            completed: Some(now),
            status: JobStatus::Finished,
            total_size,
            files,
        };
        info!(
            "Saved usenet job {} with {} file(s), total size {}",
            job.name,
            job.files.len(),
            job.total_size
        );
        self.store.insert(job).await?;

        Ok(hash)
    }

    /// All jobs
    pub async fn jobs(&self) -> Result<Vec<Job>> {
        self.store.list().await
    }

    /// Job by identifier
    pub async fn job(&self, id: Uuid) -> Result<Option<Job>> {
        self.store.get(id).await
    }

    /// Job by hash
    pub async fn job_by_hash(&self, hash: &str) -> Result<Option<Job>> {
        self.store.get_by_hash(hash).await
    }

    /// Delete a job by hash; true when one was removed
    pub async fn delete_job(&self, hash: &str) -> Result<bool> {
        match self.store.get_by_hash(hash).await? {
            Some(job) => Ok(self.store.delete(job.id).await?.is_some()),
            None => Ok(false),
        }
    }

    /// Delete every job
    pub async fn delete_all_jobs(&self) -> Result<()> {
        self.store.delete_all().await
    }

    /// Open a job file as a seekable stream at interactive priority
    pub fn open_file(&self, file: &JobFile, cancel: CancellationToken) -> SeekableFileStream {
        SeekableFileStream::new(
            file.segment_ids.clone(),
            file.size,
            self.client.clone(),
            Priority::High,
            self.config.pipeline_buffer,
            cancel,
        )
    }

    /// Free `"name (n)"` slot under the suffix policy, or the name itself
    async fn resolve_job_name(&self, base_name: &str, category: Option<&str>) -> Result<String> {
        if self.store.get_by_name(base_name, category).await?.is_none() {
            return Ok(base_name.to_string());
        }
        match self.config.duplicate_policy {
            DuplicatePolicy::RejectAsFailed => Err(Error::Duplicate(format!(
                "a job named '{}' already exists in category '{}'",
                base_name,
                category.unwrap_or("none")
            ))),
            DuplicatePolicy::AllowWithSuffix => {
                for i in 2..MAX_NAME_SUFFIX {
                    let candidate = format!("{} ({})", base_name, i);
                    if self.store.get_by_name(&candidate, category).await?.is_none() {
                        return Ok(candidate);
                    }
                }
                Err(Error::Duplicate(format!(
                    "no free name slot for '{}'",
                    base_name
                )))
            }
        }
    }

    /// Probe, health-check, name and group a manifest's files
    async fn assemble_files(
        &self,
        manifest: &Nzb,
        cancel: &CancellationToken,
    ) -> Result<(Option<String>, Vec<JobFile>)> {
        let mut candidates = Vec::with_capacity(manifest.files.len());
        for file in &manifest.files {
            let subject_name = clean_subject(&file.subject);
            let segments = file.segment_ids();
            let candidate = match self.probe_file(&segments, cancel).await {
                Ok((first_16k, header_name, size)) => Candidate {
                    subject_name,
                    segments,
                    first_16k,
                    header_name,
                    size,
                    missing: false,
                },
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(Error::NoSuchArticle(_)) => Candidate {
                    size: segments.len() as u64 * ESTIMATED_SEGMENT_SIZE,
                    subject_name,
                    segments,
                    first_16k: Vec::new(),
                    header_name: None,
                    missing: true,
                },
                Err(e) => {
                    warn!("Could not fetch metadata for {}: {}", subject_name, e);
                    Candidate {
                        size: segments.len() as u64 * ESTIMATED_SEGMENT_SIZE,
                        subject_name,
                        segments,
                        first_16k: Vec::new(),
                        header_name: None,
                        missing: false,
                    }
                }
            };
            candidates.push(candidate);
        }

        self.check_health(&candidates)?;

        let descriptions = self.read_par2_index(&candidates, cancel).await;
        let by_16k_hash: HashMap<[u8; 16], &FileDescription> =
            descriptions.iter().map(|d| (d.hash_16k, d)).collect();

        let named: Vec<NamedFile> = candidates
            .iter()
            .map(|c| self.resolve_name(c, &by_16k_hash))
            .collect();

        let grouped = self.group_files(&named);

        if self.config.fail_if_no_video && !grouped.iter().any(|f| is_video_file(&f.path)) {
            return Err(Error::Unhealthy("no video files found in NZB".to_string()));
        }

        let meta_title = manifest.title().map(str::to_string);
        let mut job_name = grouped
            .first()
            .map(|f| f.path.as_str())
            .filter(|path| !is_probably_obfuscated(path))
            .map(|path| file_stem(path).to_string());
        if job_name.is_none()
            && let Some(title) = &meta_title
            && !is_probably_obfuscated(title)
        {
            job_name = Some(title.clone());
        }

        Ok((job_name.or(meta_title), grouped))
    }

    /// First article's leading 16 KiB + yEnc name, and the declared total
    /// size from the last segment's part range
    async fn probe_file(
        &self,
        segments: &[SegmentId],
        cancel: &CancellationToken,
    ) -> Result<(Vec<u8>, Option<String>, u64)> {
        let first = segments
            .first()
            .ok_or_else(|| Error::InvalidNzb("file without segments".to_string()))?;

        let mut response = self.client.article(first, Priority::Low, cancel).await?;
        let header_name = response
            .stream
            .yenc_header()
            .await
            .ok()
            .map(|h| h.file_name);

        let mut first_16k = vec![0u8; PAR2_HASH_PREFIX];
        let mut filled = 0;
        while filled < first_16k.len() {
            let n = response.stream.read(&mut first_16k[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        first_16k.truncate(filled);
        drop(response);

        // The last part's end offset is the file's declared size.
        let last = segments
            .last()
            .ok_or_else(|| Error::InvalidNzb("file without segments".to_string()))?;
        let last_header = self.client.yenc_header(last, cancel).await?;
        Ok((first_16k, header_name, last_header.part_end()))
    }

    /// Fail the batch when too many important files are unreachable
    fn check_health(&self, candidates: &[Candidate]) -> Result<()> {
        let important: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| {
                is_important_file(&c.subject_name)
                    || c.header_name.as_deref().is_some_and(is_important_file)
            })
            .collect();
        if important.is_empty() {
            return Ok(());
        }

        let missing = important.iter().filter(|c| c.missing).count();
        let fraction = missing as f64 / important.len() as f64;
        if fraction > MISSING_IMPORTANT_THRESHOLD {
            return Err(Error::Unhealthy(format!(
                "health check failed: {}/{} important files ({:.0}%) are missing from the provider",
                missing,
                important.len(),
                fraction * 100.0
            )));
        }
        Ok(())
    }

    /// The PAR2 index is the smallest non-missing candidate whose leading
    /// bytes carry the packet magic; its file descriptions map 16 KiB
    /// hashes to true filenames.
    async fn read_par2_index(
        &self,
        candidates: &[Candidate],
        cancel: &CancellationToken,
    ) -> Vec<FileDescription> {
        let Some(index) = candidates
            .iter()
            .filter(|c| !c.missing && has_par2_magic(&c.first_16k))
            .min_by_key(|c| c.segments.len())
        else {
            return Vec::new();
        };

        info!(
            "Found PAR2 index file: {}. Probing for real filenames...",
            index.subject_name
        );
        let mut stream = SeekableFileStream::new(
            index.segments.clone(),
            index.size,
            self.client.clone(),
            Priority::Low,
            self.config.pipeline_buffer,
            cancel.child_token(),
        );
        match read_file_descriptions(&mut stream, cancel).await {
            Ok(descriptions) => descriptions,
            Err(e) => {
                warn!("Error probing PAR2 index: {}", e);
                Vec::new()
            }
        }
    }

    /// Score the three name sources and pick the canonical one
    fn resolve_name(
        &self,
        candidate: &Candidate,
        by_16k_hash: &HashMap<[u8; 16], &FileDescription>,
    ) -> NamedFile {
        let (par2_name, par2_size) = if candidate.first_16k.len() >= PAR2_HASH_PREFIX {
            let digest: [u8; 16] = Md5::digest(&candidate.first_16k).into();
            match by_16k_hash.get(&digest) {
                Some(desc) => (Some(desc.file_name.clone()), Some(desc.length)),
                None => (None, None),
            }
        } else {
            (None, None)
        };

        let scored = [
            (par2_name.as_deref(), 30),
            (Some(candidate.subject_name.as_str()), 20),
            (candidate.header_name.as_deref(), 10),
        ];
        let best = scored
            .iter()
            .filter_map(|(name, base)| name.map(|n| (n, filename_priority(n, *base))))
            .max_by_key(|(_, priority)| *priority)
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| candidate.subject_name.clone());

        NamedFile {
            path: best,
            size: par2_size.unwrap_or(candidate.size),
            segments: candidate.segments.clone(),
        }
    }

    /// Merge multi-part archives and keep standalone important files
    fn group_files(&self, named: &[NamedFile]) -> Vec<JobFile> {
        let mut grouped = Vec::new();
        let mut processed: HashSet<String> = HashSet::new();

        for file in named {
            if processed.contains(&file.path) {
                continue;
            }
            if !self.should_include(&file.path) {
                debug!("Skipping {} due to include/exclude filters", file.path);
                continue;
            }

            if let Some(caps) = patterns::MKV_PART.captures(&file.path) {
                // movie.mkv.1, movie.mkv.2, ... merge into movie.mkv
                let base = caps[1].to_string();
                if processed.contains(&base) {
                    continue;
                }
                grouped.push(merge_parts(named, &base, &base, &mut processed));
            } else if let Some(caps) = patterns::RAR_PART.captures(&file.path) {
                // movie.part01.rar, movie.part02.rar, ... merge into movie.rar
                let base = format!("{}.rar", &caps[1]);
                let prefix = format!("{}.part", &caps[1]);
                if processed.contains(&base) {
                    continue;
                }
                grouped.push(merge_parts(named, &base, &prefix, &mut processed));
            } else if extension(&file.path) == ".rar" {
                // A lone .rar absorbs .r00/.r01 companions sharing its stem.
                let prefix = file_stem(&file.path).to_string();
                grouped.push(merge_parts(named, &file.path, &prefix, &mut processed));
            } else if is_important_file(&file.path) {
                grouped.push(JobFile {
                    id: Uuid::new_v4(),
                    path: file.path.clone(),
                    size: file.size,
                    segment_ids: file.segments.clone(),
                });
                processed.insert(file.path.clone());
            }
            // Everything else (nfo, par2 volumes, samples) is dropped.
        }

        grouped
    }

    fn should_include(&self, path: &str) -> bool {
        if let Some(include) = &self.include {
            return include.is_match(path);
        }
        if let Some(exclude) = &self.exclude {
            return !exclude.is_match(path);
        }
        true
    }
}

/// Collect every named file sharing `prefix` into one logical file
fn merge_parts(
    named: &[NamedFile],
    base: &str,
    prefix: &str,
    processed: &mut HashSet<String>,
) -> JobFile {
    let prefix_lower = prefix.to_lowercase();
    let parts: Vec<&NamedFile> = named
        .iter()
        .filter(|f| f.path.to_lowercase().starts_with(&prefix_lower))
        .collect();

    for part in &parts {
        processed.insert(part.path.clone());
    }
    processed.insert(base.to_string());

    JobFile {
        id: Uuid::new_v4(),
        path: base.to_string(),
        size: parts.iter().map(|p| p.size).sum(),
        segment_ids: parts
            .iter()
            .flat_map(|p| p.segments.iter().cloned())
            .collect(),
    }
}

fn compile_filter(pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern.filter(|p| !p.trim().is_empty()) {
        Some(p) => {
            let regex = Regex::new(&format!("(?i){}", p))
                .map_err(|e| Error::Other(format!("invalid filename filter '{}': {}", p, e)))?;
            Ok(Some(regex))
        }
        None => Ok(None),
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Last path component
fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Basename without its extension
fn file_stem(path: &str) -> &str {
    let name = basename(path);
    match name.rfind('.') {
        Some(0) | None => name,
        Some(i) => &name[..i],
    }
}

/// Lowercased extension including the leading dot ("" when absent)
fn extension(path: &str) -> String {
    let name = basename(path);
    match name.rfind('.') {
        Some(i) if i + 1 < name.len() => name[i..].to_lowercase(),
        _ => String::new(),
    }
}

fn is_video_file(path: &str) -> bool {
    VIDEO_EXTENSIONS.contains(&extension(path).as_str())
}

/// Files that decide batch health: video plus rar volumes
fn is_important_file(path: &str) -> bool {
    let ext = extension(path);
    if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        return true;
    }
    ext == ".rar" || patterns::RAR_DIGIT_EXT.is_match(&ext)
}

/// Candidate filename from a subject line: a quoted substring wins, else
/// `[n/m]` and trailing `(n/m)` counters are stripped
fn clean_subject(subject: &str) -> String {
    if let Some(caps) = patterns::QUOTED.captures(subject) {
        return caps[1].to_string();
    }
    let cleaned = patterns::BRACKET_COUNTER.replace_all(subject, " ");
    let cleaned = patterns::PAREN_COUNTER.replace(&cleaned, "");
    cleaned.trim().to_string()
}

/// Obfuscation heuristics: 32-hex stems, long dotted-hex stems, and long
/// separator-free stems
fn is_probably_obfuscated(file_name: &str) -> bool {
    let stem = file_stem(file_name);
    if patterns::HEX32.is_match(stem) || patterns::DOTTED_HEX.is_match(stem) {
        return true;
    }
    stem.len() > 20 && !stem.contains(' ') && !stem.contains('.') && !stem.contains('_')
}

/// Score a name source: obfuscation is heavily penalized, recognizable
/// media extensions boosted
fn filename_priority(file_name: &str, base: i32) -> i32 {
    if file_name.trim().is_empty() {
        return -10_000;
    }
    let mut priority = base;
    if is_probably_obfuscated(file_name) {
        priority -= 1000;
    }
    let ext = extension(file_name);
    if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        priority += 50;
    }
    if ext == ".rar" || patterns::RAR_DIGIT_EXT.is_match(&ext) {
        priority += 40;
    }
    if (2..=5).contains(&ext.len()) {
        priority += 10;
    }
    priority
}
