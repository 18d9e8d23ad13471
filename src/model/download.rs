//! Artifact fetching and download progress.
//!
//! The fetcher is the slow, cancellable part of [`ModelLifecycleManager::download`]
//! (crate::ModelLifecycleManager::download). Fetchers report bytes through a
//! shared [`DownloadProgress`]; the manager turns that into the UI-facing
//! progress value with a [`ProgressEstimator`].

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::ModelDescriptor;
use crate::telemetry;
use crate::{LabelGuardError, Result};

/// Default mirror serving `<repo>/resolve/main/<file>` URLs.
pub const DEFAULT_MIRROR_URL: &str = "https://huggingface.co";

/// Byte counters shared between a fetcher and the progress estimator.
#[derive(Debug, Default)]
pub struct DownloadProgress {
    downloaded: AtomicU64,
    total: AtomicU64,
    current_file: Mutex<String>,
}

impl DownloadProgress {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total: AtomicU64::new(total_bytes),
            ..Self::default()
        }
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Take back bytes counted by an attempt that was abandoned.
    pub fn retract_downloaded(&self, bytes: u64) {
        // The closure always returns `Some`.
        let _ = self
            .downloaded
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| {
                Some(d.saturating_sub(bytes))
            });
    }

    pub fn set_total(&self, bytes: u64) {
        self.total.store(bytes, Ordering::SeqCst);
    }

    pub fn set_current_file(&self, name: &str) {
        if let Ok(mut current) = self.current_file.lock() {
            *current = name.to_string();
        }
    }

    /// File the fetcher is currently transferring.
    pub fn current_file(&self) -> String {
        self.current_file
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// Fraction of bytes fetched, if the total is known.
    pub fn fraction(&self) -> Option<f64> {
        let total = self.total.load(Ordering::SeqCst);
        if total == 0 {
            return None;
        }
        Some((self.downloaded_bytes() as f64 / total as f64).min(1.0))
    }
}

/// Monotone UI progress that creeps toward a ceiling until the fetch settles.
///
/// Each tick eases the value toward the ceiling and then raises it to the
/// real byte fraction (scaled into `0..=ceiling`) if that is ahead. The
/// value never decreases and never passes the ceiling; only a completed
/// fetch reports 1.0.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    value: f64,
    ceiling: f64,
    rate: f64,
}

impl ProgressEstimator {
    /// Fraction of the remaining distance covered per tick.
    pub const DEFAULT_RATE: f64 = 0.02;

    pub fn new(ceiling: f64) -> Self {
        Self {
            value: 0.0,
            ceiling: ceiling.clamp(0.0, 1.0),
            rate: Self::DEFAULT_RATE,
        }
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Advance one tick, folding in the real byte fraction if known.
    pub fn tick(&mut self, real_fraction: Option<f64>) -> f64 {
        let eased = self.value + (self.ceiling - self.value) * self.rate;
        let real = real_fraction.map(|f| f.clamp(0.0, 1.0) * self.ceiling).unwrap_or(0.0);
        self.value = eased.max(real).min(self.ceiling).max(self.value);
        self.value
    }
}

/// Fetches a model's artifact files into a directory.
///
/// Implementations must poll `cancel` between units of work and return
/// [`LabelGuardError::DownloadCancelled`] promptly once it fires.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Fetcher name for logging.
    fn name(&self) -> &str;

    /// Fetch every artifact file of `descriptor` into `dest`.
    async fn fetch(
        &self,
        descriptor: &ModelDescriptor,
        dest: &Path,
        progress: &DownloadProgress,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;
}

/// HTTP mirror fetcher: streams `<base>/<repo>/resolve/main/<file>` to disk.
pub struct MirrorFetcher {
    client: reqwest::Client,
    base_url: String,
    max_attempts: u32,
    initial_delay: Duration,
}

impl MirrorFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
        }
    }

    /// Build with a request timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LabelGuardError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            ..Self::new(base_url)
        })
    }

    /// Attempts per file, including the first. Minimum 1.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Base delay before the first retry (doubles per attempt).
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    fn file_url(&self, repo: &str, file: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.base_url, repo, file)
    }

    /// Download one file with retry on transient errors.
    async fn fetch_file(
        &self,
        url: &str,
        target: &Path,
        progress: &DownloadProgress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.fetch_file_once(url, target, progress, cancel).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.initial_delay.saturating_mul(2u32.saturating_pow(attempt));
                    warn!(
                        url,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying artifact file after transient error"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(LabelGuardError::DownloadCancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_file_once(
        &self,
        url: &str,
        target: &Path,
        progress: &DownloadProgress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LabelGuardError::DownloadCancelled),
            response = self.client.get(url).send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(LabelGuardError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let part = target.with_extension(part_extension(target));
        let mut file = tokio::fs::File::create(&part).await?;
        let mut written = 0u64;
        let outcome = write_body(response, &mut file, progress, cancel, &mut written).await;
        drop(file);

        match outcome {
            Ok(()) => {
                tokio::fs::rename(&part, target).await?;
                metrics::counter!(telemetry::DOWNLOAD_BYTES_TOTAL).increment(written);
                debug!(path = %target.display(), bytes = written, "artifact file written");
                Ok(())
            }
            Err(e) => {
                progress.retract_downloaded(written);
                if let Err(remove_err) = tokio::fs::remove_file(&part).await {
                    debug!(path = %part.display(), error = %remove_err, "no partial file to remove");
                }
                Err(e)
            }
        }
    }
}

/// Stream a response body into `file`, counting bytes into `written` and
/// `progress` as they land.
async fn write_body(
    response: reqwest::Response,
    file: &mut tokio::fs::File,
    progress: &DownloadProgress,
    cancel: &CancellationToken,
    written: &mut u64,
) -> Result<()> {
    let mut body = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LabelGuardError::DownloadCancelled),
            chunk = body.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        *written += chunk.len() as u64;
        progress.add_downloaded(chunk.len() as u64);
    }
    file.flush().await?;
    Ok(())
}

impl Default for MirrorFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_MIRROR_URL)
    }
}

/// `model.safetensors` -> `safetensors.part`, `tokenizer` -> `part`.
fn part_extension(target: &Path) -> String {
    match target.extension() {
        Some(ext) => format!("{}.part", ext.to_string_lossy()),
        None => "part".to_string(),
    }
}

#[async_trait]
impl ArtifactFetcher for MirrorFetcher {
    fn name(&self) -> &str {
        "mirror"
    }

    async fn fetch(
        &self,
        descriptor: &ModelDescriptor,
        dest: &Path,
        progress: &DownloadProgress,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest).await?;
        info!(
            model_id = %descriptor.id,
            repo = %descriptor.repo,
            dest = %dest.display(),
            files = descriptor.files.len(),
            "fetching artifact from mirror"
        );

        for file in &descriptor.files {
            if cancel.is_cancelled() {
                return Err(LabelGuardError::DownloadCancelled);
            }

            let target = dest.join(file);
            if let Ok(meta) = tokio::fs::metadata(&target).await {
                debug!(file = %file, "artifact file already present, skipping");
                progress.add_downloaded(meta.len());
                continue;
            }
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            progress.set_current_file(file);
            let url = self.file_url(&descriptor.repo, file);
            self.fetch_file(&url, &target, progress, cancel).await?;
        }

        Ok(dest.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimator_is_monotone_and_capped() {
        let mut estimator = ProgressEstimator::new(0.9).with_rate(0.5);
        let mut last = 0.0;
        for _ in 0..100 {
            let v = estimator.tick(None);
            assert!(v >= last);
            assert!(v <= 0.9);
            last = v;
        }
        assert!(last > 0.89);
    }

    #[test]
    fn estimator_follows_real_progress_but_never_passes_ceiling() {
        let mut estimator = ProgressEstimator::new(0.9);
        assert!((estimator.tick(Some(0.5)) - 0.45).abs() < 1e-9);
        assert_eq!(estimator.tick(Some(1.0)), 0.9);
        // Real progress going backwards does not lower the value.
        assert_eq!(estimator.tick(Some(0.1)), 0.9);
    }

    #[test]
    fn progress_fraction() {
        let progress = DownloadProgress::new(0);
        assert_eq!(progress.fraction(), None);
        progress.set_total(200);
        progress.add_downloaded(50);
        assert_eq!(progress.fraction(), Some(0.25));
        progress.add_downloaded(500);
        assert_eq!(progress.fraction(), Some(1.0));
    }

    #[test]
    fn retracted_bytes_never_underflow() {
        let progress = DownloadProgress::new(100);
        progress.add_downloaded(30);
        progress.retract_downloaded(20);
        assert_eq!(progress.downloaded_bytes(), 10);
        progress.retract_downloaded(50);
        assert_eq!(progress.downloaded_bytes(), 0);
    }

    #[test]
    fn part_file_names() {
        assert_eq!(part_extension(Path::new("a/model.safetensors")), "safetensors.part");
        assert_eq!(part_extension(Path::new("a/LICENSE")), "part");
    }

    #[test]
    fn mirror_urls() {
        let fetcher = MirrorFetcher::new("https://mirror.example/");
        assert_eq!(
            fetcher.file_url("org/model", "config.json"),
            "https://mirror.example/org/model/resolve/main/config.json"
        );
    }
}
