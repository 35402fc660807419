//! Two-tier image cache: a bounded in-memory LRU in front of a disk mirror.
//!
//! `get` is synchronous and never touches the network. `load`/`resolve` fall
//! through memory, disk and finally the [`ImageFetcher`]; their disk reads run
//! on the blocking pool. Oversized payloads,
//! decode failures and disk write failures are soft misses: they are logged
//! and reported as `None`, never as errors.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use futures::stream::{self, Stream};
use image::DynamicImage;
use lru::LruCache;
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{ImageFetcher, ValidatedUrl};
use crate::image_processing::{
    decode_image, decoded_size, encode_within_budget, ImageProcessingError, ImageProcessor,
    ProcessingConfig, QualityLadder,
};
use crate::model::UnixTimeMs;
use crate::task_queue::{TaskError, TaskPriority, TaskQueue};

const DISK_EXTENSION: &str = "jpg";
const TMP_EXTENSION: &str = "tmp";

#[derive(Debug, Error)]
pub enum ImageCacheError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid cache config: {0}")]
    Config(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCacheConfig {
    pub disk_dir: PathBuf,
    pub memory_max_entries: usize,
    pub memory_max_bytes: usize,
    /// Ceiling for a single file on disk, enforced on write and on read-back.
    pub disk_max_file_bytes: usize,
    pub max_download_bytes: usize,
    pub max_dimension: u32,
    pub initial_quality: u8,
    pub quality_step: u8,
    pub quality_attempts: u8,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            disk_dir: std::env::temp_dir().join("taskchat-image-cache"),
            memory_max_entries: 100,
            memory_max_bytes: 100 * 1024 * 1024,
            disk_max_file_bytes: 5 * 1024 * 1024,
            max_download_bytes: 10 * 1024 * 1024,
            max_dimension: 1920,
            initial_quality: 90,
            quality_step: 15,
            quality_attempts: 5,
        }
    }
}

impl ImageCacheConfig {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            disk_dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ImageCacheError> {
        if self.memory_max_entries == 0 {
            return Err(ImageCacheError::Config("memory_max_entries must be > 0".into()));
        }
        if self.memory_max_bytes == 0 {
            return Err(ImageCacheError::Config("memory_max_bytes must be > 0".into()));
        }
        if self.disk_max_file_bytes == 0 {
            return Err(ImageCacheError::Config("disk_max_file_bytes must be > 0".into()));
        }
        if self.max_dimension == 0 {
            return Err(ImageCacheError::Config("max_dimension must be > 0".into()));
        }
        if self.initial_quality == 0 || self.initial_quality > 100 {
            return Err(ImageCacheError::Config(
                "initial_quality must be within 1..=100".into(),
            ));
        }
        if self.quality_attempts == 0 {
            return Err(ImageCacheError::Config("quality_attempts must be > 0".into()));
        }
        Ok(())
    }

    pub fn quality_ladder(&self) -> QualityLadder {
        QualityLadder {
            initial: self.initial_quality,
            step: self.quality_step,
            attempts: self.quality_attempts,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: String,
    pub image: Arc<DynamicImage>,
    pub size_bytes: usize,
    pub stored_at: UnixTimeMs,
}

struct MemoryTier {
    entries: LruCache<String, CacheEntry>,
    total_bytes: usize,
    max_entries: usize,
    max_bytes: usize,
}

impl MemoryTier {
    fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_bytes: 0,
            max_entries,
            max_bytes,
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<DynamicImage>> {
        self.entries.get(key).map(|entry| entry.image.clone())
    }

    /// Inserts and evicts least-recently-used entries until both budgets hold.
    fn insert(&mut self, entry: CacheEntry) -> usize {
        self.remove(&entry.key);
        if entry.size_bytes > self.max_bytes {
            debug!(key = %entry.key, size = entry.size_bytes, "image larger than memory budget, not kept in memory");
            return 0;
        }

        self.total_bytes += entry.size_bytes;
        self.entries.put(entry.key.clone(), entry);

        let mut evicted = 0;
        while self.entries.len() > self.max_entries || self.total_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, old)) => {
                    self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some(old) => {
                self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }
}

#[derive(Debug, Default)]
pub struct ImageCacheMetrics {
    pub memory_hits: AtomicU64,
    pub disk_hits: AtomicU64,
    pub network_fetches: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub disk_writes: AtomicU64,
    pub disk_writes_skipped: AtomicU64,
    pub corrupt_files_removed: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageCacheStats {
    pub memory_entries: usize,
    pub memory_bytes: usize,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub network_fetches: u64,
    pub misses: u64,
    pub evictions: u64,
    pub disk_writes: u64,
    pub disk_writes_skipped: u64,
    pub corrupt_files_removed: u64,
}

struct CacheInner {
    config: ImageCacheConfig,
    processing: ProcessingConfig,
    memory: Mutex<MemoryTier>,
    fetcher: Arc<dyn ImageFetcher>,
    processor: ImageProcessor,
    writes: TaskQueue,
    metrics: ImageCacheMetrics,
}

/// Cheap to clone; clones share both tiers.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<CacheInner>,
}

impl ImageCache {
    pub fn new(
        config: ImageCacheConfig,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Result<Self, ImageCacheError> {
        config.validate()?;
        fs::create_dir_all(&config.disk_dir)?;

        let processing = ProcessingConfig {
            max_input_bytes: config.max_download_bytes,
            output_max_dimension: config.max_dimension,
            ..ProcessingConfig::default()
        };

        info!(dir = %config.disk_dir.display(), "image cache initialized");

        Ok(Self {
            inner: Arc::new(CacheInner {
                memory: Mutex::new(MemoryTier::new(
                    config.memory_max_entries,
                    config.memory_max_bytes,
                )),
                processor: ImageProcessor::new(processing.clone()),
                processing,
                fetcher,
                writes: TaskQueue::new(),
                metrics: ImageCacheMetrics::default(),
                config,
            }),
        })
    }

    pub fn config(&self) -> &ImageCacheConfig {
        &self.inner.config
    }

    /// Memory then disk; never the network. Reads disk on the calling thread.
    pub fn get(&self, url: &str) -> Option<Arc<DynamicImage>> {
        if let Some(image) = self.memory_hit(url) {
            return Some(image);
        }

        let image = read_disk(&self.inner, url)?;
        Some(self.disk_hit(url, image))
    }

    /// True when the memory tier holds `url`; does not touch disk or recency.
    pub fn contains_in_memory(&self, url: &str) -> bool {
        self.memory().entries.contains(url)
    }

    /// Stream yielding exactly one item: the image, or `None` on a miss.
    pub fn load(&self, url: impl Into<String>) -> impl Stream<Item = Option<Arc<DynamicImage>>> {
        let cache = self.clone();
        let url = url.into();
        stream::once(async move { cache.resolve(&url).await })
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, url: &str) -> Option<Arc<DynamicImage>> {
        if let Some(image) = self.memory_hit(url) {
            return Some(image);
        }

        let inner = self.inner.clone();
        let key = url.to_string();
        match tokio::task::spawn_blocking(move || read_disk(&inner, &key)).await {
            Ok(Some(image)) => return Some(self.disk_hit(url, image)),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "disk read task failed"),
        }

        let validated = match ValidatedUrl::new(url) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "refusing to fetch image");
                return self.miss();
            }
        };

        self.inner.metrics.network_fetches.fetch_add(1, Ordering::Relaxed);
        counter!("image_cache.network_fetches").increment(1);

        let bytes = match self.inner.fetcher.fetch(&validated).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "image fetch failed");
                return self.miss();
            }
        };

        if bytes.len() > self.inner.config.max_download_bytes {
            warn!(
                size = bytes.len(),
                max = self.inner.config.max_download_bytes,
                "image payload over download ceiling"
            );
            return self.miss();
        }

        let image = match self.inner.processor.decode_and_downscale(bytes.to_vec()).await {
            Ok(image) => image,
            Err(e) => {
                warn!(error = %e, "downloaded image could not be decoded");
                return self.miss();
            }
        };

        Some(self.insert(url, image))
    }

    /// Store in memory and schedule the disk write.
    pub fn insert(&self, url: &str, image: DynamicImage) -> Arc<DynamicImage> {
        let image = self.insert_memory(url, image);
        self.schedule_disk_write(url, image.clone());
        image
    }

    /// Decode raw bytes (e.g. a just-uploaded photo) and cache them under `url`.
    pub async fn insert_bytes(&self, url: &str, bytes: Vec<u8>) -> Option<Arc<DynamicImage>> {
        match self.inner.processor.decode_and_downscale(bytes).await {
            Ok(image) => Some(self.insert(url, image)),
            Err(e) => {
                warn!(error = %e, "could not seed image cache");
                None
            }
        }
    }

    /// Waits for queued disk writes to land.
    pub async fn flush(&self) {
        self.inner.writes.wait_idle().await;
    }

    /// Remove disk entries older than `max_age`. Returns how many files went.
    pub async fn remove_expired(&self, max_age: Duration) -> Result<usize, ImageCacheError> {
        self.flush().await;
        let dir = self.inner.config.disk_dir.clone();
        let removed = tokio::task::spawn_blocking(move || sweep_older_than(&dir, max_age))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        if removed > 0 {
            info!(removed, "expired image cache files removed");
        }
        Ok(removed)
    }

    /// Drop every tier's copy of `urls`, e.g. when a conversation is finalized.
    pub async fn remove_urls<I, S>(&self, urls: I) -> Result<usize, ImageCacheError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let urls: Vec<String> = urls.into_iter().map(|u| u.as_ref().to_string()).collect();
        {
            let mut memory = self.memory();
            for url in &urls {
                memory.remove(url);
            }
        }

        self.flush().await;
        let paths: Vec<PathBuf> = urls.iter().map(|u| self.disk_path(u)).collect();
        let removed = tokio::task::spawn_blocking(move || {
            paths
                .iter()
                .filter(|p| remove_if_exists(p))
                .count()
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        debug!(requested = urls.len(), removed, "image cache entries invalidated");
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<(), ImageCacheError> {
        self.inner.writes.clear();
        self.memory().clear();
        self.flush().await;
        let dir = self.inner.config.disk_dir.clone();
        tokio::task::spawn_blocking(move || sweep_older_than(&dir, Duration::ZERO).map(|_| ()))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        info!("image cache cleared");
        Ok(())
    }

    pub fn stats(&self) -> ImageCacheStats {
        let (memory_entries, memory_bytes) = {
            let memory = self.memory();
            (memory.entries.len(), memory.total_bytes)
        };
        let m = &self.inner.metrics;
        ImageCacheStats {
            memory_entries,
            memory_bytes,
            memory_hits: m.memory_hits.load(Ordering::Relaxed),
            disk_hits: m.disk_hits.load(Ordering::Relaxed),
            network_fetches: m.network_fetches.load(Ordering::Relaxed),
            misses: m.misses.load(Ordering::Relaxed),
            evictions: m.evictions.load(Ordering::Relaxed),
            disk_writes: m.disk_writes.load(Ordering::Relaxed),
            disk_writes_skipped: m.disk_writes_skipped.load(Ordering::Relaxed),
            corrupt_files_removed: m.corrupt_files_removed.load(Ordering::Relaxed),
        }
    }

    /// Deterministic on-disk location for `url`.
    pub fn disk_path(&self, url: &str) -> PathBuf {
        disk_path_in(&self.inner.config.disk_dir, url)
    }

    fn memory(&self) -> MutexGuard<'_, MemoryTier> {
        self.inner
            .memory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn memory_hit(&self, url: &str) -> Option<Arc<DynamicImage>> {
        let image = self.memory().get(url)?;
        self.inner.metrics.memory_hits.fetch_add(1, Ordering::Relaxed);
        counter!("image_cache.memory_hits").increment(1);
        Some(image)
    }

    fn disk_hit(&self, url: &str, image: DynamicImage) -> Arc<DynamicImage> {
        self.inner.metrics.disk_hits.fetch_add(1, Ordering::Relaxed);
        counter!("image_cache.disk_hits").increment(1);
        self.insert_memory(url, image)
    }

    fn miss(&self) -> Option<Arc<DynamicImage>> {
        self.inner.metrics.misses.fetch_add(1, Ordering::Relaxed);
        counter!("image_cache.misses").increment(1);
        None
    }

    fn insert_memory(&self, url: &str, image: DynamicImage) -> Arc<DynamicImage> {
        let image = Arc::new(image);
        let entry = CacheEntry {
            key: url.to_string(),
            size_bytes: decoded_size(&image),
            image: image.clone(),
            stored_at: UnixTimeMs::now(),
        };
        let evicted = self.memory().insert(entry);
        if evicted > 0 {
            self.inner
                .metrics
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            counter!("image_cache.evictions").increment(evicted as u64);
        }
        image
    }

    fn schedule_disk_write(&self, url: &str, image: Arc<DynamicImage>) {
        let path = self.disk_path(url);
        let budget = self.inner.config.disk_max_file_bytes;
        let ladder = self.inner.config.quality_ladder();
        let inner = self.inner.clone();

        self.inner.writes.enqueue(TaskPriority::Low, async move {
            let outcome = tokio::task::spawn_blocking(move || {
                write_within_budget(&path, &image, budget, ladder)
            })
            .await
            .map_err(|e| TaskError::Failed(e.to_string()))?;

            match outcome {
                Ok(quality) => {
                    inner.metrics.disk_writes.fetch_add(1, Ordering::Relaxed);
                    counter!("image_cache.disk_writes").increment(1);
                    debug!(quality, "image written to disk cache");
                    Ok(())
                }
                Err(DiskWriteError::Processing(ImageProcessingError::OverBudget {
                    budget,
                    smallest,
                })) => {
                    inner
                        .metrics
                        .disk_writes_skipped
                        .fetch_add(1, Ordering::Relaxed);
                    counter!("image_cache.disk_writes_skipped").increment(1);
                    info!(budget, smallest, "image does not fit disk ceiling, skipping disk write");
                    Ok(())
                }
                Err(DiskWriteError::Processing(e)) => Err(TaskError::Failed(e.to_string())),
                Err(DiskWriteError::Io(e)) => Err(TaskError::Io(e)),
            }
        });
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("dir", &self.inner.config.disk_dir)
            .field("stats", &self.stats())
            .finish()
    }
}

#[derive(Debug, Error)]
enum DiskWriteError {
    #[error(transparent)]
    Processing(#[from] ImageProcessingError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Self-healing read: oversized or undecodable files are deleted. Blocking.
fn read_disk(inner: &CacheInner, url: &str) -> Option<DynamicImage> {
    let path = disk_path_in(&inner.config.disk_dir, url);
    let size = match fs::metadata(&path) {
        Ok(meta) => meta.len(),
        Err(_) => return None,
    };

    let ceiling = inner.config.disk_max_file_bytes as u64;
    if size > ceiling {
        warn!(path = %path.display(), size, ceiling, "cached file over ceiling, deleting");
        discard_file(inner, &path);
        return None;
    }

    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cached file unreadable");
            return None;
        }
    };

    match decode_image(&inner.processing, &bytes) {
        Ok(image) => Some(image),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cached file corrupt, deleting");
            discard_file(inner, &path);
            None
        }
    }
}

fn discard_file(inner: &CacheInner, path: &Path) {
    remove_if_exists(path);
    inner
        .metrics
        .corrupt_files_removed
        .fetch_add(1, Ordering::Relaxed);
    counter!("image_cache.corrupt_files_removed").increment(1);
}

fn disk_path_in(dir: &Path, url: &str) -> PathBuf {
    let digest = blake3::hash(url.as_bytes());
    dir.join(format!("{}.{}", digest.to_hex(), DISK_EXTENSION))
}

/// Atomic write (tmp + rename) at the first quality that fits `budget`.
fn write_within_budget(
    path: &Path,
    image: &DynamicImage,
    budget: usize,
    ladder: QualityLadder,
) -> Result<u8, DiskWriteError> {
    let (encoded, quality) = encode_within_budget(image, budget, ladder)?;

    let tmp_path = path.with_extension(TMP_EXTENSION);
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp_path, path) {
        remove_if_exists(&tmp_path);
        return Err(e.into());
    }
    Ok(quality)
}

fn remove_if_exists(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove cache file");
            false
        }
    }
}

fn sweep_older_than(dir: &Path, max_age: Duration) -> io::Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age >= max_age && remove_if_exists(&entry.path()) {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::HttpError;
    use crate::image_processing::tests::create_test_png;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use image::GenericImageView;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct FakeFetcher {
        payload: Result<Bytes, HttpError>,
        calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn serving(bytes: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                payload: Ok(Bytes::from(bytes)),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(error: HttpError) -> Arc<Self> {
            Arc::new(Self {
                payload: Err(error),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageFetcher for FakeFetcher {
        async fn fetch(&self, _url: &ValidatedUrl) -> Result<Bytes, HttpError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.payload.clone()
        }
    }

    fn test_cache(dir: &TempDir, fetcher: Arc<FakeFetcher>) -> ImageCache {
        ImageCache::new(ImageCacheConfig::with_dir(dir.path()), fetcher).unwrap()
    }

    fn test_image(w: u32, h: u32) -> DynamicImage {
        image::load_from_memory(&create_test_png(w, h)).unwrap()
    }

    const URL: &str = "https://cdn.example.com/chat/photo.png";

    #[test]
    fn config_validation_rejects_zero_budgets() {
        let mut config = ImageCacheConfig::default();
        config.memory_max_entries = 0;
        assert!(config.validate().is_err());

        let mut config = ImageCacheConfig::default();
        config.initial_quality = 101;
        assert!(config.validate().is_err());

        assert!(ImageCacheConfig::default().validate().is_ok());
    }

    #[test]
    fn disk_path_is_deterministic_per_url() {
        let dir = Path::new("/cache");
        assert_eq!(disk_path_in(dir, URL), disk_path_in(dir, URL));
        assert_ne!(disk_path_in(dir, URL), disk_path_in(dir, "https://cdn.example.com/x"));
    }

    #[test]
    fn memory_tier_evicts_by_count_and_bytes() {
        let entry = |key: &str, size: usize| CacheEntry {
            key: key.to_string(),
            image: Arc::new(DynamicImage::new_rgb8(1, 1)),
            size_bytes: size,
            stored_at: UnixTimeMs(0),
        };

        let mut tier = MemoryTier::new(2, 1_000);
        tier.insert(entry("a", 100));
        tier.insert(entry("b", 100));
        tier.get("a");
        assert_eq!(tier.insert(entry("c", 100)), 1);
        assert!(tier.entries.contains("a"));
        assert!(!tier.entries.contains("b"));

        let mut tier = MemoryTier::new(10, 250);
        tier.insert(entry("a", 100));
        tier.insert(entry("b", 100));
        tier.insert(entry("c", 100));
        assert_eq!(tier.entries.len(), 2);
        assert_eq!(tier.total_bytes, 200);
        assert!(!tier.entries.contains("a"));

        assert_eq!(tier.insert(entry("huge", 10_000)), 0);
        assert!(!tier.entries.contains("huge"));
    }

    #[test]
    fn memory_tier_replaces_existing_key_without_double_counting() {
        let mut tier = MemoryTier::new(10, 1_000);
        for size in [100, 300] {
            tier.insert(CacheEntry {
                key: "a".into(),
                image: Arc::new(DynamicImage::new_rgb8(1, 1)),
                size_bytes: size,
                stored_at: UnixTimeMs(0),
            });
        }
        assert_eq!(tier.entries.len(), 1);
        assert_eq!(tier.total_bytes, 300);
    }

    #[tokio::test]
    async fn get_never_touches_network() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::serving(create_test_png(8, 8));
        let cache = test_cache(&dir, fetcher.clone());

        assert!(cache.get(URL).is_none());
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn resolve_fetches_downscales_and_caches() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::serving(create_test_png(64, 32));
        let config = ImageCacheConfig {
            max_dimension: 16,
            ..ImageCacheConfig::with_dir(dir.path())
        };
        let cache = ImageCache::new(config, fetcher.clone()).unwrap();

        let image = cache.resolve(URL).await.unwrap();
        assert_eq!(image.dimensions(), (16, 8));

        let again = cache.resolve(URL).await.unwrap();
        assert_eq!(again.dimensions(), (16, 8));
        assert_eq!(fetcher.calls(), 1);

        cache.flush().await;
        assert!(cache.disk_path(URL).exists());
    }

    #[tokio::test]
    async fn load_yields_exactly_one_item() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir, FakeFetcher::serving(create_test_png(8, 8)));

        let items: Vec<_> = cache.load(URL).collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_some());

        let failing = test_cache(&dir, FakeFetcher::failing(HttpError::NoNetwork));
        let items: Vec<_> = failing.load("https://cdn.example.com/other.png").collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_none());
    }

    #[tokio::test]
    async fn oversized_download_is_a_soft_miss() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::serving(vec![0u8; 2_048]);
        let config = ImageCacheConfig {
            max_download_bytes: 1_024,
            ..ImageCacheConfig::with_dir(dir.path())
        };
        let cache = ImageCache::new(config, fetcher.clone()).unwrap();

        assert!(cache.resolve(URL).await.is_none());
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn invalid_url_is_never_fetched() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::serving(create_test_png(8, 8));
        let cache = test_cache(&dir, fetcher.clone());

        assert!(cache.resolve("file:///etc/passwd").await.is_none());
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn over_budget_image_skips_disk_but_stays_in_memory() {
        let dir = TempDir::new().unwrap();
        let config = ImageCacheConfig {
            disk_max_file_bytes: 16,
            ..ImageCacheConfig::with_dir(dir.path())
        };
        let cache = ImageCache::new(config, FakeFetcher::serving(Vec::new())).unwrap();

        cache.insert(URL, test_image(64, 64));
        cache.flush().await;

        assert!(!cache.disk_path(URL).exists());
        assert!(cache.get(URL).is_some());
        assert_eq!(cache.stats().disk_writes_skipped, 1);
    }

    #[tokio::test]
    async fn oversized_disk_file_is_deleted_and_missed() {
        let dir = TempDir::new().unwrap();
        let config = ImageCacheConfig {
            disk_max_file_bytes: 1_024,
            ..ImageCacheConfig::with_dir(dir.path())
        };
        let cache = ImageCache::new(config, FakeFetcher::serving(Vec::new())).unwrap();

        let path = cache.disk_path(URL);
        fs::write(&path, vec![0u8; 4_096]).unwrap();

        assert!(cache.get(URL).is_none());
        assert!(!path.exists());
        assert_eq!(cache.stats().corrupt_files_removed, 1);
    }

    #[tokio::test]
    async fn corrupt_disk_file_is_deleted_and_missed() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir, FakeFetcher::serving(Vec::new()));

        let path = cache.disk_path(URL);
        fs::write(&path, b"not an image").unwrap();

        assert!(cache.get(URL).is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn disk_tier_serves_after_memory_eviction() {
        let dir = TempDir::new().unwrap();
        let config = ImageCacheConfig {
            memory_max_entries: 1,
            ..ImageCacheConfig::with_dir(dir.path())
        };
        let cache = ImageCache::new(config, FakeFetcher::serving(Vec::new())).unwrap();

        cache.insert("https://cdn.example.com/a.png", test_image(10, 20));
        cache.insert("https://cdn.example.com/b.png", test_image(8, 8));
        cache.flush().await;
        assert!(!cache.contains_in_memory("https://cdn.example.com/a.png"));

        let image = cache.get("https://cdn.example.com/a.png").unwrap();
        assert_eq!(image.dimensions(), (10, 20));
        assert_eq!(cache.stats().disk_hits, 1);
        assert!(cache.contains_in_memory("https://cdn.example.com/a.png"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resolve_reads_disk_tier_without_fetching() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::serving(create_test_png(4, 4));
        let config = ImageCacheConfig {
            memory_max_entries: 1,
            ..ImageCacheConfig::with_dir(dir.path())
        };
        let cache = ImageCache::new(config, fetcher.clone()).unwrap();
        let evicted = "https://cdn.example.com/a.png";

        cache.insert(evicted, test_image(10, 20));
        cache.insert("https://cdn.example.com/b.png", test_image(8, 8));
        cache.flush().await;
        assert!(!cache.contains_in_memory(evicted));

        let image = cache.resolve(evicted).await.unwrap();
        assert_eq!(image.dimensions(), (10, 20));
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(cache.stats().disk_hits, 1);
        assert!(cache.contains_in_memory(evicted));

        let corrupt = "https://cdn.example.com/corrupt.png";
        fs::write(cache.disk_path(corrupt), b"not an image").unwrap();
        assert!(cache.resolve(corrupt).await.is_some());
        assert!(!fs::read(cache.disk_path(corrupt)).is_ok_and(|b| b == b"not an image"));
        assert_eq!(cache.stats().corrupt_files_removed, 1);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn remove_urls_clears_both_tiers() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir, FakeFetcher::serving(Vec::new()));
        let keep = "https://cdn.example.com/keep.png";

        cache.insert(URL, test_image(8, 8));
        cache.insert(keep, test_image(8, 8));

        let removed = cache.remove_urls([URL]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get(URL).is_none());
        assert!(cache.get(keep).is_some());
        assert!(cache.disk_path(keep).exists());
    }

    #[tokio::test]
    async fn clear_empties_everything() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir, FakeFetcher::serving(Vec::new()));

        cache.insert(URL, test_image(8, 8));
        cache.flush().await;
        cache.clear().await.unwrap();

        assert_eq!(cache.stats().memory_entries, 0);
        assert!(!cache.disk_path(URL).exists());
        assert!(cache.get(URL).is_none());
    }

    #[tokio::test]
    async fn expiry_sweep_respects_max_age() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir, FakeFetcher::serving(Vec::new()));

        cache.insert(URL, test_image(8, 8));
        cache.flush().await;

        assert_eq!(cache.remove_expired(Duration::from_secs(3_600)).await.unwrap(), 0);
        assert!(cache.disk_path(URL).exists());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.remove_expired(Duration::from_millis(1)).await.unwrap(), 1);
        assert!(!cache.disk_path(URL).exists());
    }
}
