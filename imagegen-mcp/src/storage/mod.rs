//! Local artifact store.
//!
//! Layout under the base path:
//!
//! ```text
//! images/<YYYY>/<MM>/<DD>/<image_id>.<ext>
//! images/<YYYY>/<MM>/<DD>/<image_id>.json
//! ```
//!
//! Both files are written to a dot-prefixed temp file, fsynced and renamed.
//! The image goes first and the metadata last, so a metadata file marks a
//! committed artifact. Readers never see a partially written image.

mod id;

pub use id::ImageId;

use crate::translate::ResolvedParameters;
use chrono::{DateTime, NaiveDate, Utc};
use imagegen_mcp_common::config::StorageConfig;
use imagegen_mcp_common::error::{StorageError, StorageOperation};
use imagegen_mcp_common::models::{CostEstimate, TokenUsage};
use imagegen_mcp_common::params::{Operation, OutputFormat};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const IMAGES_DIR: &str = "images";
const METADATA_EXT: &str = "json";
const TEMP_EXT: &str = "tmp";
const WRITE_ATTEMPTS: u32 = 3;
const MAX_RECENT: usize = 100;

/// Everything about how an image was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationDetails {
    pub operation: Operation,
    pub prompt: String,
    pub model: String,
    pub provider: String,
    pub parameters: ResolvedParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
    #[serde(default)]
    pub has_mask: bool,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    /// Path relative to the store's base path, `/`-separated
    pub relative_path: String,
    pub size_bytes: u64,
    pub format: OutputFormat,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Sidecar metadata of a committed artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub image_id: String,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    pub file_info: FileInfo,
    #[serde(flatten)]
    pub details: GenerationDetails,
}

/// Aggregate counters over committed artifacts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStats {
    pub total_images: usize,
    pub total_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub retention_days: u32,
    pub max_size_bytes: u64,
    pub usage_percent: f64,
    pub base_path: String,
}

/// What a sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deleted: usize,
    pub bytes_freed: u64,
    pub orphans_removed: usize,
}

/// One committed artifact found on disk.
struct Committed {
    id: ImageId,
    metadata_path: PathBuf,
    image_path: Option<PathBuf>,
    image_bytes: u64,
}

/// Directory-backed store for generated images.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    images_dir: PathBuf,
    retention_days: u32,
    max_size_bytes: u64,
}

impl ArtifactStore {
    /// Open the store described by `config`, creating the image directory.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the directory cannot be created.
    pub async fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        let images_dir = config.base_path.join(IMAGES_DIR);
        fs::create_dir_all(&images_dir)
            .await
            .map_err(|e| StorageError::io(StorageOperation::Write, &images_dir, e))?;
        info!(path = %config.base_path.display(), "Artifact store ready");
        Ok(Self {
            root: config.base_path.clone(),
            images_dir,
            retention_days: config.retention_days,
            max_size_bytes: config.max_size_bytes(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.root
    }

    /// Absolute path of an artifact's image file.
    pub fn image_path(&self, id: &ImageId, format: OutputFormat) -> PathBuf {
        self.images_dir
            .join(id.date_dir())
            .join(format!("{id}.{}", format.extension()))
    }

    fn metadata_path(&self, id: &ImageId) -> PathBuf {
        self.images_dir
            .join(id.date_dir())
            .join(format!("{id}.{METADATA_EXT}"))
    }

    /// Persist an image and its metadata under a fresh id.
    ///
    /// # Errors
    ///
    /// Returns the last `StorageError` once transient failures have used up
    /// every attempt, or the first permanent one.
    pub async fn put(
        &self,
        bytes: &[u8],
        format: OutputFormat,
        task_id: &str,
        details: GenerationDetails,
    ) -> Result<ArtifactMetadata, StorageError> {
        self.put_with_id(ImageId::generate(), bytes, format, task_id, details)
            .await
    }

    pub(crate) async fn put_with_id(
        &self,
        id: ImageId,
        bytes: &[u8],
        format: OutputFormat,
        task_id: &str,
        details: GenerationDetails,
    ) -> Result<ArtifactMetadata, StorageError> {
        let dir = self.images_dir.join(id.date_dir());
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(StorageOperation::Write, &dir, e))?;

        let filename = format!("{id}.{}", format.extension());
        let day = id.created_at().format("%Y/%m/%d");
        let (width, height) = probe_dimensions(bytes);
        let metadata = ArtifactMetadata {
            image_id: id.to_string(),
            task_id: task_id.to_string(),
            created_at: id.created_at(),
            file_info: FileInfo {
                relative_path: format!("{IMAGES_DIR}/{day}/{filename}"),
                filename,
                size_bytes: bytes.len() as u64,
                format,
                mime_type: format.mime_type().to_string(),
                width,
                height,
            },
            details,
        };
        let json = serde_json::to_vec_pretty(&metadata).map_err(|e| StorageError::Metadata {
            image_id: id.to_string(),
            message: e.to_string(),
        })?;

        let image_path = self.image_path(&id, format);
        let metadata_path = self.metadata_path(&id);
        with_retries(|| write_atomic(&image_path, bytes)).await?;
        if let Err(e) = with_retries(|| write_atomic(&metadata_path, &json)).await {
            let _ = fs::remove_file(&image_path).await;
            return Err(e);
        }

        info!(
            image_id = %id,
            size_bytes = metadata.file_info.size_bytes,
            format = format.as_str(),
            "Stored artifact"
        );
        Ok(metadata)
    }

    /// Read a committed artifact.
    ///
    /// # Errors
    ///
    /// `InvalidId` for malformed ids (checked before any filesystem access),
    /// `NotFound` when no committed artifact exists.
    pub async fn get(&self, image_id: &str) -> Result<(Vec<u8>, ArtifactMetadata), StorageError> {
        let id = ImageId::parse(image_id)?;
        let metadata = self.read_metadata(&id).await?;
        let path = self.image_path(&id, metadata.file_info.format);
        let bytes = fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(image_id.to_string()),
            _ => StorageError::io(StorageOperation::Read, &path, e),
        })?;
        Ok((bytes, metadata))
    }

    /// Read only the metadata of a committed artifact.
    pub async fn metadata(&self, image_id: &str) -> Result<ArtifactMetadata, StorageError> {
        let id = ImageId::parse(image_id)?;
        self.read_metadata(&id).await
    }

    /// Whether a committed artifact exists.
    pub async fn contains(&self, image_id: &str) -> bool {
        match ImageId::parse(image_id) {
            Ok(id) => fs::try_exists(self.metadata_path(&id)).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn read_metadata(&self, id: &ImageId) -> Result<ArtifactMetadata, StorageError> {
        let path = self.metadata_path(id);
        let raw = fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(id.to_string()),
            _ => StorageError::io(StorageOperation::Read, &path, e),
        })?;
        serde_json::from_slice(&raw).map_err(|e| StorageError::Metadata {
            image_id: id.to_string(),
            message: e.to_string(),
        })
    }

    /// Newest-first metadata of artifacts created at or after `since`.
    ///
    /// `limit` is clamped to `1..=100`. Date directories are walked
    /// newest-first and the walk stops as soon as enough entries are found
    /// or the directories fall before `since`.
    pub async fn list_recent(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ArtifactMetadata>, StorageError> {
        let limit = limit.clamp(1, MAX_RECENT);
        let since_day = since.map(|s| s.date_naive());
        let mut found = Vec::with_capacity(limit);

        for (day, dir) in self.day_dirs().await?.into_iter().rev() {
            if since_day.is_some_and(|s| day < s) {
                break;
            }
            let mut ids: Vec<ImageId> = list_files(&dir)
                .await?
                .into_iter()
                .filter_map(|(name, _)| {
                    name.strip_suffix(".json")
                        .and_then(|stem| ImageId::parse(stem).ok())
                })
                .collect();
            ids.sort_unstable_by(|a, b| b.cmp(a));

            for id in ids {
                if since.is_some_and(|s| id.created_at() < s) {
                    continue;
                }
                match self.read_metadata(&id).await {
                    Ok(metadata) => found.push(metadata),
                    // Swept between listing and reading.
                    Err(StorageError::NotFound(_)) => continue,
                    Err(e) => {
                        warn!(image_id = %id, error = %e, "Skipping unreadable artifact metadata");
                        continue;
                    }
                }
                if found.len() == limit {
                    return Ok(found);
                }
            }
        }
        Ok(found)
    }

    /// Aggregate counters over every committed artifact.
    pub async fn stats(&self) -> Result<StorageStats, StorageError> {
        let committed = self.committed().await?;
        let total_bytes: u64 = committed.iter().map(|c| c.image_bytes).sum();
        let usage_percent = if self.max_size_bytes == 0 {
            0.0
        } else {
            total_bytes as f64 / self.max_size_bytes as f64 * 100.0
        };
        Ok(StorageStats {
            total_images: committed.len(),
            total_bytes,
            oldest: committed.first().map(|c| c.id.created_at()),
            newest: committed.last().map(|c| c.id.created_at()),
            retention_days: self.retention_days,
            max_size_bytes: self.max_size_bytes,
            usage_percent,
            base_path: self.root.display().to_string(),
        })
    }

    /// Delete artifacts older than `window`, as of now.
    pub async fn run_retention_sweep(&self, window: Duration) -> Result<SweepReport, StorageError> {
        self.sweep_at(Utc::now(), window).await
    }

    /// Delete artifacts created before `now - window`.
    ///
    /// Nothing created after the sweep started is touched, whatever `now`
    /// says. Metadata is removed before its image so a concurrent reader
    /// sees either the full artifact or `NotFound`. Temp files and orphaned
    /// images older than the cutoff go too, unless they were modified after
    /// the sweep started, then empty date directories.
    pub async fn sweep_at(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<SweepReport, StorageError> {
        let started = Utc::now();
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let horizon = cutoff.min(started);
        let horizon_day = horizon.date_naive();
        let mut report = SweepReport::default();

        for (day, dir) in self.day_dirs().await? {
            if day > horizon_day {
                break;
            }
            let files = list_files(&dir).await?;
            let committed: HashSet<&str> = files
                .iter()
                .filter_map(|(name, _)| name.strip_suffix(".json"))
                .collect();

            for (name, path) in &files {
                if let Some(stem) = name.strip_suffix(".json") {
                    let Ok(id) = ImageId::parse(stem) else { continue };
                    if id.created_at() >= horizon {
                        continue;
                    }
                    let image = self
                        .read_metadata(&id)
                        .await
                        .ok()
                        .map(|m| self.image_path(&id, m.file_info.format));
                    remove_file(path).await?;
                    if let Some(image) = image {
                        report.bytes_freed += file_len(&image).await;
                        remove_file(&image).await?;
                    }
                    report.deleted += 1;
                    debug!(image_id = %id, "Swept expired artifact");
                } else if let Some(stem) = temp_stem(name) {
                    let stale = match ImageId::parse(stem) {
                        Ok(id) => id.created_at() < horizon && modified_before(path, started).await,
                        Err(_) => modified_before(path, horizon).await,
                    };
                    if stale {
                        remove_file(path).await?;
                        report.orphans_removed += 1;
                    }
                } else if let Some((stem, _ext)) = name.rsplit_once('.') {
                    let Ok(id) = ImageId::parse(stem) else { continue };
                    // An image still waiting for its metadata was written after the sweep began.
                    if !committed.contains(stem)
                        && id.created_at() < horizon
                        && modified_before(path, started).await
                    {
                        remove_file(path).await?;
                        report.orphans_removed += 1;
                    }
                }
            }
        }

        self.prune_empty_dirs().await;
        if report.deleted > 0 || report.orphans_removed > 0 {
            info!(
                deleted = report.deleted,
                bytes_freed = report.bytes_freed,
                orphans_removed = report.orphans_removed,
                "Retention sweep finished"
            );
        }
        Ok(report)
    }

    /// Delete oldest artifacts until total image bytes fit in `max_bytes`.
    pub async fn enforce_size_limit(&self, max_bytes: u64) -> Result<SweepReport, StorageError> {
        let committed = self.committed().await?;
        let mut total: u64 = committed.iter().map(|c| c.image_bytes).sum();
        let mut report = SweepReport::default();

        for artifact in committed {
            if total <= max_bytes {
                break;
            }
            remove_file(&artifact.metadata_path).await?;
            if let Some(image) = &artifact.image_path {
                remove_file(image).await?;
            }
            total = total.saturating_sub(artifact.image_bytes);
            report.deleted += 1;
            report.bytes_freed += artifact.image_bytes;
        }

        if report.deleted > 0 {
            self.prune_empty_dirs().await;
            info!(
                deleted = report.deleted,
                bytes_freed = report.bytes_freed,
                max_bytes,
                "Evicted artifacts over the size limit"
            );
        }
        Ok(report)
    }

    /// Every committed artifact, oldest first.
    async fn committed(&self) -> Result<Vec<Committed>, StorageError> {
        let mut all = Vec::new();
        for (_, dir) in self.day_dirs().await? {
            let files = list_files(&dir).await?;
            let mut images: BTreeMap<&str, &PathBuf> = BTreeMap::new();
            for (name, path) in &files {
                if temp_stem(name).is_some() || name.ends_with(".json") {
                    continue;
                }
                if let Some((stem, _)) = name.rsplit_once('.') {
                    images.insert(stem, path);
                }
            }
            let mut day: Vec<Committed> = Vec::new();
            for (name, path) in &files {
                let Some(stem) = name.strip_suffix(".json") else { continue };
                let Ok(id) = ImageId::parse(stem) else { continue };
                let image_path = images.get(stem).map(|p| (*p).clone());
                let image_bytes = match &image_path {
                    Some(p) => file_len(p).await,
                    None => 0,
                };
                day.push(Committed {
                    id,
                    metadata_path: path.clone(),
                    image_path,
                    image_bytes,
                });
            }
            day.sort_unstable_by(|a, b| a.id.cmp(&b.id));
            all.extend(day);
        }
        Ok(all)
    }

    /// Date directories, oldest first.
    async fn day_dirs(&self) -> Result<Vec<(NaiveDate, PathBuf)>, StorageError> {
        let mut days = Vec::new();
        for (year, year_path) in numbered_dirs(&self.images_dir).await? {
            for (month, month_path) in numbered_dirs(&year_path).await? {
                for (day, day_path) in numbered_dirs(&month_path).await? {
                    if let Some(date) = NaiveDate::from_ymd_opt(year as i32, month, day) {
                        days.push((date, day_path));
                    }
                }
            }
        }
        days.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        Ok(days)
    }

    /// Remove empty day, month and year directories. Best effort.
    async fn prune_empty_dirs(&self) {
        let Ok(years) = numbered_dirs(&self.images_dir).await else { return };
        for (_, year_path) in years {
            let Ok(months) = numbered_dirs(&year_path).await else { continue };
            for (_, month_path) in months {
                let Ok(days) = numbered_dirs(&month_path).await else { continue };
                for (_, day_path) in days {
                    // Fails while the directory still has entries.
                    let _ = fs::remove_dir(&day_path).await;
                }
                let _ = fs::remove_dir(&month_path).await;
            }
            let _ = fs::remove_dir(&year_path).await;
        }
    }
}

/// `(width, height)` from the image header, when it can be decoded.
fn probe_dimensions(bytes: &[u8]) -> (Option<u32>, Option<u32>) {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.into_dimensions().ok())
        .map_or((None, None), |(w, h)| (Some(w), Some(h)))
}

/// `.name.tmp` → `name` without its extension, for temp files.
fn temp_stem(name: &str) -> Option<&str> {
    let inner = name.strip_prefix('.')?.strip_suffix(TEMP_EXT)?.strip_suffix('.')?;
    Some(inner.split_once('.').map_or(inner, |(stem, _)| stem))
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{TEMP_EXT}"))
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp = temp_path(path);
    let written: std::io::Result<()> = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(StorageError::io(StorageOperation::Write, path, e));
    }
    Ok(())
}

async fn with_retries<F, Fut>(mut op: F) -> Result<(), StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StorageError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < WRITE_ATTEMPTS => {
                warn!(attempt, error = %e, "Transient storage failure, retrying");
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn remove_file(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(StorageOperation::Delete, path, e)),
    }
}

async fn file_len(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn modified_before(path: &Path, horizon: DateTime<Utc>) -> bool {
    match fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => DateTime::<Utc>::from(modified) < horizon,
        Err(_) => false,
    }
}

/// Regular files in `dir` as `(name, path)`. A missing directory is empty.
async fn list_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, StorageError> {
    let mut files = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(StorageError::io(StorageOperation::List, dir, e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StorageError::io(StorageOperation::List, dir, e))?
    {
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file {
            files.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    Ok(files)
}

/// Subdirectories of `dir` whose names are plain numbers.
async fn numbered_dirs(dir: &Path) -> Result<Vec<(u32, PathBuf)>, StorageError> {
    let mut dirs = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(StorageError::io(StorageOperation::List, dir, e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StorageError::io(StorageOperation::List, dir, e))?
    {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        if let Ok(n) = entry.file_name().to_string_lossy().parse::<u32>() {
            dirs.push((n, entry.path()));
        }
    }
    dirs.sort_unstable_by_key(|(n, _)| *n);
    Ok(dirs)
}
