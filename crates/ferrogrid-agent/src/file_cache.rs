//! Versioned on-disk cache of files pulled from the grid.
//!
//! Layout: `<root>/<file_id>/<version>/<name>` where `<name>` is a single file
//! or directory. Only the highest version of each id is indexed; requests for
//! different ids run in parallel while requests for the same id are
//! serialised so a bundle is downloaded once.

use crate::error::FileCacheError;
use async_trait::async_trait;
use ferrogrid_proto::{FilePayload, FileVersionId};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TEMP_PREFIX: &str = ".tmp-";

/// Source of file content, normally the grid controller
#[async_trait]
pub trait FileProvider: Send + Sync + 'static {
    /// Download one version of a file. Must be safe to retry.
    async fn fetch(&self, file: &FileVersionId) -> Result<FilePayload, FileCacheError>;
}

/// A cached file as returned to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    /// File id
    pub file_id: String,
    /// Version present on disk
    pub version: String,
    /// Path of the materialised file or directory
    pub path: PathBuf,
    /// Whether the content is newer than the version the caller knew
    pub modified: bool,
}

impl CachedFile {
    /// Id of the cached version
    pub fn version_id(&self) -> FileVersionId {
        FileVersionId::new(self.file_id.clone(), self.version.clone())
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    version: String,
    path: PathBuf,
}

type EntrySlot = Arc<tokio::sync::Mutex<Option<CacheEntry>>>;

/// Agent-local file cache
pub struct FileCache {
    root: PathBuf,
    provider: Arc<dyn FileProvider>,
    entries: Mutex<HashMap<String, EntrySlot>>,
}

impl FileCache {
    /// Open the cache rooted at `root`, rebuilding the index from disk
    pub fn open(root: impl Into<PathBuf>, provider: Arc<dyn FileProvider>) -> Result<Self, FileCacheError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut entries = HashMap::new();
        for dir_entry in fs::read_dir(&root)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            let Some(file_id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                warn!(path = %path.display(), "Skipping cache entry with a non UTF-8 name");
                continue;
            };
            if file_id.starts_with('.') || !path.is_dir() {
                warn!(path = %path.display(), "Skipping unexpected cache entry");
                continue;
            }

            match scan_file_id(&path, &file_id) {
                Ok(Some(entry)) => {
                    debug!(file_id = %file_id, version = %entry.version, "Cache entry restored");
                    entries.insert(file_id, Arc::new(tokio::sync::Mutex::new(Some(entry))));
                }
                Ok(None) => debug!(file_id = %file_id, "No cached version found"),
                Err(e) => warn!(file_id = %file_id, error = %e, "Ignoring cache entry"),
            }
        }

        info!(root = %root.display(), files = entries.len(), "File cache opened");
        Ok(Self {
            root,
            provider,
            entries: Mutex::new(entries),
        })
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Make `file_id` available at `known_version` or newer.
    ///
    /// Downloads when the id is not cached or `known_version` is newer than
    /// the cached version; otherwise returns the cached content with
    /// `modified == false`.
    pub async fn request_file_version(
        &self,
        file_id: &str,
        known_version: &str,
    ) -> Result<CachedFile, FileCacheError> {
        validate_segment(file_id)?;
        validate_segment(known_version)?;

        let slot = self
            .entries
            .lock()
            .entry(file_id.to_string())
            .or_default()
            .clone();
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref() {
            if compare_versions(known_version, &cached.version) != Ordering::Greater {
                return Ok(CachedFile {
                    file_id: file_id.to_string(),
                    version: cached.version.clone(),
                    path: cached.path.clone(),
                    modified: false,
                });
            }
        }

        let file = FileVersionId::new(file_id, known_version);
        info!(file = %file, "Downloading file");
        let payload = self.provider.fetch(&file).await?;

        let root = self.root.clone();
        let target = file.clone();
        let path = tokio::task::spawn_blocking(move || materialize(&root, &target, &payload))
            .await
            .map_err(|e| FileCacheError::Download {
                file: file.clone(),
                message: e.to_string(),
            })??;
        info!(file = %file, path = %path.display(), "File cached");

        *entry = Some(CacheEntry {
            version: known_version.to_string(),
            path: path.clone(),
        });

        Ok(CachedFile {
            file_id: file_id.to_string(),
            version: known_version.to_string(),
            path,
            modified: true,
        })
    }

    /// Version currently cached for `file_id`
    pub async fn cached_version(&self, file_id: &str) -> Option<String> {
        let slot = self.entries.lock().get(file_id).cloned()?;
        let entry = slot.lock().await;
        entry.as_ref().map(|e| e.version.clone())
    }

    /// Delete version directories older than the cached version of each id.
    /// Returns the number of directories removed.
    pub async fn cleanup_obsolete_versions(&self) -> Result<usize, FileCacheError> {
        let slots: Vec<(String, EntrySlot)> = self
            .entries
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut removed = 0;
        for (file_id, slot) in slots {
            let entry = slot.lock().await;
            let Some(cached) = entry.as_ref() else {
                continue;
            };
            let id_dir = self.root.join(&file_id);
            let version = cached.version.clone();
            removed += tokio::task::spawn_blocking(move || remove_older_versions(&id_dir, &version))
                .await
                .map_err(|e| FileCacheError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        }

        if removed > 0 {
            info!(removed, "Obsolete file versions removed");
        }
        Ok(removed)
    }
}

/// Order two versions: numerically when both are unsigned integers,
/// lexicographically otherwise
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

fn validate_segment(segment: &str) -> Result<(), FileCacheError> {
    let valid = !segment.is_empty()
        && !segment.starts_with('.')
        && !segment.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(FileCacheError::InvalidId(segment.to_string()))
    }
}

fn validate_relative_path(path: &str) -> Result<(), FileCacheError> {
    let valid = !path.is_empty()
        && !path.contains(['\\', '\0'])
        && path
            .split('/')
            .all(|component| !component.is_empty() && component != "." && component != "..");
    if valid {
        Ok(())
    } else {
        Err(FileCacheError::InvalidId(path.to_string()))
    }
}

fn scan_file_id(id_dir: &Path, file_id: &str) -> Result<Option<CacheEntry>, FileCacheError> {
    let mut best: Option<String> = None;

    for dir_entry in fs::read_dir(id_dir)? {
        let path = dir_entry?.path();
        let Some(version) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if version.starts_with(TEMP_PREFIX) {
            debug!(path = %path.display(), "Removing leftover download");
            fs::remove_dir_all(&path)?;
            continue;
        }
        if !path.is_dir() {
            warn!(path = %path.display(), "Skipping unexpected file in cache");
            continue;
        }
        let newer = best
            .as_deref()
            .map_or(true, |current| compare_versions(&version, current) == Ordering::Greater);
        if newer {
            best = Some(version);
        }
    }

    let Some(version) = best else {
        return Ok(None);
    };

    let version_dir = id_dir.join(&version);
    let mut content = fs::read_dir(&version_dir)?.collect::<Result<Vec<_>, _>>()?;
    if content.len() != 1 {
        return Err(FileCacheError::Inconsistent {
            file_id: file_id.to_string(),
            message: format!("version {} holds {} entries instead of one", version, content.len()),
        });
    }

    Ok(Some(CacheEntry {
        version,
        path: content.remove(0).path(),
    }))
}

fn materialize(root: &Path, file: &FileVersionId, payload: &FilePayload) -> Result<PathBuf, FileCacheError> {
    validate_segment(payload.name())?;
    if let FilePayload::Directory { entries, .. } = payload {
        for entry in entries {
            validate_relative_path(&entry.path)?;
        }
    }

    let id_dir = root.join(&file.file_id);
    let version_dir = id_dir.join(&file.version);
    if version_dir.exists() {
        debug!(path = %version_dir.display(), "Removing stale version directory");
        fs::remove_dir_all(&version_dir)?;
    }
    fs::create_dir_all(&id_dir)?;

    let temp_dir = id_dir.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()));
    let result = write_payload(&temp_dir, payload).and_then(|()| fs::rename(&temp_dir, &version_dir));
    if let Err(e) = result {
        let _ = fs::remove_dir_all(&temp_dir);
        return Err(e.into());
    }

    Ok(version_dir.join(payload.name()))
}

fn write_payload(dir: &Path, payload: &FilePayload) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    match payload {
        FilePayload::File { name, content } => fs::write(dir.join(name), content),
        FilePayload::Directory { name, entries } => {
            let base = dir.join(name);
            fs::create_dir_all(&base)?;
            for entry in entries {
                let target = base.join(&entry.path);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(target, &entry.content)?;
            }
            Ok(())
        }
    }
}

fn remove_older_versions(id_dir: &Path, cached_version: &str) -> Result<usize, FileCacheError> {
    let mut removed = 0;
    for dir_entry in fs::read_dir(id_dir)? {
        let path = dir_entry?.path();
        let Some(version) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if version.starts_with(TEMP_PREFIX) || !path.is_dir() {
            continue;
        }
        if compare_versions(version, cached_version) == Ordering::Less {
            fs::remove_dir_all(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
