//! Files served to agents

use crate::error::GridError;
use bytes::Bytes;
use ferrogrid_proto::{FileEntry, FilePayload, FileVersionId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct RegisteredFile {
    path: PathBuf,
    version: u64,
    modified: SystemTime,
    cleanable: bool,
}

#[derive(Default)]
struct Registry {
    files: HashMap<String, RegisteredFile>,
    by_path: HashMap<PathBuf, String>,
    last_version: u64,
}

/// Registry of the files and directories agents may download.
///
/// A path keeps the same file id for the lifetime of the manager; its version
/// is bumped whenever it is registered again after its content changed.
pub struct FileManager {
    root: PathBuf,
    registry: RwLock<Registry>,
}

fn last_modified(path: &Path) -> std::io::Result<SystemTime> {
    let metadata = std::fs::metadata(path)?;
    let mut latest = metadata.modified()?;
    if metadata.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let modified = last_modified(&entry?.path())?;
            if modified > latest {
                latest = modified;
            }
        }
    }
    Ok(latest)
}

fn collect_entries(base: &Path, dir: &Path, entries: &mut Vec<FileEntry>) -> std::io::Result<()> {
    let mut children: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    children.sort_by_key(|entry| entry.file_name());
    for child in children {
        let path = child.path();
        if child.file_type()?.is_dir() {
            collect_entries(base, &path, entries)?;
        } else {
            let relative = path
                .strip_prefix(base)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            let relative = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            entries.push(FileEntry {
                path: relative,
                content: Bytes::from(std::fs::read(&path)?),
            });
        }
    }
    Ok(())
}

fn read_payload(path: &Path) -> std::io::Result<FilePayload> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"))?;
    if path.is_dir() {
        let mut entries = Vec::new();
        collect_entries(path, path, &mut entries)?;
        Ok(FilePayload::Directory { name, entries })
    } else {
        Ok(FilePayload::File {
            name,
            content: Bytes::from(std::fs::read(path)?),
        })
    }
}

impl FileManager {
    /// Create a manager resolving relative paths against `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registry: RwLock::new(Registry::default()),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Register a file or directory, returning the id and version agents
    /// must request. `cleanable` content is deleted when unregistered.
    pub fn register_file(&self, path: impl AsRef<Path>, cleanable: bool) -> Result<FileVersionId, GridError> {
        let path = self.resolve(path.as_ref());
        let modified = last_modified(&path)?;

        let mut registry = self.registry.write();
        if let Some(file_id) = registry.by_path.get(&path).cloned() {
            let version = match registry.files.get(&file_id) {
                Some(file) if file.modified == modified => file.version,
                _ => {
                    registry.last_version += 1;
                    registry.last_version
                }
            };
            registry.files.insert(
                file_id.clone(),
                RegisteredFile {
                    path: path.clone(),
                    version,
                    modified,
                    cleanable,
                },
            );
            debug!(file = %file_id, version, path = %path.display(), "File registered again");
            return Ok(FileVersionId::new(file_id, version.to_string()));
        }

        registry.last_version += 1;
        let version = registry.last_version;
        let file_id = Uuid::new_v4().simple().to_string();
        registry.by_path.insert(path.clone(), file_id.clone());
        registry.files.insert(
            file_id.clone(),
            RegisteredFile {
                path: path.clone(),
                version,
                modified,
                cleanable,
            },
        );
        info!(file = %file_id, version, path = %path.display(), "File registered");
        Ok(FileVersionId::new(file_id, version.to_string()))
    }

    /// Path registered under `file_id`
    pub fn path_of(&self, file_id: &str) -> Option<PathBuf> {
        self.registry.read().files.get(file_id).map(|file| file.path.clone())
    }

    /// Content of a registered file. Only the current version is served.
    pub async fn fetch(&self, file: &FileVersionId) -> Result<FilePayload, GridError> {
        let path = {
            let registry = self.registry.read();
            match registry.files.get(&file.file_id) {
                Some(registered) if registered.version.to_string() == file.version => registered.path.clone(),
                _ => return Err(GridError::FileNotFound(file.clone())),
            }
        };

        let payload = tokio::task::spawn_blocking(move || read_payload(&path))
            .await
            .map_err(|e| GridError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        debug!(file = %file, size = payload.size(), "File served");
        Ok(payload)
    }

    /// Forget a file, deleting it from disk if it was registered as cleanable
    pub fn unregister_file(&self, file_id: &str) -> Result<bool, GridError> {
        let removed = {
            let mut registry = self.registry.write();
            let removed = registry.files.remove(file_id);
            if let Some(file) = &removed {
                registry.by_path.remove(&file.path);
            }
            removed
        };
        let Some(file) = removed else {
            return Ok(false);
        };
        if file.cleanable {
            let result = if file.path.is_dir() {
                std::fs::remove_dir_all(&file.path)
            } else {
                std::fs::remove_file(&file.path)
            };
            if let Err(e) = result {
                warn!(path = %file.path.display(), error = %e, "Failed to delete unregistered file");
                return Err(e.into());
            }
        }
        Ok(true)
    }

    /// Number of registered files
    pub fn len(&self) -> usize {
        self.registry.read().files.len()
    }

    /// Whether no file is registered
    pub fn is_empty(&self) -> bool {
        self.registry.read().files.is_empty()
    }
}
