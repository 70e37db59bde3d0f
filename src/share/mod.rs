use crate::error::{P2pError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::fs::File;
use tracing::{debug, info};

/// A file this peer offers to the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    /// Unique key, the base name of `local_path`
    pub name: String,
    pub local_path: PathBuf,
}

/// The set of locally shared files, keyed by name.
///
/// The lock only covers in-memory lookups and mutations; file I/O for
/// serving happens on a path captured under the lock.
#[derive(Debug, Default)]
pub struct ShareRegistry {
    entries: Mutex<BTreeMap<String, SharedFile>>,
}

impl ShareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share `local_path` under its base name
    pub fn add<P: AsRef<Path>>(&self, local_path: P) -> Result<String> {
        let local_path = local_path.as_ref();
        let name = share_name(local_path)?;

        let mut entries = self.lock();
        if entries.contains_key(&name) {
            return Err(P2pError::DuplicateShare(name));
        }

        entries.insert(
            name.clone(),
            SharedFile {
                name: name.clone(),
                local_path: local_path.to_path_buf(),
            },
        );

        info!("Sharing \"{}\" from {}", name, local_path.display());
        Ok(name)
    }

    /// Stop sharing the entry whose local path is `path`, falling back to a
    /// match on its name
    pub fn remove(&self, path: &str) -> Result<String> {
        let mut entries = self.lock();

        let by_path = entries
            .values()
            .find(|file| file.local_path == Path::new(path))
            .map(|file| file.name.clone());

        let name = match by_path {
            Some(name) => name,
            None if entries.contains_key(path) => path.to_string(),
            None => return Err(P2pError::NotShared(path.to_string())),
        };

        entries.remove(&name);
        info!("Stopped sharing \"{}\"", name);
        Ok(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// All shared files, ordered by name
    pub fn list_all(&self) -> Vec<SharedFile> {
        self.lock().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Open a shared file for streaming to another peer, returning the file and its size
    pub async fn open_for_serving(&self, name: &str) -> Result<(File, u64)> {
        let local_path = self
            .lock()
            .get(name)
            .map(|file| file.local_path.clone())
            .ok_or_else(|| P2pError::NotShared(name.to_string()))?;

        let file = File::open(&local_path).await?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(P2pError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", local_path.display()),
            )));
        }

        debug!(
            "Opened \"{}\" for serving ({} bytes)",
            name,
            metadata.len()
        );
        Ok((file, metadata.len()))
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, SharedFile>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Base name of a path, used as the network-wide file name
pub fn share_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(String::from)
        .ok_or_else(|| P2pError::InvalidPath(path.display().to_string()))
}
