use crate::error::{P2pError, Result};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Manages the downloads directory.
///
/// Transfers are written to a hidden staging file and only renamed onto
/// `<download_dir>/<name>` once complete, so a failed transfer never leaves
/// a partial file at the destination.
pub struct StorageManager {
    /// Base directory for downloads
    download_dir: PathBuf,
}

/// A download in progress. Dropping it before `commit` deletes the staging
/// file, including when the download task is aborted.
pub struct StagedFile {
    pub name: String,
    pub path: PathBuf,
    pub file: File,
    committed: bool,
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Discarded partial download of \"{}\"", self.name),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {:?}: {}", self.path, e),
        }
    }
}

impl StorageManager {
    pub fn new<P: AsRef<Path>>(download_dir: P) -> Self {
        Self {
            download_dir: download_dir.as_ref().to_path_buf(),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Create a fresh staging file for `name`
    pub async fn stage(&self, name: &str) -> Result<StagedFile> {
        validate_name(name)?;
        fs::create_dir_all(&self.download_dir).await?;

        let suffix = hex::encode(rand::random::<[u8; 6]>());
        let path = self.download_dir.join(format!(".{}.{}.part", name, suffix));

        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await?;

        debug!("Staging download of \"{}\" at {:?}", name, path);

        Ok(StagedFile {
            name: name.to_string(),
            path,
            file,
            committed: false,
        })
    }

    /// Flush a completed staging file and move it onto its final path.
    /// On failure the staging file is removed.
    pub async fn commit(&self, mut staged: StagedFile) -> Result<PathBuf> {
        staged.file.flush().await?;
        staged.file.sync_all().await?;

        let destination = self.download_dir.join(&staged.name);
        fs::rename(&staged.path, &destination).await?;
        staged.committed = true;

        info!("Saved \"{}\" to {:?}", staged.name, destination);
        Ok(destination)
    }

    /// Delete a staging file after a failed transfer
    pub fn discard(&self, staged: StagedFile) {
        drop(staged);
    }
}

/// A remote file name must be a single plain path component
pub fn validate_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == name => Ok(()),
        _ => Err(P2pError::InvalidPath(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("report.pdf").is_ok());
        assert!(validate_name("../etc/passwd").is_err());
        assert!(validate_name("sub/dir.txt").is_err());
        assert!(validate_name("/abs").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("").is_err());
    }

    #[tokio::test]
    async fn test_commit_moves_into_place() {
        let temp = TempDir::new().unwrap();
        let storage = StorageManager::new(temp.path().join("downloads"));

        let mut staged = storage.stage("data.bin").await.unwrap();
        staged.file.write_all(b"payload").await.unwrap();
        let path = storage.commit(staged).await.unwrap();

        assert_eq!(path, temp.path().join("downloads").join("data.bin"));
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        assert_eq!(entries(storage.download_dir()), vec!["data.bin"]);
    }

    #[tokio::test]
    async fn test_discard_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let storage = StorageManager::new(temp.path());

        let mut staged = storage.stage("data.bin").await.unwrap();
        staged.file.write_all(b"partial").await.unwrap();
        storage.discard(staged);

        assert!(entries(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_stages_do_not_collide() {
        let temp = TempDir::new().unwrap();
        let storage = StorageManager::new(temp.path());

        let first = storage.stage("same.txt").await.unwrap();
        let second = storage.stage("same.txt").await.unwrap();
        assert_ne!(first.path, second.path);
    }

    #[tokio::test]
    async fn test_dropped_stage_is_removed() {
        let temp = TempDir::new().unwrap();
        let storage = StorageManager::new(temp.path());

        let mut staged = storage.stage("data.bin").await.unwrap();
        staged.file.write_all(b"half").await.unwrap();
        assert_eq!(entries(temp.path()).len(), 1);

        drop(staged);
        assert!(entries(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_removes_stage() {
        let temp = TempDir::new().unwrap();
        let storage = StorageManager::new(temp.path());
        // A directory in the way makes the rename fail
        std::fs::create_dir(temp.path().join("data.bin")).unwrap();
        std::fs::write(temp.path().join("data.bin").join("keep"), b"x").unwrap();

        let staged = storage.stage("data.bin").await.unwrap();
        assert!(storage.commit(staged).await.is_err());
        assert_eq!(entries(temp.path()), vec!["data.bin"]);
    }
}
