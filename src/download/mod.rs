use crate::error::{DownloadError, P2pError, Result};
use crate::peer::{FileReply, PeerConnection};
use crate::storage::{validate_name, StorageManager};
use crate::tracker::PeerAddress;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Retrieves single files from the peers that own them
pub struct DownloadManager {
    storage: StorageManager,
    connect_timeout: Duration,
    transfer_timeout: Duration,
}

impl DownloadManager {
    pub fn new<P: AsRef<Path>>(
        download_dir: P,
        connect_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            storage: StorageManager::new(download_dir),
            connect_timeout,
            transfer_timeout,
        }
    }

    pub fn download_dir(&self) -> &Path {
        self.storage.download_dir()
    }

    /// Fetch `name` from `owner` into the downloads directory.
    ///
    /// Any failure after the name is validated is reported as
    /// `P2pError::Download` carrying the specific cause.
    pub async fn fetch(&self, name: &str, owner: &PeerAddress) -> Result<PathBuf> {
        validate_name(name)?;

        let started = Instant::now();
        match self.transfer(name, owner).await {
            Ok(path) => {
                info!(
                    "Downloaded \"{}\" from {} in {} ms",
                    name,
                    owner,
                    started.elapsed().as_millis()
                );
                Ok(path)
            }
            Err(cause) => {
                warn!("Download of \"{}\" from {} failed: {}", name, owner, cause);
                Err(P2pError::Download {
                    name: name.to_string(),
                    cause,
                })
            }
        }
    }

    async fn transfer(&self, name: &str, owner: &PeerAddress) -> std::result::Result<PathBuf, DownloadError> {
        let mut conn = PeerConnection::connect(owner, self.connect_timeout, self.transfer_timeout).await?;

        let size = match conn.request_file(name).await? {
            FileReply::Found(size) => size,
            FileReply::NotFound => return Err(DownloadError::OwnerNoLongerSharing),
        };

        let mut staged = self.storage.stage(name).await.map_err(local_failure)?;
        match conn.receive_body(size, &mut staged.file).await {
            Ok(_) => self.storage.commit(staged).await.map_err(local_failure),
            Err(e) => {
                self.storage.discard(staged);
                Err(e)
            }
        }
    }
}

fn local_failure(err: P2pError) -> DownloadError {
    match err {
        P2pError::IoError(e) => DownloadError::Io(e),
        other => DownloadError::Protocol(other.to_string()),
    }
}
