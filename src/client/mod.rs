use crate::download::DownloadManager;
use crate::error::{P2pError, Result};
use crate::peer::{Acceptor, AcceptorHandle, ServeOutcome};
use crate::share::{SharedFile, ShareRegistry};
use crate::storage::validate_name;
use crate::tracker::{AvailableIndex, TrackerClient};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for a peer
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Where downloaded files are written
    pub download_dir: PathBuf,
    /// Interface the acceptor binds to
    pub bind_host: String,
    /// Bound on TCP connects to the tracker and to peers
    pub connect_timeout: Duration,
    /// Bound on each tracker reply
    pub request_timeout: Duration,
    /// Bound on the LEAVE_ACK wait
    pub leave_timeout: Duration,
    /// Bound on each read from a peer during a transfer
    pub transfer_timeout: Duration,
    /// Refresh the available-file index before resolving a download
    pub refresh_before_download: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            bind_host: "0.0.0.0".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            leave_timeout: Duration::from_secs(2),
            transfer_timeout: Duration::from_secs(30),
            refresh_before_download: true,
        }
    }
}

/// State that exists only while joined
struct NetworkSession {
    tracker_addr: String,
    tracker_port: u16,
    acceptor: Arc<Acceptor>,
    acceptor_task: AcceptorHandle,
}

/// Peer core: owns the tracker session, share registry, acceptor and downloads.
///
/// Share it behind an `Arc` between the presentation layer and any tasks
/// that need it; all internal state is locked.
pub struct PeerClient {
    config: ClientConfig,
    registry: Arc<ShareRegistry>,
    tracker: TrackerClient,
    downloads: DownloadManager,
    session: Mutex<Option<NetworkSession>>,
}

impl PeerClient {
    pub fn new(config: ClientConfig) -> Self {
        let tracker = TrackerClient::new(
            config.connect_timeout,
            config.request_timeout,
            config.leave_timeout,
        );
        let downloads = DownloadManager::new(
            &config.download_dir,
            config.connect_timeout,
            config.transfer_timeout,
        );

        Self {
            config,
            registry: Arc::new(ShareRegistry::new()),
            tracker,
            downloads,
            session: Mutex::new(None),
        }
    }

    /// Bind the acceptor, register with the Connection Manager and start serving
    pub async fn join_network(&self, address: &str, port: u16) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(P2pError::AlreadyConnected);
        }

        let acceptor = Acceptor::bind(
            &self.config.bind_host,
            self.registry.clone(),
            self.config.request_timeout,
            self.config.transfer_timeout,
        )
        .await?;
        let acceptor_port = acceptor.local_port();

        self.tracker
            .join(address, port, acceptor_port, self.registry.names())
            .await?;

        let acceptor = Arc::new(acceptor);
        let acceptor_task = acceptor.clone().spawn();
        *session = Some(NetworkSession {
            tracker_addr: address.to_string(),
            tracker_port: port,
            acceptor,
            acceptor_task,
        });

        info!(
            "Connected to Connection Manager at {}:{}, serving on port {}",
            address, port, acceptor_port
        );
        Ok(())
    }

    /// Leave the network. Never fails; a no-op when not joined. The acceptor
    /// is closed by the time this returns.
    pub async fn leave_network(&self) {
        let mut session = self.session.lock().await;
        let Some(active) = session.take() else {
            debug!("Not connected, nothing to leave");
            return;
        };

        self.tracker.leave().await;
        active.acceptor_task.stop().await;

        info!(
            "Disconnected from Connection Manager at {}:{}",
            active.tracker_addr, active.tracker_port
        );
    }

    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub async fn get_acceptor_port(&self) -> Result<String> {
        let session = self.session.lock().await;
        let active = session.as_ref().ok_or(P2pError::NotConnected)?;
        Ok(active.acceptor.local_port().to_string())
    }

    /// Peers currently known to the tracker, as display strings
    pub async fn get_peers_list(&self) -> Result<Vec<String>> {
        let peers = self.tracker.list_peers().await?;
        Ok(peers.iter().map(ToString::to_string).collect())
    }

    /// Names of the files this peer shares
    pub fn get_shared_files_list(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn shared_files(&self) -> Vec<SharedFile> {
        self.registry.list_all()
    }

    /// Fresh file index from the tracker: name to owner display string
    pub async fn get_available_list(&self) -> Result<BTreeMap<String, String>> {
        let index = self.tracker.list_available().await?;
        Ok(index
            .iter()
            .map(|(name, owner)| (name.clone(), owner.to_string()))
            .collect())
    }

    /// Share a local file. Announced right away when joined; otherwise it is
    /// sent with the next join.
    pub async fn add_share_file<P: AsRef<Path>>(&self, path: P) -> Result<String> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(P2pError::InvalidPath(path.display().to_string()));
        }

        let name = self.registry.add(path)?;
        match self.tracker.announce_share(&name).await {
            Ok(()) => debug!("Announced \"{}\"", name),
            Err(P2pError::NotConnected) => debug!("\"{}\" staged until the next join", name),
            Err(e) => warn!("Failed to announce \"{}\": {}", name, e),
        }

        Ok(name)
    }

    /// Stop sharing a file, given its local path or its name
    pub async fn rem_share_file(&self, path: &str) -> Result<String> {
        let name = self.registry.remove(path)?;
        match self.tracker.announce_unshare(&name).await {
            Ok(()) => debug!("Announced removal of \"{}\"", name),
            Err(P2pError::NotConnected) => {}
            Err(e) => warn!("Failed to announce removal of \"{}\": {}", name, e),
        }

        Ok(name)
    }

    /// Resolve `name` to its owner and download it into the downloads directory
    pub async fn download_available_file(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;

        let index = self.resolve_index().await;
        let owner = index
            .get(name)
            .cloned()
            .ok_or_else(|| P2pError::FileNotAvailable(name.to_string()))?;

        info!("Downloading \"{}\" from {}", name, owner);
        self.downloads.fetch(name, &owner).await
    }

    /// Run a download on its own task; the handle yields its outcome
    pub fn spawn_download(self: &Arc<Self>, name: impl Into<String>) -> JoinHandle<Result<PathBuf>> {
        let client = self.clone();
        let name = name.into();
        tokio::spawn(async move { client.download_available_file(&name).await })
    }

    /// Serve exactly one inbound connection. A pending call ends with
    /// `NotConnected` when the peer leaves.
    pub async fn handle_connection(&self) -> Result<ServeOutcome> {
        let acceptor = {
            let session = self.session.lock().await;
            session
                .as_ref()
                .map(|active| active.acceptor.clone())
                .ok_or(P2pError::NotConnected)?
        };

        acceptor.handle_connection().await
    }

    pub fn download_dir(&self) -> &Path {
        self.downloads.download_dir()
    }

    /// Index to resolve a download against: refreshed when possible,
    /// otherwise the last snapshot
    async fn resolve_index(&self) -> Arc<AvailableIndex> {
        if !self.config.refresh_before_download {
            return self.tracker.cached_available();
        }

        match self.tracker.list_available().await {
            Ok(index) => index,
            Err(P2pError::NotConnected) => self.tracker.cached_available(),
            Err(e) => {
                warn!("Index refresh failed, using cached snapshot: {}", e);
                self.tracker.cached_available()
            }
        }
    }
}
