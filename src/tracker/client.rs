use super::{AvailableEntry, PeerAddress};
use crate::error::{P2pError, Result};
use crate::wire::{read_message, write_message, Message};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Network-wide file index: file name to the peer offering it
pub type AvailableIndex = BTreeMap<String, PeerAddress>;

/// Open connection to the Connection Manager
struct TrackerSession {
    stream: TcpStream,
    tracker: String,
    /// Set once a round trip fails. The stream is closed and stays unused
    /// until the session is left.
    broken: Option<String>,
}

impl TrackerSession {
    fn usable(&mut self) -> Result<&mut Self> {
        if let Some(reason) = self.broken.clone() {
            return Err(P2pError::TrackerUnreachable(format!(
                "{}: connection lost ({}), leave and join again",
                self.tracker, reason
            )));
        }
        Ok(self)
    }

    /// Close the stream so a late reply can never be read as the answer to
    /// a later request
    async fn break_off(&mut self, cause: &P2pError) {
        warn!("Closing connection to {} after failure: {}", self.tracker, cause);
        if let Err(e) = self.stream.shutdown().await {
            debug!("Tracker connection shutdown: {}", e);
        }
        self.broken = Some(cause.to_string());
    }
}

/// Client side of the Connection Manager protocol.
///
/// All round trips share one persistent connection, so the session lock is
/// held from request write until the reply is read. A failed round trip
/// leaves the connection in an unknown position, so it is closed and every
/// later call fails with `TrackerUnreachable` until `leave`. Peer list and file index
/// are published as immutable snapshots that readers clone cheaply.
pub struct TrackerClient {
    session: Mutex<Option<TrackerSession>>,
    peers: RwLock<Arc<Vec<PeerAddress>>>,
    available: RwLock<Arc<AvailableIndex>>,
    connect_timeout: Duration,
    request_timeout: Duration,
    leave_timeout: Duration,
}

impl TrackerClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration, leave_timeout: Duration) -> Self {
        Self {
            session: Mutex::new(None),
            peers: RwLock::new(Arc::new(Vec::new())),
            available: RwLock::new(Arc::new(AvailableIndex::new())),
            connect_timeout,
            request_timeout,
            leave_timeout,
        }
    }

    /// Open a session with the tracker and announce our acceptor port and shares
    pub async fn join(
        &self,
        host: &str,
        port: u16,
        acceptor_port: u16,
        shared_names: Vec<String>,
    ) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(P2pError::AlreadyConnected);
        }

        let tracker = format!("{}:{}", host, port);
        info!("Joining network via Connection Manager at {}", tracker);

        let mut stream = match timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(P2pError::TrackerUnreachable(format!("{}: {}", tracker, e)));
            }
            Err(_) => {
                return Err(P2pError::TrackerUnreachable(format!(
                    "{}: connect timed out after {:?}",
                    tracker, self.connect_timeout
                )));
            }
        };

        let join = Message::Join {
            acceptor_port,
            shared_names,
        };
        let reply = exchange(&mut stream, &join, self.request_timeout, &tracker).await?;

        let (peers, available) = match reply {
            Message::JoinAck { peers, available } => (peers, available),
            other => {
                return Err(P2pError::ProtocolError(format!(
                    "Expected JOIN_ACK, got {}",
                    other.kind()
                )));
            }
        };

        info!(
            "Joined network: {} peers, {} available files",
            peers.len(),
            available.len()
        );

        self.store_peers(peers);
        self.store_available(index_from_entries(available));
        *session = Some(TrackerSession {
            stream,
            tracker,
            broken: None,
        });

        Ok(())
    }

    /// Close the session. Best effort: waits a bounded time for LEAVE_ACK and
    /// tears down local state whatever the tracker does.
    pub async fn leave(&self) {
        let mut session = self.session.lock().await;
        let Some(mut active) = session.take() else {
            debug!("Leave requested without an active session");
            return;
        };

        if active.broken.is_some() {
            debug!("Tracker connection already closed, skipping LEAVE");
        } else {
            match write_message(&mut active.stream, &Message::Leave).await {
                Ok(()) => match timeout(self.leave_timeout, read_message(&mut active.stream)).await {
                    Ok(Ok(Message::LeaveAck)) => debug!("Received LEAVE_ACK from {}", active.tracker),
                    Ok(Ok(other)) => warn!("Unexpected {} in reply to LEAVE", other.kind()),
                    Ok(Err(e)) => warn!("Failed to read LEAVE_ACK from {}: {}", active.tracker, e),
                    Err(_) => warn!(
                        "No LEAVE_ACK from {} within {:?}",
                        active.tracker, self.leave_timeout
                    ),
                },
                Err(e) => warn!("Failed to send LEAVE to {}: {}", active.tracker, e),
            }

            if let Err(e) = active.stream.shutdown().await {
                debug!("Tracker connection shutdown: {}", e);
            }
        }

        self.store_peers(Vec::new());
        self.store_available(AvailableIndex::new());

        info!("Left network at {}", active.tracker);
    }

    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Fetch the current peer list from the tracker
    pub async fn list_peers(&self) -> Result<Vec<PeerAddress>> {
        let peers = self
            .request(&Message::ListPeersRequest, |reply| match reply {
                Message::ListPeersResponse { peers } => Ok(peers),
                other => Err(other),
            })
            .await?;

        debug!("Tracker reported {} peers", peers.len());
        self.store_peers(peers.clone());
        Ok(peers)
    }

    /// Fetch the file index from the tracker and publish it as the new snapshot
    pub async fn list_available(&self) -> Result<Arc<AvailableIndex>> {
        let available = self
            .request(&Message::ListAvailableRequest, |reply| match reply {
                Message::ListAvailableResponse { available } => Ok(available),
                other => Err(other),
            })
            .await?;

        let index = Arc::new(index_from_entries(available));
        debug!("Tracker reported {} available files", index.len());
        *self.available.write().unwrap_or_else(PoisonError::into_inner) = index.clone();
        Ok(index)
    }

    pub async fn announce_share(&self, name: &str) -> Result<()> {
        self.send(&Message::ShareAnnounce {
            name: name.to_string(),
        })
        .await
    }

    pub async fn announce_unshare(&self, name: &str) -> Result<()> {
        self.send(&Message::UnshareAnnounce {
            name: name.to_string(),
        })
        .await
    }

    /// Peer list as of the last join or refresh
    pub fn cached_peers(&self) -> Arc<Vec<PeerAddress>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// File index as of the last join or refresh
    pub fn cached_available(&self) -> Arc<AvailableIndex> {
        self.available.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Round trip on the session. `decode` hands back replies of the wrong
    /// kind, which break the session like any other failure.
    async fn request<T, F>(&self, message: &Message, decode: F) -> Result<T>
    where
        F: FnOnce(Message) -> std::result::Result<T, Message>,
    {
        let mut session = self.session.lock().await;
        let active = session.as_mut().ok_or(P2pError::NotConnected)?.usable()?;

        let failure = match exchange(&mut active.stream, message, self.request_timeout, &active.tracker).await {
            Ok(reply) => match decode(reply) {
                Ok(value) => return Ok(value),
                Err(other) => P2pError::ProtocolError(format!(
                    "Unexpected {} in reply to {}",
                    other.kind(),
                    message.kind()
                )),
            },
            Err(e) => e,
        };

        active.break_off(&failure).await;
        Err(failure)
    }

    /// Fire-and-forget: the tracker does not acknowledge announcements
    async fn send(&self, message: &Message) -> Result<()> {
        let mut session = self.session.lock().await;
        let active = session.as_mut().ok_or(P2pError::NotConnected)?.usable()?;

        if let Err(e) = write_message(&mut active.stream, message).await {
            let failure = unreachable(&active.tracker, e);
            active.break_off(&failure).await;
            return Err(failure);
        }
        Ok(())
    }

    fn store_peers(&self, peers: Vec<PeerAddress>) {
        *self.peers.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(peers);
    }

    fn store_available(&self, index: AvailableIndex) {
        *self.available.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(index);
    }
}

/// One request/response round trip on the tracker connection
async fn exchange(
    stream: &mut TcpStream,
    request: &Message,
    wait: Duration,
    tracker: &str,
) -> Result<Message> {
    write_message(stream, request)
        .await
        .map_err(|e| unreachable(tracker, e))?;

    match timeout(wait, read_message(stream)).await {
        Ok(reply) => reply.map_err(|e| unreachable(tracker, e)),
        Err(_) => Err(P2pError::TrackerUnreachable(format!(
            "{}: no reply to {} within {:?}",
            tracker,
            request.kind(),
            wait
        ))),
    }
}

fn unreachable(tracker: &str, err: P2pError) -> P2pError {
    match err {
        P2pError::IoError(e) => P2pError::TrackerUnreachable(format!("{}: {}", tracker, e)),
        other => other,
    }
}

/// Collapse tracker entries into an index. A name listed by several owners
/// keeps the one listed last.
fn index_from_entries(entries: Vec<AvailableEntry>) -> AvailableIndex {
    let mut index = AvailableIndex::new();
    for entry in entries {
        if let Some(previous) = index.insert(entry.name.clone(), entry.owner) {
            debug!("\"{}\" also offered by {}, keeping latest owner", entry.name, previous);
        }
    }
    index
}
