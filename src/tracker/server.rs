use super::{AvailableEntry, PeerAddress};
use crate::error::{P2pError, Result};
use crate::wire::{try_read_message, write_message, Message};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Peers and announcements known to the Connection Manager
#[derive(Default)]
struct Directory {
    next_id: u64,
    /// Joined peers by session id (join order)
    peers: BTreeMap<u64, PeerAddress>,
    /// (session id, file name) in announcement order
    files: Vec<(u64, String)>,
}

impl Directory {
    fn register(&mut self, address: PeerAddress, names: Vec<String>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.peers.insert(id, address);
        for name in names {
            self.share(id, name);
        }
        id
    }

    fn unregister(&mut self, id: u64) -> Option<PeerAddress> {
        self.files.retain(|(owner, _)| *owner != id);
        self.peers.remove(&id)
    }

    fn share(&mut self, id: u64, name: String) {
        if !self.files.iter().any(|(owner, n)| *owner == id && *n == name) {
            self.files.push((id, name));
        }
    }

    fn unshare(&mut self, id: u64, name: &str) {
        self.files.retain(|(owner, n)| !(*owner == id && n == name));
    }

    /// Every peer except the requester
    fn peers_for(&self, id: u64) -> Vec<PeerAddress> {
        self.peers
            .iter()
            .filter(|(peer_id, _)| **peer_id != id)
            .map(|(_, address)| address.clone())
            .collect()
    }

    /// Every file not owned by the requester, oldest announcement first
    fn available_for(&self, id: u64) -> Vec<AvailableEntry> {
        self.files
            .iter()
            .filter(|(owner, _)| *owner != id)
            .filter_map(|(owner, name)| {
                self.peers.get(owner).map(|address| AvailableEntry {
                    name: name.clone(),
                    owner: address.clone(),
                })
            })
            .collect()
    }
}

/// Central discovery service: keeps the peer directory and the file index
pub struct ConnectionManager {
    listener: TcpListener,
    directory: Arc<Mutex<Directory>>,
}

impl ConnectionManager {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(P2pError::BindError)?;
        info!("Connection Manager listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            directory: Arc::new(Mutex::new(Directory::default())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept peers forever, one task per tracker connection
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept tracker connection: {}", e);
                    continue;
                }
            };

            let directory = self.directory.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_peer(stream, remote, directory).await {
                    warn!("Tracker session with {} ended: {}", remote, e);
                }
            });
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }
}

/// Run one peer's tracker session until LEAVE or disconnect
async fn serve_peer(
    mut stream: TcpStream,
    remote: SocketAddr,
    directory: Arc<Mutex<Directory>>,
) -> Result<()> {
    let Some(first) = try_read_message(&mut stream).await? else {
        return Ok(());
    };

    let (acceptor_port, shared_names) = match first {
        Message::Join {
            acceptor_port,
            shared_names,
        } => (acceptor_port, shared_names),
        other => {
            return Err(P2pError::ProtocolError(format!(
                "Expected JOIN, got {}",
                other.kind()
            )));
        }
    };

    let address = PeerAddress::from_socket(remote, acceptor_port);
    let (id, ack) = {
        let mut dir = directory.lock().unwrap_or_else(PoisonError::into_inner);
        let id = dir.register(address.clone(), shared_names);
        let ack = Message::JoinAck {
            peers: dir.peers_for(id),
            available: dir.available_for(id),
        };
        (id, ack)
    };
    info!("Peer {} joined", address);

    let result = session_loop(&mut stream, id, &ack, &directory).await;

    directory
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .unregister(id);
    info!("Peer {} left", address);

    result
}

async fn session_loop(
    stream: &mut TcpStream,
    id: u64,
    ack: &Message,
    directory: &Arc<Mutex<Directory>>,
) -> Result<()> {
    write_message(stream, ack).await?;

    while let Some(message) = try_read_message(stream).await? {
        let reply = {
            let mut dir = directory.lock().unwrap_or_else(PoisonError::into_inner);
            match message {
                Message::ShareAnnounce { name } => {
                    debug!("Peer {} shares \"{}\"", id, name);
                    dir.share(id, name);
                    None
                }
                Message::UnshareAnnounce { name } => {
                    debug!("Peer {} unshares \"{}\"", id, name);
                    dir.unshare(id, &name);
                    None
                }
                Message::ListPeersRequest => Some(Message::ListPeersResponse {
                    peers: dir.peers_for(id),
                }),
                Message::ListAvailableRequest => Some(Message::ListAvailableResponse {
                    available: dir.available_for(id),
                }),
                Message::Leave => {
                    // Drop the registration before acknowledging
                    dir.unregister(id);
                    Some(Message::LeaveAck)
                }
                other => {
                    return Err(P2pError::ProtocolError(format!(
                        "Unexpected {} during session",
                        other.kind()
                    )));
                }
            }
        };

        if let Some(reply) = reply {
            write_message(stream, &reply).await?;
            if reply == Message::LeaveAck {
                return Ok(());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_excludes_requester() {
        let mut dir = Directory::default();
        let a = dir.register(PeerAddress::new("10.0.0.1", 1), vec!["a.txt".to_string()]);
        let b = dir.register(PeerAddress::new("10.0.0.2", 2), vec!["b.txt".to_string()]);

        assert_eq!(dir.peers_for(a), vec![PeerAddress::new("10.0.0.2", 2)]);
        let available = dir.available_for(a);
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].name, "b.txt");
        assert_eq!(dir.available_for(b)[0].name, "a.txt");
    }

    #[test]
    fn test_directory_announcement_order() {
        let mut dir = Directory::default();
        let a = dir.register(PeerAddress::new("10.0.0.1", 1), Vec::new());
        let b = dir.register(PeerAddress::new("10.0.0.2", 2), Vec::new());
        let c = dir.register(PeerAddress::new("10.0.0.3", 3), Vec::new());

        dir.share(b, "x".to_string());
        dir.share(a, "x".to_string());
        dir.share(a, "x".to_string());

        let owners: Vec<_> = dir.available_for(c).into_iter().map(|e| e.owner.port).collect();
        assert_eq!(owners, vec![2, 1]);
    }

    #[test]
    fn test_directory_unshare_and_unregister() {
        let mut dir = Directory::default();
        let a = dir.register(
            PeerAddress::new("10.0.0.1", 1),
            vec!["a.txt".to_string(), "b.txt".to_string()],
        );
        let b = dir.register(PeerAddress::new("10.0.0.2", 2), Vec::new());

        dir.unshare(a, "a.txt");
        assert_eq!(dir.available_for(b).len(), 1);

        assert!(dir.unregister(a).is_some());
        assert!(dir.available_for(b).is_empty());
        assert!(dir.peers_for(b).is_empty());
    }

    #[tokio::test]
    async fn test_rejects_request_before_join() {
        let manager = ConnectionManager::bind("127.0.0.1:0").await.unwrap();
        let addr = manager.local_addr().unwrap();
        manager.spawn();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(&mut stream, &Message::ListPeersRequest).await.unwrap();

        // The manager closes the connection instead of answering
        assert!(try_read_message(&mut stream).await.unwrap().is_none());
    }
}
