use crate::error::{P2pError, Result};
use crate::share::ShareRegistry;
use crate::wire::{read_message, write_message, Message};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// What one accept+serve cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The whole file was streamed
    Served { name: String, bytes: u64 },
    /// The requested name is not (or no longer) servable
    NotFound { name: String },
}

/// Inbound file server: owns the listening socket and answers one
/// FILE_REQUEST per accepted connection.
///
/// Once `close` has run, pending accepts and in-flight transfers end and the
/// listening socket is gone.
pub struct Acceptor {
    listener: RwLock<Option<TcpListener>>,
    port: u16,
    registry: Arc<ShareRegistry>,
    request_timeout: Duration,
    transfer_timeout: Duration,
    shutdown: watch::Sender<bool>,
}

impl Acceptor {
    /// Bind an ephemeral listening port on `host`
    pub async fn bind(
        host: &str,
        registry: Arc<ShareRegistry>,
        request_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind((host, 0))
            .await
            .map_err(P2pError::BindError)?;
        let addr = listener.local_addr()?;

        info!("Acceptor listening on {}", addr);

        Ok(Self {
            listener: RwLock::new(Some(listener)),
            port: addr.port(),
            registry,
            request_timeout,
            transfer_timeout,
            shutdown: watch::channel(false).0,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Accept one inbound connection and serve its single request.
    /// Fails with `NotConnected` once the acceptor is closed.
    pub async fn handle_connection(&self) -> Result<ServeOutcome> {
        let (stream, remote) = self.accept().await?;
        self.serve_until_closed(stream, remote).await
    }

    /// Stop accepting, abort in-flight transfers and drop the listening socket
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        // Pending accepts hold the read lock until they see the signal
        if self.listener.write().await.take().is_some() {
            debug!("Acceptor on port {} closed", self.port);
        }
    }

    async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let closed = self.shutdown.subscribe();
        let listener = self.listener.read().await;
        let listener = listener.as_ref().ok_or(P2pError::NotConnected)?;

        tokio::select! {
            _ = wait_closed(closed) => Err(P2pError::NotConnected),
            accepted = listener.accept() => {
                let (stream, remote) = accepted?;
                debug!("Accepted connection from {}", remote);
                Ok((stream, remote))
            }
        }
    }

    async fn serve_until_closed(&self, stream: TcpStream, remote: SocketAddr) -> Result<ServeOutcome> {
        let closed = self.shutdown.subscribe();
        tokio::select! {
            _ = wait_closed(closed) => {
                debug!("Dropping connection from {}: acceptor closed", remote);
                Err(P2pError::NotConnected)
            }
            outcome = self.serve(stream, remote) => outcome,
        }
    }

    async fn serve(&self, mut stream: TcpStream, remote: SocketAddr) -> Result<ServeOutcome> {
        let request = match timeout(self.request_timeout, read_message(&mut stream)).await {
            Ok(request) => request?,
            Err(_) => {
                return Err(P2pError::ProtocolError(format!(
                    "No request from {} within {:?}",
                    remote, self.request_timeout
                )));
            }
        };

        let name = match request {
            Message::FileRequest { name } => name,
            other => {
                return Err(P2pError::ProtocolError(format!(
                    "Expected FILE_REQUEST from {}, got {}",
                    remote,
                    other.kind()
                )));
            }
        };

        let outcome = match self.registry.open_for_serving(&name).await {
            Ok((file, size)) => {
                write_message(&mut stream, &Message::FileResponseOk { size }).await?;

                let bytes = self.send_body(file, size, &mut stream).await?;
                if bytes < size {
                    warn!(
                        "\"{}\" shrank while serving {}: sent {} of {} bytes",
                        name, remote, bytes, size
                    );
                }

                info!("Served \"{}\" to {} ({} bytes)", name, remote, bytes);
                ServeOutcome::Served { name, bytes }
            }
            Err(e) => {
                if !matches!(e, P2pError::NotShared(_)) {
                    warn!("Cannot serve \"{}\" to {}: {}", name, remote, e);
                }
                write_message(&mut stream, &Message::FileResponseNotFound).await?;

                info!("Told {} that \"{}\" is not shared", remote, name);
                ServeOutcome::NotFound { name }
            }
        };

        stream.shutdown().await?;
        Ok(outcome)
    }

    /// Stream up to `size` bytes of `file`. Every write is bounded by the
    /// transfer timeout so a reader that stops draining is dropped.
    async fn send_body(&self, mut file: File, size: u64, stream: &mut TcpStream) -> Result<u64> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;

        while sent < size {
            let want = std::cmp::min(CHUNK_SIZE as u64, size - sent) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }

            match timeout(self.transfer_timeout, stream.write_all(&buf[..n])).await {
                Ok(written) => written?,
                Err(_) => {
                    return Err(P2pError::IoError(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("peer stopped reading after {} of {} bytes", sent, size),
                    )));
                }
            }
            sent += n as u64;
        }

        Ok(sent)
    }

    /// Run the accept loop on its own task. Each accepted connection is
    /// served on a task of its own.
    pub fn spawn(self: Arc<Self>) -> AcceptorHandle {
        let acceptor = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, remote) = match acceptor.accept().await {
                    Ok(accepted) => accepted,
                    Err(P2pError::NotConnected) => break,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                let server = acceptor.clone();
                tokio::spawn(async move {
                    match server.serve_until_closed(stream, remote).await {
                        Ok(_) | Err(P2pError::NotConnected) => {}
                        Err(e) => warn!("Inbound connection from {} failed: {}", remote, e),
                    }
                });
            }
            debug!("Acceptor loop stopped");
        });

        AcceptorHandle {
            acceptor: self,
            task: Some(task),
        }
    }
}

/// Resolves once the shutdown flag is set
async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let stop = *closed.borrow_and_update();
        if stop || closed.changed().await.is_err() {
            return;
        }
    }
}

/// Owns the accept loop. `stop` closes the acceptor, so the listening socket
/// is gone when it returns.
pub struct AcceptorHandle {
    acceptor: Arc<Acceptor>,
    task: Option<JoinHandle<()>>,
}

impl AcceptorHandle {
    pub async fn stop(mut self) {
        self.acceptor.close().await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Acceptor task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for AcceptorHandle {
    fn drop(&mut self) {
        self.acceptor.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::try_read_message;
    use std::path::Path;
    use tempfile::TempDir;

    async fn acceptor_with(registry: Arc<ShareRegistry>) -> Acceptor {
        Acceptor::bind(
            "127.0.0.1",
            registry,
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .await
        .unwrap()
    }

    fn shared(dir: &Path, files: &[(&str, &[u8])]) -> Arc<ShareRegistry> {
        let registry = Arc::new(ShareRegistry::new());
        for (name, content) in files {
            let path = dir.join(name);
            std::fs::write(&path, content).unwrap();
            registry.add(&path).unwrap();
        }
        registry
    }

    async fn request(port: u16, name: &str) -> (TcpStream, Message) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = Message::FileRequest {
            name: name.to_string(),
        };
        write_message(&mut stream, &request).await.unwrap();
        let reply = read_message(&mut stream).await.unwrap();
        (stream, reply)
    }

    #[tokio::test]
    async fn test_serves_shared_file() {
        let temp = TempDir::new().unwrap();
        let acceptor = acceptor_with(shared(temp.path(), &[("hello.txt", &b"hello peer"[..])])).await;
        let port = acceptor.local_port();

        let client = tokio::spawn(async move {
            let (mut stream, reply) = request(port, "hello.txt").await;
            let mut body = Vec::new();
            stream.read_to_end(&mut body).await.unwrap();
            (reply, body)
        });

        let outcome = acceptor.handle_connection().await.unwrap();
        assert_eq!(
            outcome,
            ServeOutcome::Served {
                name: "hello.txt".to_string(),
                bytes: 10
            }
        );

        let (reply, body) = client.await.unwrap();
        assert_eq!(reply, Message::FileResponseOk { size: 10 });
        assert_eq!(body, b"hello peer");
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_found() {
        let acceptor = acceptor_with(Arc::new(ShareRegistry::new())).await;
        let port = acceptor.local_port();

        let client = tokio::spawn(async move {
            let (mut stream, reply) = request(port, "nope.txt").await;
            let after = try_read_message(&mut stream).await.unwrap();
            (reply, after)
        });

        let outcome = acceptor.handle_connection().await.unwrap();
        assert!(matches!(outcome, ServeOutcome::NotFound { .. }));

        let (reply, after) = client.await.unwrap();
        assert_eq!(reply, Message::FileResponseNotFound);
        assert!(after.is_none());
    }

    #[tokio::test]
    async fn test_loop_survives_bad_connection_and_stops() {
        let temp = TempDir::new().unwrap();
        let acceptor = Arc::new(acceptor_with(shared(temp.path(), &[("a.txt", &b"abc"[..])])).await);
        let port = acceptor.local_port();
        let handle = acceptor.clone().spawn();

        // Garbage frame: the loop logs it and keeps going
        let mut bad = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        bad.write_all(&[0, 0, 0, 3, b'x', b'y', b'z']).await.unwrap();
        let mut sink = Vec::new();
        let _ = bad.read_to_end(&mut sink).await;

        let (_good, reply) = request(port, "a.txt").await;
        assert_eq!(reply, Message::FileResponseOk { size: 3 });

        handle.stop().await;

        // Closed even though `acceptor` is still alive
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
        assert!(matches!(
            acceptor.handle_connection().await,
            Err(P2pError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_accept() {
        let acceptor = Arc::new(acceptor_with(Arc::new(ShareRegistry::new())).await);
        let port = acceptor.local_port();

        let pending = tokio::spawn({
            let acceptor = acceptor.clone();
            async move { acceptor.handle_connection().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), acceptor.close())
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(result, Err(P2pError::NotConnected)));
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_stalled_reader_does_not_block_other_peers() {
        let temp = TempDir::new().unwrap();
        let big = vec![7u8; 32 * 1024 * 1024];
        let registry = shared(temp.path(), &[("big.bin", big.as_slice()), ("small.txt", &b"small"[..])]);
        let acceptor = Arc::new(acceptor_with(registry).await);
        let port = acceptor.local_port();
        let handle = acceptor.clone().spawn();

        // Asks for the big file and never reads the body
        let (_stalled, reply) = request(port, "big.bin").await;
        assert_eq!(reply, Message::FileResponseOk { size: big.len() as u64 });

        let fetched = tokio::time::timeout(Duration::from_secs(2), async {
            let (mut stream, reply) = request(port, "small.txt").await;
            let mut body = Vec::new();
            stream.read_to_end(&mut body).await.unwrap();
            (reply, body)
        })
        .await
        .expect("second peer was blocked by the stalled one");

        assert_eq!(fetched.0, Message::FileResponseOk { size: 5 });
        assert_eq!(fetched.1, b"small");

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stalled_reader_times_out() {
        let temp = TempDir::new().unwrap();
        let big = vec![7u8; 32 * 1024 * 1024];
        let acceptor = Acceptor::bind(
            "127.0.0.1",
            shared(temp.path(), &[("big.bin", big.as_slice())]),
            Duration::from_secs(2),
            Duration::from_millis(300),
        )
        .await
        .unwrap();
        let port = acceptor.local_port();

        let (release, released) = tokio::sync::oneshot::channel();
        let client = tokio::spawn(async move {
            let (stream, _reply) = request(port, "big.bin").await;
            // Hold the connection open without reading
            let _ = released.await;
            drop(stream);
        });

        let result = tokio::time::timeout(Duration::from_secs(10), acceptor.handle_connection())
            .await
            .expect("body write was not bounded");
        assert!(matches!(result, Err(P2pError::IoError(ref e)) if e.kind() == io::ErrorKind::TimedOut));

        let _ = release.send(());
        client.await.unwrap();
    }
}
