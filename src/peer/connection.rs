use crate::error::{DownloadError, P2pError};
use crate::tracker::PeerAddress;
use crate::wire::{read_message, write_message, Message};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

const CHUNK_SIZE: usize = 64 * 1024;

/// Outcome of a FILE_REQUEST
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileReply {
    /// The owner is sending this many bytes
    Found(u64),
    NotFound,
}

/// One-shot connection to a peer's acceptor, used to fetch a single file
pub struct PeerConnection {
    addr: PeerAddress,
    stream: TcpStream,
    read_timeout: Duration,
}

impl PeerConnection {
    /// Connect to a peer, bounding the connect phase
    pub async fn connect(
        addr: &PeerAddress,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, DownloadError> {
        info!("Connecting to peer: {}", addr);

        let stream = match timeout(
            connect_timeout,
            TcpStream::connect((addr.host.as_str(), addr.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(DownloadError::PeerUnreachable(addr.to_string(), e.to_string()));
            }
            Err(_) => return Err(DownloadError::Timeout("connecting to peer")),
        };

        Ok(Self {
            addr: addr.clone(),
            stream,
            read_timeout,
        })
    }

    /// Ask for `name` and wait for the owner's answer
    pub async fn request_file(&mut self, name: &str) -> Result<FileReply, DownloadError> {
        let request = Message::FileRequest {
            name: name.to_string(),
        };
        write_message(&mut self.stream, &request)
            .await
            .map_err(|e| self.failure(e))?;

        let reply = match timeout(self.read_timeout, read_message(&mut self.stream)).await {
            Ok(reply) => reply.map_err(|e| self.failure(e))?,
            Err(_) => return Err(DownloadError::Timeout("waiting for file response")),
        };

        debug!("Peer {} answered {} for \"{}\"", self.addr, reply.kind(), name);

        match reply {
            Message::FileResponseOk { size } => Ok(FileReply::Found(size)),
            Message::FileResponseNotFound => Ok(FileReply::NotFound),
            other => Err(DownloadError::Protocol(format!(
                "expected file response, got {}",
                other.kind()
            ))),
        }
    }

    /// Copy exactly `size` body bytes into `dest`. Every read is bounded by
    /// the read timeout; an early close is a truncated transfer.
    pub async fn receive_body<W>(&mut self, size: u64, dest: &mut W) -> Result<u64, DownloadError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;

        while received < size {
            let want = std::cmp::min(CHUNK_SIZE as u64, size - received) as usize;
            let n = match timeout(self.read_timeout, self.stream.read(&mut buf[..want])).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!("Read from {} failed: {}", self.addr, e);
                    0
                }
                Err(_) => return Err(DownloadError::Timeout("receiving file data")),
            };

            if n == 0 {
                return Err(DownloadError::TruncatedTransfer {
                    received,
                    expected: size,
                });
            }

            dest.write_all(&buf[..n]).await?;
            received += n as u64;
        }

        debug!("Received {} bytes from {}", received, self.addr);
        Ok(received)
    }

    fn failure(&self, err: P2pError) -> DownloadError {
        match err {
            P2pError::IoError(e) => DownloadError::PeerUnreachable(self.addr.to_string(), e.to_string()),
            other => DownloadError::Protocol(other.to_string()),
        }
    }
}
