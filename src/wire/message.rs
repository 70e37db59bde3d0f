use crate::error::{P2pError, Result};
use crate::tracker::{AvailableEntry, PeerAddress};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Messages exchanged with the Connection Manager and between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Register with the tracker
    Join {
        acceptor_port: u16,
        shared_names: Vec<String>,
    },
    /// Tracker's reply to a join
    JoinAck {
        peers: Vec<PeerAddress>,
        available: Vec<AvailableEntry>,
    },
    Leave,
    LeaveAck,
    /// A file became available from the sender
    ShareAnnounce { name: String },
    /// A file is no longer available from the sender
    UnshareAnnounce { name: String },
    ListPeersRequest,
    ListPeersResponse { peers: Vec<PeerAddress> },
    ListAvailableRequest,
    ListAvailableResponse { available: Vec<AvailableEntry> },
    /// Ask a peer for the content of one shared file
    FileRequest { name: String },
    /// `size` raw bytes follow this frame
    FileResponseOk { size: u64 },
    FileResponseNotFound,
}

impl Message {
    /// Serialize message to a frame
    /// Format: <length prefix><JSON payload>
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(self)?;
        if payload.len() > super::MAX_FRAME_LEN {
            return Err(P2pError::ProtocolError(format!(
                "Message too large: {} bytes",
                payload.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.to_vec())
    }

    /// Deserialize a message from a frame payload (without length prefix)
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Tag used on the wire, for log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join { .. } => "JOIN",
            Message::JoinAck { .. } => "JOIN_ACK",
            Message::Leave => "LEAVE",
            Message::LeaveAck => "LEAVE_ACK",
            Message::ShareAnnounce { .. } => "SHARE_ANNOUNCE",
            Message::UnshareAnnounce { .. } => "UNSHARE_ANNOUNCE",
            Message::ListPeersRequest => "LIST_PEERS_REQUEST",
            Message::ListPeersResponse { .. } => "LIST_PEERS_RESPONSE",
            Message::ListAvailableRequest => "LIST_AVAILABLE_REQUEST",
            Message::ListAvailableResponse { .. } => "LIST_AVAILABLE_RESPONSE",
            Message::FileRequest { .. } => "FILE_REQUEST",
            Message::FileResponseOk { .. } => "FILE_RESPONSE_OK",
            Message::FileResponseNotFound => "FILE_RESPONSE_NOT_FOUND",
        }
    }
}
