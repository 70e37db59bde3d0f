use thiserror::Error;

#[derive(Error, Debug)]
pub enum P2pError {
    #[error("Connection Manager unreachable: {0}")]
    TrackerUnreachable(String),

    #[error("Not connected to a Connection Manager")]
    NotConnected,

    #[error("Already connected to a Connection Manager")]
    AlreadyConnected,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unable to bind acceptor socket: {0}")]
    BindError(#[source] std::io::Error),

    #[error("A file named \"{0}\" is already shared")]
    DuplicateShare(String),

    #[error("File is not shared: {0}")]
    NotShared(String),

    #[error("Invalid file path: {0}")]
    InvalidPath(String),

    #[error("File \"{0}\" is not available on the network")]
    FileNotAvailable(String),

    #[error("Download of \"{name}\" failed: {cause}")]
    Download {
        name: String,
        #[source]
        cause: DownloadError,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for P2pError {
    fn from(err: serde_json::Error) -> Self {
        P2pError::ProtocolError(err.to_string())
    }
}

impl P2pError {
    /// The specific failure behind a `Download` error, if this is one.
    pub fn download_cause(&self) -> Option<&DownloadError> {
        match self {
            P2pError::Download { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

/// Why a transfer from an owning peer failed.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("peer {0} is unreachable: {1}")]
    PeerUnreachable(String, String),

    #[error("owner is no longer sharing the file")]
    OwnerNoLongerSharing,

    #[error("transfer interrupted after {received} of {expected} bytes")]
    TruncatedTransfer { received: u64, expected: u64 },

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("unexpected reply from peer: {0}")]
    Protocol(String),

    #[error("local write failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, P2pError>;
