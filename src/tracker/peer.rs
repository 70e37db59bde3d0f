use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// A reachable peer endpoint: the host a peer was seen at plus its acceptor port
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address of a peer seen on `addr`, listening on `acceptor_port`
    pub fn from_socket(addr: SocketAddr, acceptor_port: u16) -> Self {
        Self::new(addr.ip().to_string(), acceptor_port)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in \"{}\"", s))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port in \"{}\"", s))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("missing host in \"{}\"", s));
        }

        Ok(Self::new(host, port))
    }
}

/// One entry of the tracker-reported file index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableEntry {
    pub name: String,
    pub owner: PeerAddress,
}
