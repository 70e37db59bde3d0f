//! Peer-to-peer file sharing: a Connection Manager for discovery and a peer
//! core that shares, serves and downloads files over point-to-point TCP.

pub mod cli;
pub mod client;
pub mod download;
pub mod error;
pub mod peer;
pub mod share;
pub mod storage;
pub mod tracker;
pub mod wire;

pub use client::{ClientConfig, PeerClient};
pub use error::{DownloadError, P2pError, Result};
