mod client;
mod peer;
mod server;

pub use client::{AvailableIndex, TrackerClient};
pub use peer::{AvailableEntry, PeerAddress};
pub use server::ConnectionManager;
