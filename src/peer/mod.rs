mod acceptor;
mod connection;

pub use acceptor::{Acceptor, AcceptorHandle, ServeOutcome};
pub use connection::{FileReply, PeerConnection};
