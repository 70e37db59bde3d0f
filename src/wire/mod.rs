mod frame;
mod message;

pub use frame::{read_message, try_read_message, write_message};
pub use message::Message;

/// Largest control payload accepted on any connection (16 MiB)
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
