mod channel;
mod error;
pub mod frame;
mod socket;

pub use channel::ChannelPair;
pub use error::{NetError, NetResult};
pub use socket::{FD_UNKNOWN, LISTEN_BACKLOG, SockFlag, SockProto, SockState, SockType, Socket};
