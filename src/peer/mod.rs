pub mod data_channel;
pub mod ice;
pub mod session;
pub mod types;

pub use data_channel::CHANNEL_LABEL;
pub use session::{NegotiationState, PeerSession, SessionEvent};
pub use types::{ApplicationMessage, ChannelPayload, FileTransferDescriptor, TransferStatus};
