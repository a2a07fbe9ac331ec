use crate::peer::{ApplicationMessage, FileTransferDescriptor, NegotiationState};

/// Snapshot of one peer as published to the owner after every visible
/// change.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSummary {
    pub peer_id: String,
    pub display_name: String,
    pub state: NegotiationState,
    pub channel_open: bool,
    pub has_remote_media: bool,
    pub has_remote_screen: bool,
}

/// What the orchestrator reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Full roster snapshot. Emitted on any peer state change, including
    /// an empty roster after teardown.
    PeerUpdate(Vec<PeerSummary>),
    Message(ApplicationMessage),
    FileTransfer(FileTransferDescriptor),
}
