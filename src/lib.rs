//! Peer connection orchestration for serverless LAN meshes.
//!
//! Peers announce themselves over a shared signaling channel, resolve
//! simultaneous dials by peer-id comparison, negotiate WebRTC sessions
//! carrying camera or screen media, and exchange chat messages and file
//! announcements over a per-peer data channel.
//!
//! The entry point is [`Orchestrator`]: construct one with a capture
//! backend, consume its event stream, and [`bind`](Orchestrator::bind) it
//! to a [`SignalingChannel`].

pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod media;
pub mod orchestrator;
pub mod peer;
pub mod signaling;

pub use config::{IceServerConfig, OrchestratorConfig, ServerKind};
pub use error::{Error, MediaError, SignalingError};
pub use events::{Event, PeerSummary};
pub use identity::LocalIdentity;
pub use media::{CaptureBackend, MediaSource, SyntheticBackend, TrackKind};
pub use orchestrator::Orchestrator;
pub use peer::{
    ApplicationMessage, FileTransferDescriptor, NegotiationState, TransferStatus,
};
pub use signaling::{IceCandidate, LoopbackChannel, LoopbackHub, SignalEnvelope, SignalKind, SignalingChannel};
