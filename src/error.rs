use thiserror::Error;

/// Failures of the local media layer.
#[derive(Debug, Error)]
pub enum MediaError {
    /// Camera/microphone capture could not be opened. The orchestrator
    /// retries audio-only before surfacing this.
    #[error("media acquisition failed: {0}")]
    AcquisitionFailed(String),

    /// The capture backend offers no screen capture at all.
    #[error("screen capture is not supported by this capture backend")]
    CaptureUnsupported,

    /// The user (or platform) refused the screen capture request.
    #[error("screen capture was denied")]
    CaptureDenied,
}

/// Failures of the signaling transport.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling channel is closed")]
    ChannelClosed,
}

/// Top-level error type of the orchestrator.
///
/// There are no global fatal errors: a `Negotiation` failure concerns a
/// single peer and leaves every other session untouched.
#[derive(Debug, Error)]
pub enum Error {
    /// `bind` was called a second time on the same orchestrator.
    #[error("orchestrator is already bound to a signaling channel")]
    AlreadyBound,

    /// The orchestrator actor has shut down and no longer accepts commands.
    #[error("orchestrator has been torn down")]
    Terminated,

    #[error(transparent)]
    Media(#[from] MediaError),

    /// SDP or ICE application failed for one peer. The session is left in
    /// its current state; a later message may still complete it.
    #[error("negotiation with {peer_id} failed: {source}")]
    Negotiation {
        peer_id: String,
        #[source]
        source: webrtc::Error,
    },

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

impl Error {
    pub(crate) fn negotiation(peer_id: &str, source: webrtc::Error) -> Self {
        Error::Negotiation {
            peer_id: peer_id.to_owned(),
            source,
        }
    }
}
