use std::collections::HashMap;

use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

/// Per-peer holding area for ICE candidates that arrive before the remote
/// description is set. Candidates are replayed in arrival order.
#[derive(Default)]
pub struct PendingCandidates {
    queues: HashMap<String, Vec<RTCIceCandidateInit>>,
}

impl PendingCandidates {
    pub fn push(&mut self, peer_id: &str, candidate: RTCIceCandidateInit) {
        self.queues
            .entry(peer_id.to_owned())
            .or_default()
            .push(candidate);
    }

    /// Takes every queued candidate for `peer_id`, leaving the queue empty.
    pub fn drain(&mut self, peer_id: &str) -> Vec<RTCIceCandidateInit> {
        self.queues.remove(peer_id).unwrap_or_default()
    }

    /// Drops queued candidates for a peer without applying them.
    pub fn discard(&mut self, peer_id: &str) {
        self.queues.remove(peer_id);
    }

    pub fn queued(&self, peer_id: &str) -> usize {
        self.queues.get(peer_id).map_or(0, Vec::len)
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}

/// Applies a batch of candidates to a connection. An individual bad
/// candidate is logged and skipped so the rest of the batch still lands.
pub async fn apply_candidates(
    pc: &RTCPeerConnection,
    peer_id: &str,
    candidates: Vec<RTCIceCandidateInit>,
) {
    for candidate in candidates {
        debug!(peer_id, candidate = %candidate.candidate, "applying ice candidate");
        if let Err(err) = pc.add_ice_candidate(candidate).await {
            warn!(peer_id, error = %err, "failed to apply ice candidate");
        }
    }
}
