//! Wire types and the narrow interface through which negotiation messages
//! reach other peers. The real broadcast transport lives outside this crate;
//! [`LoopbackHub`] is an in-process stand-in used by tests and demos.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::SignalingError;
use crate::identity::LocalIdentity;

/// A network path descriptor proposed by a peer during negotiation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub(crate) fn into_init(self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.candidate,
            sdp_mid: self.sdp_mid,
            sdp_mline_index: self.sdp_mline_index,
            username_fragment: None,
        }
    }

    pub(crate) fn from_init(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    PeerDiscovery,
    Offer,
    Answer,
    IceCandidate,
}

/// Envelope of every signaling message. Discovery messages are broadcast
/// (`to` empty); everything else is addressed to one peer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from: String,
    #[serde(rename = "fromName")]
    pub from_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<RTCSessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

impl SignalEnvelope {
    pub fn discovery(identity: &LocalIdentity) -> Self {
        Self {
            kind: SignalKind::PeerDiscovery,
            from: identity.peer_id.clone(),
            from_name: identity.display_name.clone(),
            to: None,
            sdp: None,
            candidate: None,
        }
    }

    pub fn offer(identity: &LocalIdentity, to: &str, sdp: RTCSessionDescription) -> Self {
        Self {
            kind: SignalKind::Offer,
            from: identity.peer_id.clone(),
            from_name: identity.display_name.clone(),
            to: Some(to.to_owned()),
            sdp: Some(sdp),
            candidate: None,
        }
    }

    pub fn answer(identity: &LocalIdentity, to: &str, sdp: RTCSessionDescription) -> Self {
        Self {
            kind: SignalKind::Answer,
            from: identity.peer_id.clone(),
            from_name: identity.display_name.clone(),
            to: Some(to.to_owned()),
            sdp: Some(sdp),
            candidate: None,
        }
    }

    pub fn ice_candidate(identity: &LocalIdentity, to: &str, candidate: IceCandidate) -> Self {
        Self {
            kind: SignalKind::IceCandidate,
            from: identity.peer_id.clone(),
            from_name: identity.display_name.clone(),
            to: Some(to.to_owned()),
            sdp: None,
            candidate: Some(candidate),
        }
    }
}

/// Transport seam consumed by the orchestrator. Filtering of addressed
/// messages is the channel's responsibility: `subscribe` must only yield
/// envelopes meant for this peer, and never the peer's own traffic.
#[async_trait]
pub trait SignalingChannel: Send + Sync + 'static {
    async fn broadcast(&self, envelope: SignalEnvelope) -> Result<(), SignalingError>;
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError>;
    /// Called once at bind time.
    fn subscribe(&mut self) -> mpsc::Receiver<SignalEnvelope>;
}

/// In-process hub emulating the shared-network broadcast transport.
#[derive(Clone)]
pub struct LoopbackHub {
    tx: broadcast::Sender<SignalEnvelope>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// A channel endpoint for one peer id.
    pub fn channel(&self, peer_id: &str) -> LoopbackChannel {
        LoopbackChannel {
            peer_id: peer_id.to_owned(),
            tx: self.tx.clone(),
        }
    }

    /// Unfiltered tap on all hub traffic. Mainly for tests.
    pub fn tap(&self) -> broadcast::Receiver<SignalEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoopbackChannel {
    peer_id: String,
    tx: broadcast::Sender<SignalEnvelope>,
}

#[async_trait]
impl SignalingChannel for LoopbackChannel {
    async fn broadcast(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        self.tx
            .send(envelope)
            .map(|_| ())
            .map_err(|_| SignalingError::ChannelClosed)
    }

    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        // Addressing is enforced on the receive side.
        self.broadcast(envelope).await
    }

    fn subscribe(&mut self) -> mpsc::Receiver<SignalEnvelope> {
        let (out_tx, out_rx) = mpsc::channel(64);
        let mut rx = self.tx.subscribe();
        let me = self.peer_id.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if envelope.from == me {
                            continue;
                        }
                        if let Some(to) = &envelope.to {
                            if *to != me {
                                continue;
                            }
                        }
                        if out_tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(peer_id = %me, skipped, "loopback subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        out_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> LocalIdentity {
        LocalIdentity::new("peer-0000000000000001", "alice")
    }

    #[test]
    fn discovery_envelope_uses_kebab_case_tag() {
        let json = serde_json::to_value(SignalEnvelope::discovery(&identity())).unwrap();
        assert_eq!(json["type"], "peer-discovery");
        assert_eq!(json["from"], "peer-0000000000000001");
        assert!(json.get("to").is_none());
        assert!(json.get("sdp").is_none());
    }

    #[test]
    fn candidate_envelope_round_trips() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 4444 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let envelope = SignalEnvelope::ice_candidate(&identity(), "peer-x", candidate.clone());
        let json = serde_json::to_string(&envelope).unwrap();
        let back: SignalEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, SignalKind::IceCandidate);
        assert_eq!(back.to.as_deref(), Some("peer-x"));
        assert_eq!(back.candidate, Some(candidate));
    }

    #[tokio::test]
    async fn loopback_filters_own_and_misaddressed_traffic() {
        let hub = LoopbackHub::new();
        let alice = LocalIdentity::new("peer-a", "alice");
        let bob = LocalIdentity::new("peer-b", "bob");

        let mut bob_channel = hub.channel(&bob.peer_id);
        let mut bob_inbox = bob_channel.subscribe();
        let mut carol_channel = hub.channel("peer-c");
        let mut carol_inbox = carol_channel.subscribe();

        let alice_channel = hub.channel(&alice.peer_id);
        alice_channel
            .broadcast(SignalEnvelope::discovery(&alice))
            .await
            .unwrap();
        alice_channel
            .send(SignalEnvelope::answer(
                &alice,
                "peer-b",
                RTCSessionDescription::default(),
            ))
            .await
            .unwrap();

        // Bob sees the broadcast and the addressed answer.
        assert_eq!(bob_inbox.recv().await.unwrap().kind, SignalKind::PeerDiscovery);
        assert_eq!(bob_inbox.recv().await.unwrap().kind, SignalKind::Answer);

        // Carol sees only the broadcast.
        assert_eq!(
            carol_inbox.recv().await.unwrap().kind,
            SignalKind::PeerDiscovery
        );
        assert!(carol_inbox.try_recv().is_err());
    }
}
