use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;

use crate::config::OrchestratorConfig;
use crate::error::Error;
use crate::events::PeerSummary;
use crate::media::{LocalTrack, TrackKind, SCREEN_STREAM_ID};
use crate::signaling::IceCandidate;

use super::data_channel::{attach_channel, try_send, CHANNEL_LABEL};
use super::types::ChannelPayload;

/// Where a peer stands in the offer/answer exchange. Transitions are driven
/// only by the owning actor task, never from connection callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    AnswerAwaited,
    OfferReceived,
    AnswerSent,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }

    /// True while we have sent an offer and not yet seen the answer.
    pub fn offer_in_flight(self) -> bool {
        matches!(
            self,
            NegotiationState::OfferSent | NegotiationState::AnswerAwaited
        )
    }
}

/// Notifications raised by connection callbacks, funneled into the actor's
/// queue so all state mutation happens on one task.
pub enum SessionEvent {
    LocalCandidate {
        peer_id: String,
        candidate: IceCandidate,
    },
    ConnectionState {
        peer_id: String,
        state: RTCPeerConnectionState,
    },
    DataChannel {
        peer_id: String,
        channel: Arc<RTCDataChannel>,
    },
    ChannelOpen {
        peer_id: String,
    },
    ChannelClosed {
        peer_id: String,
    },
    ChannelPayload {
        peer_id: String,
        payload: ChannelPayload,
    },
    RemoteTrack {
        peer_id: String,
        kind: TrackKind,
        stream_id: String,
        track_id: String,
    },
}

/// Remote media observed on one stream id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RemoteStreamInfo {
    pub stream_id: String,
    pub track_ids: Vec<String>,
}

impl RemoteStreamInfo {
    fn observe(&mut self, stream_id: &str, track_id: &str) {
        self.stream_id = stream_id.to_owned();
        if !self.track_ids.iter().any(|id| id == track_id) {
            self.track_ids.push(track_id.to_owned());
        }
    }
}

/// One peer connection plus the negotiation bookkeeping around it.
pub struct PeerSession {
    pub peer_id: String,
    pub display_name: String,
    pub state: NegotiationState,
    pc: Arc<RTCPeerConnection>,
    data_channel: Option<Arc<RTCDataChannel>>,
    senders: HashMap<TrackKind, Arc<RTCRtpSender>>,
    recv_kinds: HashSet<TrackKind>,
    remote_camera: Option<RemoteStreamInfo>,
    remote_screen: Option<RemoteStreamInfo>,
}

impl PeerSession {
    /// Builds the underlying connection and wires every callback to the
    /// session event queue. The initiator side creates the data channel;
    /// the responder picks it up via `on_data_channel`.
    pub async fn connect(
        peer_id: &str,
        display_name: &str,
        initiator: bool,
        config: &OrchestratorConfig,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Self, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::negotiation(peer_id, e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::negotiation(peer_id, e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(config.rtc_config())
                .await
                .map_err(|e| Error::negotiation(peer_id, e))?,
        );

        let id = peer_id.to_owned();
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let id = id.clone();
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx
                            .send(SessionEvent::LocalCandidate {
                                peer_id: id,
                                candidate: IceCandidate::from_init(init),
                            })
                            .await;
                    }
                    Err(err) => {
                        warn!(peer_id = %id, error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let id = peer_id.to_owned();
        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let id = id.clone();
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx
                    .send(SessionEvent::ConnectionState { peer_id: id, state })
                    .await;
            })
        }));

        let id = peer_id.to_owned();
        let tx = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let id = id.clone();
            let tx = tx.clone();
            Box::pin(async move {
                let kind = if track.kind() == webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio
                {
                    TrackKind::Audio
                } else {
                    TrackKind::Video
                };
                let _ = tx
                    .send(SessionEvent::RemoteTrack {
                        peer_id: id,
                        kind,
                        stream_id: track.stream_id(),
                        track_id: track.id(),
                    })
                    .await;
            })
        }));

        let mut data_channel = None;
        if initiator {
            let dc = pc
                .create_data_channel(CHANNEL_LABEL, None)
                .await
                .map_err(|e| Error::negotiation(peer_id, e))?;
            attach_channel(&dc, peer_id, &events);
            data_channel = Some(dc);
        } else {
            let id = peer_id.to_owned();
            let tx = events.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let id = id.clone();
                let tx = tx.clone();
                Box::pin(async move {
                    attach_channel(&dc, &id, &tx);
                    let _ = tx
                        .send(SessionEvent::DataChannel {
                            peer_id: id,
                            channel: dc,
                        })
                        .await;
                })
            }));
        }

        info!(peer_id, initiator, "peer session created");
        Ok(Self {
            peer_id: peer_id.to_owned(),
            display_name: display_name.to_owned(),
            state: NegotiationState::Idle,
            pc,
            data_channel,
            senders: HashMap::new(),
            recv_kinds: HashSet::new(),
            remote_camera: None,
            remote_screen: None,
        })
    }

    /// True when the transport is live or still dialing. Used to decide
    /// whether an unexpected re-offer from a connected peer is stale.
    pub fn is_connected_or_connecting(&self) -> bool {
        matches!(
            self.pc.connection_state(),
            RTCPeerConnectionState::Connected | RTCPeerConnectionState::Connecting
        ) || self.state == NegotiationState::Connected
    }

    pub async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    pub fn channel_open(&self) -> bool {
        self.data_channel
            .as_ref()
            .map(|dc| {
                dc.ready_state() == webrtc::data_channel::data_channel_state::RTCDataChannelState::Open
            })
            .unwrap_or(false)
    }

    /// Adopts the remotely-created channel. A channel already held (the
    /// initiator's own) wins over a late duplicate.
    pub fn set_data_channel(&mut self, dc: Arc<RTCDataChannel>) {
        if self.data_channel.is_none() {
            self.data_channel = Some(dc);
        }
    }

    /// Adds outbound tracks for any kind not yet sent to this peer. Kinds
    /// with no local track get a receive-only transceiver instead, so the
    /// offer still declares intent to receive that media. A peer on the
    /// audio-only fallback must be able to receive remote video.
    pub async fn attach_outbound(&mut self, tracks: &[Arc<LocalTrack>]) -> Result<(), Error> {
        for track in tracks {
            if self.senders.contains_key(&track.kind()) {
                continue;
            }
            let rtc = Arc::clone(track.rtc()) as Arc<dyn TrackLocal + Send + Sync>;
            let sender = self
                .pc
                .add_track(rtc)
                .await
                .map_err(|e| Error::negotiation(&self.peer_id, e))?;
            self.senders.insert(track.kind(), sender);
        }
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if self.senders.contains_key(&kind) || self.recv_kinds.contains(&kind) {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    kind.codec_type(),
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| Error::negotiation(&self.peer_id, e))?;
            self.recv_kinds.insert(kind);
        }
        Ok(())
    }

    /// Drops every outbound sender and attaches the given tracks instead.
    /// Used when local capture is restarted and both tracks are new.
    pub async fn replace_outbound(&mut self, tracks: &[Arc<LocalTrack>]) -> Result<(), Error> {
        let senders: Vec<_> = self.senders.drain().map(|(_, sender)| sender).collect();
        for sender in senders {
            self.pc
                .remove_track(&sender)
                .await
                .map_err(|e| Error::negotiation(&self.peer_id, e))?;
        }
        self.attach_outbound(tracks).await
    }

    /// Replaces the outbound video track, keeping audio untouched. The
    /// caller renegotiates afterwards.
    pub async fn swap_video(&mut self, track: &Arc<LocalTrack>) -> Result<(), Error> {
        if let Some(sender) = self.senders.remove(&TrackKind::Video) {
            self.pc
                .remove_track(&sender)
                .await
                .map_err(|e| Error::negotiation(&self.peer_id, e))?;
        }
        let rtc = Arc::clone(track.rtc()) as Arc<dyn TrackLocal + Send + Sync>;
        let sender = self
            .pc
            .add_track(rtc)
            .await
            .map_err(|e| Error::negotiation(&self.peer_id, e))?;
        self.senders.insert(TrackKind::Video, sender);
        Ok(())
    }

    /// Stops sending video entirely. Used when capture ends and no camera
    /// track exists to fall back to.
    pub async fn detach_video(&mut self) -> Result<(), Error> {
        if let Some(sender) = self.senders.remove(&TrackKind::Video) {
            self.pc
                .remove_track(&sender)
                .await
                .map_err(|e| Error::negotiation(&self.peer_id, e))?;
        }
        Ok(())
    }

    /// Creates and installs a local offer. The `Connected` state is kept so
    /// a renegotiation offer does not look like a fresh dial.
    pub async fn make_offer(&mut self) -> Result<RTCSessionDescription, Error> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::negotiation(&self.peer_id, e))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| Error::negotiation(&self.peer_id, e))?;
        if self.state != NegotiationState::Connected {
            self.state = NegotiationState::OfferSent;
        }
        Ok(offer)
    }

    pub async fn set_remote_offer(&mut self, sdp: RTCSessionDescription) -> Result<(), Error> {
        self.pc
            .set_remote_description(sdp)
            .await
            .map_err(|e| Error::negotiation(&self.peer_id, e))?;
        if self.state != NegotiationState::Connected {
            self.state = NegotiationState::OfferReceived;
        }
        Ok(())
    }

    pub async fn make_answer(&mut self) -> Result<RTCSessionDescription, Error> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::negotiation(&self.peer_id, e))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| Error::negotiation(&self.peer_id, e))?;
        if self.state != NegotiationState::Connected {
            self.state = NegotiationState::AnswerSent;
        }
        Ok(answer)
    }

    /// Applies an answer only while a matching local offer is outstanding.
    /// Returns `false` (and leaves state untouched) for duplicate or stray
    /// answers.
    pub async fn apply_answer(&mut self, sdp: RTCSessionDescription) -> Result<bool, Error> {
        if self.pc.signaling_state() != RTCSignalingState::HaveLocalOffer {
            debug!(peer_id = %self.peer_id, "ignoring answer with no offer outstanding");
            return Ok(false);
        }
        self.pc
            .set_remote_description(sdp)
            .await
            .map_err(|e| Error::negotiation(&self.peer_id, e))?;
        Ok(true)
    }

    /// Produces a renegotiation offer, but only from a stable signaling
    /// state. Track changes made mid-negotiation ride along with the
    /// exchange already in flight.
    pub async fn renegotiate_offer(&mut self) -> Result<Option<RTCSessionDescription>, Error> {
        if self.pc.signaling_state() != RTCSignalingState::Stable {
            debug!(peer_id = %self.peer_id, "deferring renegotiation, signaling not stable");
            return Ok(None);
        }
        self.make_offer().await.map(Some)
    }

    /// Replays candidates queued while no remote description was set.
    pub async fn apply_queued(&self, candidates: Vec<RTCIceCandidateInit>) {
        super::ice::apply_candidates(&self.pc, &self.peer_id, candidates).await;
    }

    pub async fn apply_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Error::negotiation(&self.peer_id, e))
    }

    pub async fn send_payload(&self, payload: &ChannelPayload) -> bool {
        match &self.data_channel {
            Some(dc) => try_send(dc, payload).await,
            None => false,
        }
    }

    /// Records a remote track sighting, classifying camera versus screen by
    /// the sender-assigned stream id.
    pub fn observe_remote_track(&mut self, _kind: TrackKind, stream_id: &str, track_id: &str) {
        let slot = if stream_id == SCREEN_STREAM_ID {
            &mut self.remote_screen
        } else {
            &mut self.remote_camera
        };
        slot.get_or_insert_with(RemoteStreamInfo::default)
            .observe(stream_id, track_id);
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            state: self.state,
            channel_open: self.channel_open(),
            has_remote_media: self.remote_camera.is_some(),
            has_remote_screen: self.remote_screen.is_some(),
        }
    }

    /// Closes channel and transport. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(dc) = self.data_channel.take() {
            if let Err(err) = dc.close().await {
                debug!(peer_id = %self.peer_id, error = %err, "data channel close");
            }
        }
        if let Err(err) = self.pc.close().await {
            debug!(peer_id = %self.peer_id, error = %err, "peer connection close");
        }
        self.state = NegotiationState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ice::apply_candidates;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::default()
    }

    #[tokio::test]
    async fn offer_answer_dance_between_two_sessions() {
        let (tx_a, _rx_a) = mpsc::channel(64);
        let (tx_b, _rx_b) = mpsc::channel(64);
        let mut alice = PeerSession::connect("peer-b", "bob", true, &config(), tx_a)
            .await
            .unwrap();
        let mut bob = PeerSession::connect("peer-a", "alice", false, &config(), tx_b)
            .await
            .unwrap();

        let offer = alice.make_offer().await.unwrap();
        assert_eq!(alice.state, NegotiationState::OfferSent);
        assert!(!alice.has_remote_description().await);

        bob.set_remote_offer(offer).await.unwrap();
        assert_eq!(bob.state, NegotiationState::OfferReceived);
        assert!(bob.has_remote_description().await);

        let answer = bob.make_answer().await.unwrap();
        assert_eq!(bob.state, NegotiationState::AnswerSent);

        assert!(alice.apply_answer(answer.clone()).await.unwrap());
        // A second copy of the same answer is a no-op.
        assert!(!alice.apply_answer(answer).await.unwrap());

        alice.close().await;
        bob.close().await;
        assert_eq!(alice.state, NegotiationState::Closed);
    }

    #[tokio::test]
    async fn offer_declares_receive_intent_without_local_tracks() {
        let (tx, _rx) = mpsc::channel(64);
        let mut session = PeerSession::connect("peer-b", "bob", true, &config(), tx)
            .await
            .unwrap();
        // No local tracks at all, as when capture fell back to nothing.
        session.attach_outbound(&[]).await.unwrap();
        let offer = session.make_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        session.close().await;
    }

    #[tokio::test]
    async fn renegotiation_deferred_until_stable() {
        let (tx, _rx) = mpsc::channel(64);
        let mut session = PeerSession::connect("peer-b", "bob", true, &config(), tx)
            .await
            .unwrap();
        session.make_offer().await.unwrap();
        // Offer outstanding, signaling state is have-local-offer.
        assert!(session.renegotiate_offer().await.unwrap().is_none());
        session.close().await;
    }

    #[tokio::test]
    async fn candidates_apply_after_remote_description() {
        let (tx_a, _rx_a) = mpsc::channel(64);
        let (tx_b, _rx_b) = mpsc::channel(64);
        let mut alice = PeerSession::connect("peer-b", "bob", true, &config(), tx_a)
            .await
            .unwrap();
        let mut bob = PeerSession::connect("peer-a", "alice", false, &config(), tx_b)
            .await
            .unwrap();

        let offer = alice.make_offer().await.unwrap();
        bob.set_remote_offer(offer).await.unwrap();

        // Host candidate shaped like the ones the agent emits.
        let init = RTCIceCandidateInit {
            candidate: "candidate:2230659787 1 udp 2130706431 127.0.0.1 54321 typ host".to_owned(),
            sdp_mid: Some("0".to_owned()),
            sdp_mline_index: Some(0),
            ..Default::default()
        };
        apply_candidates(&bob.pc, "peer-a", vec![init]).await;

        alice.close().await;
        bob.close().await;
    }

    #[test]
    fn state_predicates() {
        assert!(NegotiationState::OfferSent.offer_in_flight());
        assert!(NegotiationState::AnswerAwaited.offer_in_flight());
        assert!(!NegotiationState::Connected.offer_in_flight());
        assert!(NegotiationState::Failed.is_terminal());
        assert!(NegotiationState::Closed.is_terminal());
        assert!(!NegotiationState::Idle.is_terminal());
    }
}
