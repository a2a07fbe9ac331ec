//! The root actor. Owns the capture state, the signaling binding and the
//! table of peer sessions; every mutation happens on the single actor task,
//! with connection callbacks funneled in through the session event queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::OrchestratorConfig;
use crate::error::Error;
use crate::events::{Event, PeerSummary};
use crate::identity::LocalIdentity;
use crate::media::{CaptureBackend, LocalTrack, MediaEvent, MediaSource};
use crate::peer::ice::PendingCandidates;
use crate::peer::session::{NegotiationState, PeerSession, SessionEvent};
use crate::peer::types::{ApplicationMessage, ChannelPayload, FileTransferDescriptor};
use crate::signaling::{IceCandidate, SignalEnvelope, SignalKind, SignalingChannel};

/// Glare tie-break: of two peers that discover each other simultaneously,
/// the one with the lexicographically greater id dials.
pub(crate) fn should_initiate(local_id: &str, remote_id: &str) -> bool {
    local_id > remote_id
}

enum Command {
    SendMessage {
        content: String,
        reply: oneshot::Sender<ApplicationMessage>,
    },
    SendFile {
        name: String,
        size: u64,
        reply: oneshot::Sender<FileTransferDescriptor>,
    },
    SetAudioEnabled {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    SetVideoEnabled {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    StartScreenShare {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    StopScreenShare {
        reply: oneshot::Sender<()>,
    },
    RestartMedia {
        video: bool,
        audio: bool,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Teardown {
        reply: oneshot::Sender<()>,
    },
}

/// State handed to the actor at bind time. Present exactly once; a second
/// `bind` finds it gone.
struct Unbound {
    config: OrchestratorConfig,
    backend: Arc<dyn CaptureBackend>,
    cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<Event>,
}

/// Handle to one peer mesh membership. Construct it, consume the event
/// receiver, then [`bind`](Orchestrator::bind) it to a signaling channel to
/// go live.
pub struct Orchestrator {
    identity: LocalIdentity,
    cmd_tx: mpsc::Sender<Command>,
    unbound: Mutex<Option<Unbound>>,
}

impl Orchestrator {
    pub fn new(
        display_name: impl Into<String>,
        backend: Arc<dyn CaptureBackend>,
        config: OrchestratorConfig,
    ) -> (Self, mpsc::Receiver<Event>) {
        Self::with_identity(LocalIdentity::generate(display_name), backend, config)
    }

    /// Like [`new`](Self::new) but with a caller-controlled peer id.
    pub fn with_identity(
        identity: LocalIdentity,
        backend: Arc<dyn CaptureBackend>,
        config: OrchestratorConfig,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        (
            Self {
                identity,
                cmd_tx,
                unbound: Mutex::new(Some(Unbound {
                    config,
                    backend,
                    cmd_rx,
                    event_tx,
                })),
            },
            event_rx,
        )
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Goes live on the given signaling channel: spawns the actor task,
    /// acquires local media and starts announcing. One-shot; a second call
    /// fails with [`Error::AlreadyBound`].
    pub fn bind<C: SignalingChannel>(&self, mut channel: C) -> Result<(), Error> {
        let unbound = {
            let mut guard = self.unbound.lock().unwrap_or_else(|p| p.into_inner());
            guard.take().ok_or(Error::AlreadyBound)?
        };
        let inbox = channel.subscribe();
        let (media, media_events) = MediaSource::new(unbound.backend);
        let (session_tx, session_rx) = mpsc::channel(256);
        let actor = Actor {
            identity: self.identity.clone(),
            config: unbound.config,
            channel,
            inbox,
            inbox_open: true,
            cmd_rx: unbound.cmd_rx,
            media,
            media_events,
            event_tx: unbound.event_tx,
            sessions: HashMap::new(),
            pending_ice: PendingCandidates::default(),
            session_tx,
            session_rx,
        };
        tokio::spawn(actor.run());
        Ok(())
    }

    async fn command<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)
    }

    /// Fans the message out to every open data channel and returns the
    /// sender's own copy for the local log.
    pub async fn send_message(&self, content: impl Into<String>) -> Result<ApplicationMessage, Error> {
        let content = content.into();
        self.command(|reply| Command::SendMessage { content, reply })
            .await
    }

    /// Announces a file transfer to every open channel.
    pub async fn send_file(&self, name: impl Into<String>, size: u64) -> Result<FileTransferDescriptor, Error> {
        let name = name.into();
        self.command(|reply| Command::SendFile { name, size, reply })
            .await
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<(), Error> {
        self.command(|reply| Command::SetAudioEnabled { enabled, reply })
            .await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), Error> {
        self.command(|reply| Command::SetVideoEnabled { enabled, reply })
            .await
    }

    pub async fn start_screen_share(&self) -> Result<(), Error> {
        self.command(|reply| Command::StartScreenShare { reply })
            .await?
    }

    pub async fn stop_screen_share(&self) -> Result<(), Error> {
        self.command(|reply| Command::StopScreenShare { reply }).await
    }

    /// Reacquires local capture and renegotiates with every peer. Falls
    /// back to audio-only when the combined request fails.
    pub async fn restart_media(&self, video: bool, audio: bool) -> Result<(), Error> {
        self.command(|reply| Command::RestartMedia { video, audio, reply })
            .await?
    }

    /// Closes every session and releases all capture. Idempotent: calling
    /// it on an already-stopped orchestrator succeeds.
    pub async fn teardown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Teardown { reply: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

struct Actor<C: SignalingChannel> {
    identity: LocalIdentity,
    config: OrchestratorConfig,
    channel: C,
    inbox: mpsc::Receiver<SignalEnvelope>,
    inbox_open: bool,
    cmd_rx: mpsc::Receiver<Command>,
    media: MediaSource,
    media_events: mpsc::Receiver<MediaEvent>,
    event_tx: mpsc::Sender<Event>,
    sessions: HashMap<String, PeerSession>,
    pending_ice: PendingCandidates,
    session_tx: mpsc::Sender<SessionEvent>,
    session_rx: mpsc::Receiver<SessionEvent>,
}

impl<C: SignalingChannel> Actor<C> {
    async fn run(mut self) {
        if let Err(err) = self.media.acquire(true, true).await {
            warn!(error = %err, "camera capture failed, retrying audio only");
            if let Err(err) = self.media.acquire(false, true).await {
                warn!(error = %err, "audio capture failed, continuing without local media");
            }
        }

        info!(peer_id = %self.identity.peer_id, "orchestrator online");
        let mut discovery = tokio::time::interval(self.config.discovery_interval);
        let follow_up = tokio::time::sleep(self.config.discovery_follow_up);
        tokio::pin!(follow_up);
        let mut follow_up_pending = true;

        loop {
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => {
                        self.teardown_all().await;
                        break;
                    }
                },

                Some(event) = self.session_rx.recv() => {
                    self.handle_session_event(event).await;
                }

                envelope = self.inbox.recv(), if self.inbox_open => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => {
                        warn!("signaling inbox closed, no further inbound signals");
                        self.inbox_open = false;
                    }
                },

                Some(event) = self.media_events.recv() => match event {
                    MediaEvent::ScreenCaptureEnded => {
                        info!("screen capture ended at the source");
                        self.stop_screen_share().await;
                    }
                },

                _ = discovery.tick() => self.announce().await,

                _ = &mut follow_up, if follow_up_pending => {
                    follow_up_pending = false;
                    self.announce().await;
                }
            }
        }
    }

    async fn announce(&self) {
        let envelope = SignalEnvelope::discovery(&self.identity);
        if let Err(err) = self.channel.broadcast(envelope).await {
            warn!(error = %err, "discovery broadcast failed");
        }
    }

    async fn send_signal(&self, envelope: SignalEnvelope) {
        if let Err(err) = self.channel.send(envelope).await {
            warn!(error = %err, "signaling send failed");
        }
    }

    async fn handle_envelope(&mut self, envelope: SignalEnvelope) {
        if envelope.from == self.identity.peer_id {
            return;
        }
        match envelope.kind {
            SignalKind::PeerDiscovery => {
                self.handle_discovery(&envelope.from, &envelope.from_name).await;
            }
            SignalKind::Offer => {
                let Some(sdp) = envelope.sdp else {
                    warn!(peer_id = %envelope.from, "offer without sdp");
                    return;
                };
                self.handle_offer(&envelope.from, &envelope.from_name, sdp).await;
            }
            SignalKind::Answer => {
                let Some(sdp) = envelope.sdp else {
                    warn!(peer_id = %envelope.from, "answer without sdp");
                    return;
                };
                self.handle_answer(&envelope.from, sdp).await;
            }
            SignalKind::IceCandidate => {
                let Some(candidate) = envelope.candidate else {
                    warn!(peer_id = %envelope.from, "ice envelope without candidate");
                    return;
                };
                self.handle_candidate(&envelope.from, candidate).await;
            }
        }
    }

    /// A peer announced itself. The side with the greater id dials; known
    /// peers are left alone so repeated beacons never duplicate sessions.
    async fn handle_discovery(&mut self, from: &str, from_name: &str) {
        if self.sessions.contains_key(from) {
            return;
        }
        if !should_initiate(&self.identity.peer_id, from) {
            debug!(peer_id = from, "peer discovered, waiting for their offer");
            return;
        }

        info!(peer_id = from, name = from_name, "peer discovered, initiating");
        let mut session = match PeerSession::connect(
            from,
            from_name,
            true,
            &self.config,
            self.session_tx.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(err) => {
                warn!(peer_id = from, error = %err, "failed to create session");
                return;
            }
        };

        if let Err(err) = session.attach_outbound(&self.media.outbound_tracks()).await {
            // Negotiation proceeds data-channel-only.
            warn!(peer_id = from, error = %err, "failed to attach local tracks");
        }
        let offer = match session.make_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                warn!(peer_id = from, error = %err, "failed to build offer");
                session.close().await;
                return;
            }
        };
        session.state = NegotiationState::AnswerAwaited;
        self.sessions.insert(from.to_owned(), session);
        self.send_signal(SignalEnvelope::offer(&self.identity, from, offer))
            .await;
        self.publish_peers().await;
    }

    async fn handle_offer(&mut self, from: &str, from_name: &str, sdp: RTCSessionDescription) {
        if let Some(session) = self.sessions.get(from) {
            if session.is_connected_or_connecting() {
                debug!(peer_id = from, "ignoring offer, session already live");
                return;
            }
        } else {
            let mut session = match PeerSession::connect(
                from,
                from_name,
                false,
                &self.config,
                self.session_tx.clone(),
            )
            .await
            {
                Ok(session) => session,
                Err(err) => {
                    warn!(peer_id = from, error = %err, "failed to create session");
                    return;
                }
            };
            if let Err(err) = session.attach_outbound(&self.media.outbound_tracks()).await {
                warn!(peer_id = from, error = %err, "failed to attach local tracks");
            }
            self.sessions.insert(from.to_owned(), session);
        }

        let Some(session) = self.sessions.get_mut(from) else {
            return;
        };
        if session.state.offer_in_flight() {
            debug!(peer_id = from, "remote offer crossed ours in flight");
        }
        if let Err(err) = session.set_remote_offer(sdp).await {
            warn!(peer_id = from, error = %err, "failed to apply remote offer");
            return;
        }
        let queued = self.pending_ice.drain(from);
        session.apply_queued(queued).await;
        let answer = match session.make_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                warn!(peer_id = from, error = %err, "failed to build answer");
                return;
            }
        };
        info!(peer_id = from, "answering offer");
        self.send_signal(SignalEnvelope::answer(&self.identity, from, answer))
            .await;
        self.publish_peers().await;
    }

    async fn handle_answer(&mut self, from: &str, sdp: RTCSessionDescription) {
        let Some(session) = self.sessions.get_mut(from) else {
            debug!(peer_id = from, "answer for unknown peer");
            return;
        };
        match session.apply_answer(sdp).await {
            Ok(true) => {
                info!(peer_id = from, "answer applied");
                let queued = self.pending_ice.drain(from);
                session.apply_queued(queued).await;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(peer_id = from, error = %err, "failed to apply answer");
            }
        }
    }

    /// Candidates may only be applied once the remote description is set;
    /// anything earlier (including candidates preceding the offer itself)
    /// waits in the per-peer queue.
    async fn handle_candidate(&mut self, from: &str, candidate: IceCandidate) {
        let init = candidate.into_init();
        match self.sessions.get(from) {
            Some(session) if session.has_remote_description().await => {
                if let Err(err) = session.apply_candidate(init).await {
                    warn!(peer_id = from, error = %err, "failed to apply candidate");
                }
            }
            _ => {
                debug!(peer_id = from, "queueing candidate until remote description");
                self.pending_ice.push(from, init);
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::LocalCandidate { peer_id, candidate } => {
                if self.sessions.contains_key(&peer_id) {
                    self.send_signal(SignalEnvelope::ice_candidate(
                        &self.identity,
                        &peer_id,
                        candidate,
                    ))
                    .await;
                }
            }
            SessionEvent::ConnectionState { peer_id, state } => match state {
                RTCPeerConnectionState::Connected => {
                    if let Some(session) = self.sessions.get_mut(&peer_id) {
                        session.state = NegotiationState::Connected;
                        info!(peer_id = %peer_id, "peer connected");
                        self.publish_peers().await;
                    }
                }
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                    if self.sessions.contains_key(&peer_id) {
                        warn!(peer_id = %peer_id, ?state, "peer connection lost");
                        self.remove_session(&peer_id).await;
                    }
                }
                _ => {}
            },
            SessionEvent::DataChannel { peer_id, channel } => {
                if let Some(session) = self.sessions.get_mut(&peer_id) {
                    session.set_data_channel(channel);
                }
            }
            SessionEvent::ChannelOpen { peer_id } => {
                debug!(peer_id = %peer_id, "data channel open");
                self.publish_peers().await;
            }
            SessionEvent::ChannelClosed { peer_id } => {
                // Connection-state reports decide session teardown.
                debug!(peer_id = %peer_id, "data channel closed");
                self.publish_peers().await;
            }
            SessionEvent::ChannelPayload { peer_id, payload } => {
                let Some(session) = self.sessions.get(&peer_id) else {
                    return;
                };
                let event = match payload {
                    ChannelPayload::Message { content } => Event::Message(
                        ApplicationMessage::received(&peer_id, &session.display_name, content),
                    ),
                    ChannelPayload::FileMeta { id, name, size } => {
                        Event::FileTransfer(FileTransferDescriptor::announced(
                            id,
                            &peer_id,
                            &session.display_name,
                            name,
                            size,
                        ))
                    }
                };
                let _ = self.event_tx.send(event).await;
            }
            SessionEvent::RemoteTrack {
                peer_id,
                kind,
                stream_id,
                track_id,
            } => {
                if let Some(session) = self.sessions.get_mut(&peer_id) {
                    debug!(peer_id = %peer_id, kind = kind.as_str(), stream_id = %stream_id, "remote track");
                    session.observe_remote_track(kind, &stream_id, &track_id);
                    self.publish_peers().await;
                }
            }
        }
    }

    /// Returns `false` when the actor should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SendMessage { content, reply } => {
                let payload = ChannelPayload::Message {
                    content: content.clone(),
                };
                let delivered = self.fan_out(&payload).await;
                debug!(delivered, "message fanned out");
                let _ = reply.send(ApplicationMessage::outgoing(&self.identity, &content));
            }
            Command::SendFile { name, size, reply } => {
                let descriptor = FileTransferDescriptor::outgoing(&self.identity, &name, size);
                let payload = ChannelPayload::FileMeta {
                    id: descriptor.id.clone(),
                    name,
                    size,
                };
                let delivered = self.fan_out(&payload).await;
                debug!(delivered, "file announcement fanned out");
                let _ = reply.send(descriptor);
            }
            Command::SetAudioEnabled { enabled, reply } => {
                self.media.set_audio_enabled(enabled);
                let _ = reply.send(());
            }
            Command::SetVideoEnabled { enabled, reply } => {
                self.media.set_video_enabled(enabled);
                let _ = reply.send(());
            }
            Command::StartScreenShare { reply } => {
                let _ = reply.send(self.start_screen_share().await);
            }
            Command::StopScreenShare { reply } => {
                self.stop_screen_share().await;
                let _ = reply.send(());
            }
            Command::RestartMedia { video, audio, reply } => {
                let _ = reply.send(self.restart_media(video, audio).await);
            }
            Command::Teardown { reply } => {
                self.teardown_all().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    /// Sends a payload to every session with an open channel. Channels that
    /// are connecting or closed are skipped, never buffered.
    async fn fan_out(&self, payload: &ChannelPayload) -> usize {
        let mut delivered = 0;
        for session in self.sessions.values() {
            if session.send_payload(payload).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn start_screen_share(&mut self) -> Result<(), Error> {
        if self.media.is_screen_sharing() {
            return Ok(());
        }
        self.media.start_screen_capture().await?;
        if let Some(track) = self.media.screen_video_track() {
            self.swap_video_everywhere(Some(track)).await;
        }
        Ok(())
    }

    async fn stop_screen_share(&mut self) {
        if !self.media.is_screen_sharing() {
            return;
        }
        self.media.stop_screen_capture();
        self.swap_video_everywhere(self.media.camera_video_track())
            .await;
    }

    async fn restart_media(&mut self, video: bool, audio: bool) -> Result<(), Error> {
        match self.media.acquire(video, audio).await {
            Ok(()) => {}
            Err(err) if video => {
                warn!(error = %err, "capture failed, retrying audio only");
                self.media.acquire(false, true).await?;
            }
            Err(err) => return Err(err.into()),
        }
        let tracks = self.media.outbound_tracks();
        let mut outgoing = Vec::new();
        for session in self.sessions.values_mut() {
            if let Err(err) = session.replace_outbound(&tracks).await {
                warn!(peer_id = %session.peer_id, error = %err, "failed to replace tracks");
                continue;
            }
            match session.renegotiate_offer().await {
                Ok(Some(offer)) => outgoing.push(SignalEnvelope::offer(
                    &self.identity,
                    &session.peer_id,
                    offer,
                )),
                Ok(None) => {}
                Err(err) => {
                    warn!(peer_id = %session.peer_id, error = %err, "renegotiation failed");
                }
            }
        }
        for envelope in outgoing {
            self.send_signal(envelope).await;
        }
        Ok(())
    }

    /// Swaps (or, with `None`, removes) the outbound video track on every
    /// session and sends one renegotiation offer per session that accepted
    /// the change. A failure on one peer never blocks the rest.
    async fn swap_video_everywhere(&mut self, track: Option<Arc<LocalTrack>>) {
        let mut outgoing = Vec::new();
        for session in self.sessions.values_mut() {
            let swapped = match &track {
                Some(track) => session.swap_video(track).await,
                None => session.detach_video().await,
            };
            if let Err(err) = swapped {
                warn!(peer_id = %session.peer_id, error = %err, "video track swap failed");
                continue;
            }
            match session.renegotiate_offer().await {
                Ok(Some(offer)) => outgoing.push(SignalEnvelope::offer(
                    &self.identity,
                    &session.peer_id,
                    offer,
                )),
                Ok(None) => {}
                Err(err) => {
                    warn!(peer_id = %session.peer_id, error = %err, "renegotiation failed");
                }
            }
        }
        for envelope in outgoing {
            self.send_signal(envelope).await;
        }
    }

    /// Republishes the roster. Sorted by peer id so consumers see a stable
    /// order.
    async fn publish_peers(&self) {
        let mut peers: Vec<PeerSummary> = self.sessions.values().map(PeerSession::summary).collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        let _ = self.event_tx.send(Event::PeerUpdate(peers)).await;
    }

    /// Closes and forgets one session, dropping its queued candidates so a
    /// stray late candidate cannot resurrect stale state.
    async fn remove_session(&mut self, peer_id: &str) {
        if let Some(mut session) = self.sessions.remove(peer_id) {
            session.close().await;
        }
        self.pending_ice.discard(peer_id);
        self.publish_peers().await;
    }

    async fn teardown_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.close().await;
        }
        self.pending_ice.clear();
        self.media.release_all();
        self.publish_peers().await;
        info!(peer_id = %self.identity.peer_id, "orchestrator torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticBackend;
    use crate::signaling::LoopbackHub;

    #[test]
    fn greater_id_initiates() {
        assert!(should_initiate("peer-200", "peer-100"));
        assert!(!should_initiate("peer-100", "peer-200"));
        assert!(!should_initiate("peer-100", "peer-100"));
    }

    #[tokio::test]
    async fn second_bind_fails() {
        let hub = LoopbackHub::new();
        let (orchestrator, _events) = Orchestrator::new(
            "alice",
            Arc::new(SyntheticBackend::new()),
            OrchestratorConfig::default(),
        );
        orchestrator
            .bind(hub.channel(&orchestrator.identity().peer_id))
            .unwrap();
        let err = orchestrator
            .bind(hub.channel(&orchestrator.identity().peer_id))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyBound));
        orchestrator.teardown().await;
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_commands_fail_after() {
        let hub = LoopbackHub::new();
        let (orchestrator, _events) = Orchestrator::new(
            "alice",
            Arc::new(SyntheticBackend::new()),
            OrchestratorConfig::default(),
        );
        orchestrator
            .bind(hub.channel(&orchestrator.identity().peer_id))
            .unwrap();
        orchestrator.teardown().await;
        orchestrator.teardown().await;
        assert!(matches!(
            orchestrator.send_message("late").await,
            Err(Error::Terminated)
        ));
    }
}
