use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use webrtc::media::Sample;

use crate::error::MediaError;

use super::{LocalStream, LocalTrack, TrackKind, CAMERA_STREAM_ID, SCREEN_STREAM_ID};

/// Out-of-band notifications from the capture layer.
#[derive(Debug, PartialEq, Eq)]
pub enum MediaEvent {
    /// The screen capture stopped at the source, not through the API.
    ScreenCaptureEnded,
}

/// One captured track handed back by a backend: a live sample stream plus
/// a signal that fires if the source stops on its own.
pub struct CaptureTrack {
    pub kind: TrackKind,
    pub samples: mpsc::Receiver<Sample>,
    pub ended: oneshot::Receiver<()>,
}

/// Produces capture tracks. The orchestrator never talks to devices
/// directly, so tests can substitute a deterministic backend.
#[async_trait]
pub trait CaptureBackend: Send + Sync + 'static {
    /// Opens camera and/or microphone capture.
    async fn open_capture(&self, video: bool, audio: bool)
        -> Result<Vec<CaptureTrack>, MediaError>;

    /// Opens screen capture.
    async fn open_screen(&self) -> Result<CaptureTrack, MediaError>;
}

/// Owns the local capture state: at most one camera stream and at most one
/// screen stream, plus the audio/video mute flags that survive stream
/// replacement.
pub struct MediaSource {
    backend: Arc<dyn CaptureBackend>,
    camera: Option<Arc<LocalStream>>,
    screen: Option<Arc<LocalStream>>,
    audio_enabled: bool,
    video_enabled: bool,
    events_tx: mpsc::Sender<MediaEvent>,
    screen_watch: Option<JoinHandle<()>>,
}

impl MediaSource {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> (Self, mpsc::Receiver<MediaEvent>) {
        let (events_tx, events_rx) = mpsc::channel(8);
        (
            Self {
                backend,
                camera: None,
                screen: None,
                audio_enabled: true,
                video_enabled: true,
                events_tx,
                screen_watch: None,
            },
            events_rx,
        )
    }

    /// Acquires a fresh camera stream, stopping any previous one first.
    /// Current mute flags are applied to the new tracks.
    pub async fn acquire(&mut self, video: bool, audio: bool) -> Result<(), MediaError> {
        let captures = self.backend.open_capture(video, audio).await?;
        if let Some(old) = self.camera.take() {
            old.stop();
        }
        let mut tracks = Vec::with_capacity(captures.len());
        for capture in captures {
            let track = LocalTrack::spawn(capture.kind, CAMERA_STREAM_ID, capture.samples);
            let enabled = match capture.kind {
                TrackKind::Audio => self.audio_enabled,
                TrackKind::Video => self.video_enabled,
            };
            track.set_enabled(enabled);
            tracks.push(track);
        }
        info!(video, audio, tracks = tracks.len(), "camera capture acquired");
        self.camera = Some(Arc::new(LocalStream::new(CAMERA_STREAM_ID, tracks)));
        Ok(())
    }

    /// Starts screen capture and watches for the source ending on its own.
    pub async fn start_screen_capture(&mut self) -> Result<(), MediaError> {
        let capture = self.backend.open_screen().await?;
        self.stop_screen_capture();

        let track = LocalTrack::spawn(capture.kind, SCREEN_STREAM_ID, capture.samples);
        self.screen = Some(Arc::new(LocalStream::new(
            SCREEN_STREAM_ID,
            vec![track],
        )));

        let tx = self.events_tx.clone();
        let ended = capture.ended;
        self.screen_watch = Some(tokio::spawn(async move {
            if ended.await.is_ok() {
                let _ = tx.send(MediaEvent::ScreenCaptureEnded).await;
            }
        }));
        info!("screen capture started");
        Ok(())
    }

    /// Stops screen capture. No-op when none is running.
    pub fn stop_screen_capture(&mut self) {
        if let Some(watch) = self.screen_watch.take() {
            watch.abort();
        }
        if let Some(screen) = self.screen.take() {
            screen.stop();
            info!("screen capture stopped");
        }
    }

    /// Mutes or unmutes microphone tracks. Only the camera stream carries
    /// audio.
    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
        self.toggle_camera_tracks(TrackKind::Audio, enabled);
    }

    /// Mutes or unmutes camera video. Screen video is not affected.
    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        self.toggle_camera_tracks(TrackKind::Video, enabled);
    }

    fn toggle_camera_tracks(&self, kind: TrackKind, enabled: bool) {
        if let Some(camera) = &self.camera {
            for track in camera.tracks() {
                if track.kind() == kind {
                    track.set_enabled(enabled);
                    debug!(kind = kind.as_str(), enabled, "camera track toggled");
                }
            }
        }
    }

    /// The tracks a new peer should be sent right now: camera audio, plus
    /// screen video while sharing, camera video otherwise.
    pub fn outbound_tracks(&self) -> Vec<Arc<LocalTrack>> {
        let mut tracks = Vec::new();
        if let Some(camera) = &self.camera {
            if let Some(audio) = camera.track_of(TrackKind::Audio) {
                tracks.push(Arc::clone(audio));
            }
        }
        if let Some(screen) = &self.screen {
            if let Some(video) = screen.track_of(TrackKind::Video) {
                tracks.push(Arc::clone(video));
                return tracks;
            }
        }
        if let Some(camera) = &self.camera {
            if let Some(video) = camera.track_of(TrackKind::Video) {
                tracks.push(Arc::clone(video));
            }
        }
        tracks
    }

    pub fn camera(&self) -> Option<&Arc<LocalStream>> {
        self.camera.as_ref()
    }

    pub fn screen(&self) -> Option<&Arc<LocalStream>> {
        self.screen.as_ref()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn camera_video_track(&self) -> Option<Arc<LocalTrack>> {
        self.camera
            .as_ref()
            .and_then(|c| c.track_of(TrackKind::Video))
            .cloned()
    }

    pub fn screen_video_track(&self) -> Option<Arc<LocalTrack>> {
        self.screen
            .as_ref()
            .and_then(|s| s.track_of(TrackKind::Video))
            .cloned()
    }

    /// Stops every capture. Used during teardown.
    pub fn release_all(&mut self) {
        self.stop_screen_capture();
        if let Some(camera) = self.camera.take() {
            camera.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticBackend;

    fn source() -> (MediaSource, mpsc::Receiver<MediaEvent>) {
        MediaSource::new(Arc::new(SyntheticBackend::new()))
    }

    #[tokio::test]
    async fn acquire_replaces_and_stops_previous_stream() {
        let (mut media, _events) = source();
        media.acquire(true, true).await.unwrap();
        let first_video = media.camera_video_track().unwrap();

        media.acquire(true, true).await.unwrap();
        assert!(first_video.is_stopped());
        let second_video = media.camera_video_track().unwrap();
        assert_ne!(first_video.id(), second_video.id());
        assert!(!second_video.is_stopped());
    }

    #[tokio::test]
    async fn audio_only_acquire_has_no_video_track() {
        let (mut media, _events) = source();
        media.acquire(false, true).await.unwrap();
        assert!(media.camera_video_track().is_none());
        let outbound = media.outbound_tracks();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].kind(), TrackKind::Audio);
    }

    #[tokio::test]
    async fn toggles_apply_to_current_and_future_tracks() {
        let (mut media, _events) = source();
        media.acquire(true, true).await.unwrap();
        media.set_audio_enabled(false);
        let camera = media.camera().unwrap();
        assert!(!camera.track_of(TrackKind::Audio).unwrap().is_enabled());
        assert!(camera.track_of(TrackKind::Video).unwrap().is_enabled());

        // Mute survives reacquisition.
        media.acquire(true, true).await.unwrap();
        let camera = media.camera().unwrap();
        assert!(!camera.track_of(TrackKind::Audio).unwrap().is_enabled());
    }

    #[tokio::test]
    async fn screen_capture_leaves_camera_running() {
        let (mut media, _events) = source();
        media.acquire(true, true).await.unwrap();
        let camera_video = media.camera_video_track().unwrap();

        media.start_screen_capture().await.unwrap();
        assert!(media.is_screen_sharing());
        assert!(!camera_video.is_stopped());

        let outbound = media.outbound_tracks();
        let video = outbound
            .iter()
            .find(|t| t.kind() == TrackKind::Video)
            .unwrap();
        assert_ne!(video.id(), camera_video.id());

        media.stop_screen_capture();
        assert!(!media.is_screen_sharing());
        let outbound = media.outbound_tracks();
        let video = outbound
            .iter()
            .find(|t| t.kind() == TrackKind::Video)
            .unwrap();
        assert_eq!(video.id(), camera_video.id());
    }

    #[tokio::test]
    async fn source_ending_screen_capture_raises_event() {
        let backend = Arc::new(SyntheticBackend::new());
        let (mut media, mut events) = MediaSource::new(Arc::clone(&backend) as Arc<dyn CaptureBackend>);
        media.start_screen_capture().await.unwrap();

        backend.end_screen_capture();
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(MediaEvent::ScreenCaptureEnded));
    }

    #[tokio::test]
    async fn capture_failure_surfaces_as_error() {
        let (mut media, _events) =
            MediaSource::new(Arc::new(SyntheticBackend::without_camera()));
        assert!(media.acquire(true, true).await.is_err());
        // Audio-only still works on the same backend.
        media.acquire(false, true).await.unwrap();
        assert!(media.camera().is_some());
    }
}
