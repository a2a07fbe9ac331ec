use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use webrtc::media::Sample;

use crate::error::MediaError;

use super::source::{CaptureBackend, CaptureTrack};
use super::TrackKind;

const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(33);
const AUDIO_SAMPLE_RATE: usize = 48_000;
const VIDEO_WIDTH: usize = 320;
const VIDEO_HEIGHT: usize = 240;

/// Deterministic capture backend generating synthetic audio and video.
/// Stands in for real devices in tests and headless runs; failure modes
/// are configurable so acquisition fallbacks can be exercised.
pub struct SyntheticBackend {
    camera_available: bool,
    screen_supported: bool,
    screen_denied: bool,
    screen_stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self {
            camera_available: true,
            screen_supported: true,
            screen_denied: false,
            screen_stop: Mutex::new(None),
        }
    }

    /// Video capture fails; audio-only still succeeds.
    pub fn without_camera() -> Self {
        Self {
            camera_available: false,
            ..Self::new()
        }
    }

    /// Screen capture reports no support at all.
    pub fn without_screen() -> Self {
        Self {
            screen_supported: false,
            ..Self::new()
        }
    }

    /// Screen capture is supported but permission is refused.
    pub fn with_screen_denied() -> Self {
        Self {
            screen_denied: true,
            ..Self::new()
        }
    }

    /// Simulates the capture source stopping on its own, the way a user
    /// ends a share from outside the application.
    pub fn end_screen_capture(&self) {
        if let Ok(mut guard) = self.screen_stop.lock() {
            if let Some(stop) = guard.take() {
                let _ = stop.send(());
            }
        }
    }

    fn spawn_audio(&self) -> CaptureTrack {
        let (tx, rx) = mpsc::channel(32);
        let (ended_tx, ended_rx) = oneshot::channel();
        tokio::spawn(async move {
            // Keep the ended sender alive so the receiver never fires.
            let _ended = ended_tx;
            let samples_per_frame = AUDIO_SAMPLE_RATE / 50;
            let mut phase = 0f64;
            let mut ticker = tokio::time::interval(AUDIO_FRAME);
            loop {
                ticker.tick().await;
                let mut data = Vec::with_capacity(samples_per_frame * 2);
                for _ in 0..samples_per_frame {
                    let value = (phase.sin() * i16::MAX as f64 * 0.2) as i16;
                    data.extend_from_slice(&value.to_le_bytes());
                    phase += 2.0 * std::f64::consts::PI * 440.0 / AUDIO_SAMPLE_RATE as f64;
                }
                let sample = Sample {
                    data: Bytes::from(data),
                    duration: AUDIO_FRAME,
                    ..Default::default()
                };
                if tx.send(sample).await.is_err() {
                    break;
                }
            }
        });
        CaptureTrack {
            kind: TrackKind::Audio,
            samples: rx,
            ended: ended_rx,
        }
    }

    fn spawn_video(&self, shade: u8) -> (CaptureTrack, oneshot::Sender<()>) {
        let (tx, rx) = mpsc::channel(8);
        let (ended_tx, ended_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut bar = 0usize;
            let mut ticker = tokio::time::interval(VIDEO_FRAME);
            loop {
                ticker.tick().await;
                let mut data = vec![shade; VIDEO_WIDTH * VIDEO_HEIGHT];
                let column = bar % VIDEO_WIDTH;
                for row in 0..VIDEO_HEIGHT {
                    data[row * VIDEO_WIDTH + column] = 0xff;
                }
                bar += 4;
                let sample = Sample {
                    data: Bytes::from(data),
                    duration: VIDEO_FRAME,
                    ..Default::default()
                };
                if tx.send(sample).await.is_err() {
                    break;
                }
            }
        });
        (
            CaptureTrack {
                kind: TrackKind::Video,
                samples: rx,
                ended: ended_rx,
            },
            ended_tx,
        )
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureBackend for SyntheticBackend {
    async fn open_capture(
        &self,
        video: bool,
        audio: bool,
    ) -> Result<Vec<CaptureTrack>, MediaError> {
        if !video && !audio {
            return Err(MediaError::AcquisitionFailed(
                "no capture modality requested".to_owned(),
            ));
        }
        if video && !self.camera_available {
            return Err(MediaError::AcquisitionFailed(
                "camera device unavailable".to_owned(),
            ));
        }
        let mut tracks = Vec::new();
        if audio {
            tracks.push(self.spawn_audio());
        }
        if video {
            let (track, ended_tx) = self.spawn_video(0x30);
            // Camera capture never ends on its own; parking the sender in a
            // detached task keeps the receiver pending forever.
            tokio::spawn(async move {
                let _hold = ended_tx;
                std::future::pending::<()>().await;
            });
            tracks.push(track);
        }
        Ok(tracks)
    }

    async fn open_screen(&self) -> Result<CaptureTrack, MediaError> {
        if !self.screen_supported {
            return Err(MediaError::CaptureUnsupported);
        }
        if self.screen_denied {
            return Err(MediaError::CaptureDenied);
        }
        let (track, ended_tx) = self.spawn_video(0xc0);
        if let Ok(mut guard) = self.screen_stop.lock() {
            *guard = Some(ended_tx);
        }
        Ok(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn synthetic_audio_produces_frames() {
        let backend = SyntheticBackend::new();
        let mut tracks = backend.open_capture(false, true).await.unwrap();
        assert_eq!(tracks.len(), 1);
        let track = tracks.pop().unwrap();
        assert_eq!(track.kind, TrackKind::Audio);
        let mut samples = track.samples;
        let sample = tokio::time::timeout(Duration::from_secs(1), samples.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.duration, AUDIO_FRAME);
        assert!(!sample.data.is_empty());
    }

    #[tokio::test]
    async fn capture_errors_mirror_the_configured_failure() {
        assert!(matches!(
            SyntheticBackend::without_camera().open_capture(true, true).await,
            Err(MediaError::AcquisitionFailed(_))
        ));
        assert!(matches!(
            SyntheticBackend::without_screen().open_screen().await,
            Err(MediaError::CaptureUnsupported)
        ));
        assert!(matches!(
            SyntheticBackend::with_screen_denied().open_screen().await,
            Err(MediaError::CaptureDenied)
        ));
        assert!(matches!(
            SyntheticBackend::new().open_capture(false, false).await,
            Err(MediaError::AcquisitionFailed(_))
        ));
    }

    #[tokio::test]
    async fn ended_fires_when_screen_capture_stops_at_source() {
        let backend = SyntheticBackend::new();
        let track = backend.open_screen().await.unwrap();
        backend.end_screen_capture();
        tokio::time::timeout(Duration::from_secs(1), track.ended)
            .await
            .unwrap()
            .unwrap();
    }
}
