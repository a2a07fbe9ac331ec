pub mod source;
pub mod synthetic;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::identity::tagged_id;

pub use source::{CaptureBackend, CaptureTrack, MediaEvent, MediaSource};
pub use synthetic::SyntheticBackend;

/// Stream id carried by camera tracks. Receivers use it to tell camera
/// video apart from screen video.
pub const CAMERA_STREAM_ID: &str = "camera";
/// Stream id carried by the screen capture track.
pub const SCREEN_STREAM_ID: &str = "screen";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn mime(self) -> &'static str {
        match self {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }

    pub(crate) fn codec_type(self) -> RTPCodecType {
        match self {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        }
    }
}

/// An outbound track fed by a capture sample stream. The pump task keeps
/// writing samples until the source closes or the track is stopped;
/// disabling the track drops samples instead of stopping the pump, so the
/// SDP topology is unchanged by a toggle.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    stopped: AtomicBool,
    pump: JoinHandle<()>,
}

impl LocalTrack {
    pub fn spawn(
        kind: TrackKind,
        stream_id: &str,
        mut samples: mpsc::Receiver<Sample>,
    ) -> Arc<Self> {
        let id = tagged_id(kind.as_str());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: kind.mime().to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        ));
        let enabled = Arc::new(AtomicBool::new(true));

        let pump = {
            let rtc = Arc::clone(&rtc);
            let enabled = Arc::clone(&enabled);
            let id = id.clone();
            tokio::spawn(async move {
                while let Some(sample) = samples.recv().await {
                    if !enabled.load(Ordering::Relaxed) {
                        continue;
                    }
                    if let Err(err) = rtc.write_sample(&sample).await {
                        debug!(track_id = %id, error = %err, "sample write failed");
                    }
                }
                debug!(track_id = %id, "sample source closed");
            })
        };

        Arc::new(Self {
            id,
            kind,
            rtc,
            enabled,
            stopped: AtomicBool::new(false),
            pump,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn rtc(&self) -> &Arc<TrackLocalStaticSample> {
        &self.rtc
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Ends the pump. The track stays attached to any connection that holds
    /// it but produces no further samples.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.pump.abort();
    }
}

impl Drop for LocalTrack {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// A bundle of local tracks sharing one stream id, mirroring how a capture
/// device hands back audio and video together.
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(id: &str, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: id.to_owned(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn track_of(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn track_toggle_does_not_stop_it() {
        let (_tx, rx) = mpsc::channel(4);
        let track = LocalTrack::spawn(TrackKind::Audio, CAMERA_STREAM_ID, rx);
        assert!(track.is_enabled());
        track.set_enabled(false);
        assert!(!track.is_enabled());
        assert!(!track.is_stopped());
        track.set_enabled(true);
        assert!(track.is_enabled());
        track.stop();
        assert!(track.is_stopped());
    }

    #[tokio::test]
    async fn stream_stop_stops_every_track() {
        let (_tx_a, rx_a) = mpsc::channel(4);
        let (_tx_v, rx_v) = mpsc::channel(4);
        let stream = LocalStream::new(
            CAMERA_STREAM_ID,
            vec![
                LocalTrack::spawn(TrackKind::Audio, CAMERA_STREAM_ID, rx_a),
                LocalTrack::spawn(TrackKind::Video, CAMERA_STREAM_ID, rx_v),
            ],
        );
        assert!(stream.track_of(TrackKind::Audio).is_some());
        assert!(stream.track_of(TrackKind::Video).is_some());
        stream.stop();
        assert!(stream.tracks().iter().all(|t| t.is_stopped()));
    }

    #[test]
    fn kind_mime_mapping() {
        assert_eq!(TrackKind::Audio.mime(), MIME_TYPE_OPUS);
        assert_eq!(TrackKind::Video.mime(), MIME_TYPE_VP8);
    }
}
