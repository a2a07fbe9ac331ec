use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use super::session::SessionEvent;
use super::types::ChannelPayload;

/// Label of the single application data channel per peer pair.
pub const CHANNEL_LABEL: &str = "lanmesh-data";

pub(crate) fn encode_payload(payload: &ChannelPayload) -> Result<Bytes, serde_json::Error> {
    Ok(Bytes::from(serde_json::to_vec(payload)?))
}

pub(crate) fn decode_payload(data: &[u8]) -> Result<ChannelPayload, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Wires the channel's callbacks to the session event queue. Malformed
/// inbound frames are logged and dropped; channel errors never tear the
/// session down on their own.
pub(crate) fn attach_channel(
    dc: &Arc<RTCDataChannel>,
    peer_id: &str,
    events: &mpsc::Sender<SessionEvent>,
) {
    let id = peer_id.to_owned();
    let tx = events.clone();
    dc.on_open(Box::new(move || {
        let id = id.clone();
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(SessionEvent::ChannelOpen { peer_id: id }).await;
        })
    }));

    let id = peer_id.to_owned();
    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let id = id.clone();
        let tx = tx.clone();
        Box::pin(async move {
            match decode_payload(&msg.data) {
                Ok(payload) => {
                    let _ = tx
                        .send(SessionEvent::ChannelPayload {
                            peer_id: id,
                            payload,
                        })
                        .await;
                }
                Err(err) => {
                    warn!(peer_id = %id, error = %err, "dropping malformed data channel frame");
                }
            }
        })
    }));

    let id = peer_id.to_owned();
    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let id = id.clone();
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(SessionEvent::ChannelClosed { peer_id: id }).await;
        })
    }));

    let id = peer_id.to_owned();
    dc.on_error(Box::new(move |err| {
        let id = id.clone();
        Box::pin(async move {
            warn!(peer_id = %id, error = %err, "data channel error");
        })
    }));
}

/// Sends a payload if the channel is open; a channel that is still
/// connecting or already closed is skipped rather than buffered.
pub(crate) async fn try_send(dc: &Arc<RTCDataChannel>, payload: &ChannelPayload) -> bool {
    if dc.ready_state() != RTCDataChannelState::Open {
        debug!(label = %dc.label(), "skipping send on non-open data channel");
        return false;
    }
    let frame = match encode_payload(payload) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "failed to encode data channel payload");
            return false;
        }
    };
    match dc.send(&frame).await {
        Ok(_) => true,
        Err(err) => {
            warn!(error = %err, "data channel send failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_survive_the_wire_encoding() {
        let payload = ChannelPayload::Message {
            content: "ping".into(),
        };
        let frame = encode_payload(&payload).unwrap();
        assert_eq!(decode_payload(&frame).unwrap(), payload);
    }

    #[test]
    fn decode_rejects_unknown_type_tag() {
        assert!(decode_payload(br#"{"type":"presence","content":"x"}"#).is_err());
        assert!(decode_payload(b"not json").is_err());
    }
}
