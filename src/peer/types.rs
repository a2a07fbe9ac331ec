use serde::{Deserialize, Serialize};

use crate::identity::{tagged_id, LocalIdentity};

/// A chat message as republished to the owner. Append-only: never mutated
/// after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationMessage {
    pub id: String,
    pub peer_id: String,
    pub peer_name: String,
    pub content: String,
    /// Unix milliseconds at receipt (or composition, for own messages).
    pub timestamp: i64,
}

impl ApplicationMessage {
    /// Wraps inbound data-channel content with local receive metadata.
    pub(crate) fn received(peer_id: &str, peer_name: &str, content: String) -> Self {
        Self {
            id: tagged_id("msg"),
            peer_id: peer_id.to_owned(),
            peer_name: peer_name.to_owned(),
            content,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// The sender's own copy, for the caller's local log.
    pub(crate) fn outgoing(identity: &LocalIdentity, content: &str) -> Self {
        Self {
            id: tagged_id("msg"),
            peer_id: identity.peer_id.clone(),
            peer_name: identity.display_name.clone(),
            content: content.to_owned(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Complete,
    Aborted,
}

/// Lifecycle record of one announced file transfer. Chunk transport is out
/// of scope; the descriptor still honors pending → in-progress →
/// complete/aborted.
#[derive(Debug, Clone, PartialEq)]
pub struct FileTransferDescriptor {
    pub id: String,
    pub peer_id: String,
    pub peer_name: String,
    pub name: String,
    pub size: u64,
    /// Fraction of `size` received, in `[0.0, 1.0]`.
    pub progress: f32,
    pub status: TransferStatus,
    pub data: Option<Vec<u8>>,
}

impl FileTransferDescriptor {
    /// Created on receipt of `file-meta` from a peer.
    pub(crate) fn announced(
        id: String,
        peer_id: &str,
        peer_name: &str,
        name: String,
        size: u64,
    ) -> Self {
        Self {
            id,
            peer_id: peer_id.to_owned(),
            peer_name: peer_name.to_owned(),
            name,
            size,
            progress: 0.0,
            status: TransferStatus::Pending,
            data: None,
        }
    }

    /// The sender's own descriptor, announced to every open channel.
    pub(crate) fn outgoing(identity: &LocalIdentity, name: &str, size: u64) -> Self {
        Self {
            id: tagged_id("file"),
            peer_id: identity.peer_id.clone(),
            peer_name: identity.display_name.clone(),
            name: name.to_owned(),
            size,
            progress: 0.0,
            status: TransferStatus::Pending,
            data: None,
        }
    }

    /// Records `bytes_done` of `size` received; flips to `Complete` when the
    /// whole file has arrived. No-op once terminal.
    pub fn record_progress(&mut self, bytes_done: u64) {
        if matches!(self.status, TransferStatus::Complete | TransferStatus::Aborted) {
            return;
        }
        if self.size == 0 || bytes_done >= self.size {
            self.progress = 1.0;
            self.status = TransferStatus::Complete;
        } else {
            self.progress = bytes_done as f32 / self.size as f32;
            self.status = TransferStatus::InProgress;
        }
    }

    /// Marks the transfer aborted. Completed transfers stay completed.
    pub fn abort(&mut self) {
        if self.status != TransferStatus::Complete {
            self.status = TransferStatus::Aborted;
            self.data = None;
        }
    }
}

/// Application payloads exchanged over the per-peer data channel,
/// discriminated by a `type` tag on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelPayload {
    Message { content: String },
    FileMeta { id: String, name: String, size: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_payload_uses_type_tag() {
        let json = serde_json::to_value(ChannelPayload::Message {
            content: "hello".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["content"], "hello");
    }

    #[test]
    fn file_meta_payload_round_trips() {
        let payload = ChannelPayload::FileMeta {
            id: "file-1".into(),
            name: "notes.txt".into(),
            size: 1234,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"type\":\"file-meta\""));
        let back: ChannelPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn transfer_lifecycle_pending_to_complete() {
        let mut transfer =
            FileTransferDescriptor::announced("file-1".into(), "peer-a", "alice", "a.bin".into(), 100);
        assert_eq!(transfer.status, TransferStatus::Pending);
        assert_eq!(transfer.progress, 0.0);

        transfer.record_progress(25);
        assert_eq!(transfer.status, TransferStatus::InProgress);
        assert!((transfer.progress - 0.25).abs() < f32::EPSILON);

        transfer.record_progress(100);
        assert_eq!(transfer.status, TransferStatus::Complete);
        assert_eq!(transfer.progress, 1.0);

        // Terminal states stick.
        transfer.abort();
        assert_eq!(transfer.status, TransferStatus::Complete);
    }

    #[test]
    fn transfer_abort_from_in_progress() {
        let mut transfer =
            FileTransferDescriptor::announced("file-2".into(), "peer-a", "alice", "b.bin".into(), 10);
        transfer.record_progress(5);
        transfer.abort();
        assert_eq!(transfer.status, TransferStatus::Aborted);
        transfer.record_progress(10);
        assert_eq!(transfer.status, TransferStatus::Aborted);
    }
}
