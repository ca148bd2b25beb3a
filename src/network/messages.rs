use serde::{Deserialize, Serialize};

use crate::frame_info::SavedChecksum;
use crate::Frame;

/// Connection status for a player slot, shared between the rollback controller
/// and every peer endpoint: "the highest frame we know is safe for this player".
///
/// `last_frame` is non-decreasing and `disconnected` is sticky once set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Whether this player has disconnected.
    pub disconnected: bool,
    /// The last frame received from this player.
    pub last_frame: Frame,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: Frame::NULL,
        }
    }
}

/// One part of a chunked session-parameter exchange. The full payload may
/// exceed a single message's practical size, so it is split into numbered
/// parts sharing one `first_part_seq` that identifies the exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct DataSyncRequest {
    /// Sequence number of the exchange's first part; identifies the exchange.
    pub first_part_seq: u32,
    /// Total number of parts in the exchange.
    pub part_count: u32,
    /// Which part this message carries.
    pub part_index: u32,
    /// The bytes of this part.
    pub part: Vec<u8>,
}

/// Acknowledges one received part of a parameter exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct DataSyncReply {
    /// The exchange being acknowledged.
    pub first_part_seq: u32,
    /// The part index being acknowledged.
    pub ack_part_index: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncRequest {
    pub random_request: u32, // please reply back with this random data
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncReply {
    pub random_reply: u32, // here's your random data back
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Input {
    pub peer_connect_status: Vec<ConnectionStatus>,
    pub disconnect_requested: bool,
    /// The frame of the first row in `inputs`.
    pub start_frame: Frame,
    /// The last frame we received from the peer, acknowledged piggyback.
    pub ack_frame: Frame,
    /// One encoded per-player input row per consecutive frame starting at
    /// `start_frame`.
    pub inputs: Vec<Vec<u8>>,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            peer_connect_status: Vec::new(),
            disconnect_requested: false,
            start_frame: Frame::NULL,
            ack_frame: Frame::NULL,
            inputs: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // destructure so new fields cannot be forgotten here
        let Self {
            peer_connect_status,
            disconnect_requested,
            start_frame,
            ack_frame,
            inputs,
        } = self;

        f.debug_struct("Input")
            .field("peer_connect_status", peer_connect_status)
            .field("disconnect_requested", disconnect_requested)
            .field("start_frame", start_frame)
            .field("ack_frame", ack_frame)
            .field("inputs", &format_args!("{} row(s)", inputs.len()))
            .finish()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct InputAck {
    pub ack_frame: Frame,
}

impl Default for InputAck {
    fn default() -> Self {
        Self {
            ack_frame: Frame::NULL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReport {
    /// Frame advantage of the sending player.
    ///
    /// An i16 rather than an i8: the value is typically single-digit, but if
    /// quality reports go unread for a while (backgrounded tab, debugger) it
    /// can exceed an i8's range long before the peer would be disconnected.
    pub frame_advantage: i16,
    /// Wall-clock milliseconds at send time, echoed back for RTT measurement.
    pub ping: u128,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReply {
    pub pong: u128,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SavedChecksums {
    pub checksums: Vec<SavedChecksum>,
}

/// Every message carries a per-sender monotonically increasing sequence
/// number. Receivers drop anything that is not strictly newer than the last
/// accepted sequence from that peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct MessageHeader {
    pub sequence: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MessageBody {
    DataSyncRequest(DataSyncRequest),
    DataSyncReply(DataSyncReply),
    SyncRequest(SyncRequest),
    SyncReply(SyncReply),
    Input(Input),
    InputAck(InputAck),
    QualityReport(QualityReport),
    QualityReply(QualityReply),
    SavedChecksums(SavedChecksums),
    KeepAlive,
}

/// A message that a [`MessageTransport`] sends and receives. When implementing
/// [`MessageTransport`], you should deserialize received messages into this
/// `Message` type and pass them on.
///
/// [`MessageTransport`]: crate::MessageTransport
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub(crate) header: MessageHeader,
    pub(crate) body: MessageBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_status_default() {
        let status = ConnectionStatus::default();
        assert!(!status.disconnected);
        assert_eq!(status.last_frame, Frame::NULL);
    }

    #[test]
    fn input_default_is_empty() {
        let input = Input::default();
        assert!(input.peer_connect_status.is_empty());
        assert!(!input.disconnect_requested);
        assert_eq!(input.start_frame, Frame::NULL);
        assert_eq!(input.ack_frame, Frame::NULL);
        assert!(input.inputs.is_empty());
    }

    #[test]
    fn input_debug_summarizes_rows() {
        let input = Input {
            peer_connect_status: vec![ConnectionStatus::default()],
            disconnect_requested: true,
            start_frame: Frame::new(10),
            ack_frame: Frame::new(5),
            inputs: vec![vec![1, 2], vec![3, 4]],
        };
        let debug = format!("{:?}", input);
        assert!(debug.contains("disconnect_requested"));
        assert!(debug.contains("2 row(s)"));
    }

    #[test]
    fn message_roundtrips_through_codec() {
        use crate::network::codec;

        let msg = Message {
            header: MessageHeader { sequence: 17 },
            body: MessageBody::DataSyncRequest(DataSyncRequest {
                first_part_seq: 17,
                part_count: 3,
                part_index: 0,
                part: vec![0xDE, 0xAD],
            }),
        };

        let bytes = codec::encode(&msg).expect("encode");
        let (decoded, _): (Message, _) = codec::decode(&bytes).expect("decode");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn all_body_variants_roundtrip() {
        use crate::network::codec;

        let bodies = vec![
            MessageBody::DataSyncRequest(DataSyncRequest::default()),
            MessageBody::DataSyncReply(DataSyncReply::default()),
            MessageBody::SyncRequest(SyncRequest { random_request: 1 }),
            MessageBody::SyncReply(SyncReply { random_reply: 1 }),
            MessageBody::Input(Input::default()),
            MessageBody::InputAck(InputAck::default()),
            MessageBody::QualityReport(QualityReport {
                frame_advantage: -3,
                ping: 12345,
            }),
            MessageBody::QualityReply(QualityReply { pong: 12345 }),
            MessageBody::SavedChecksums(SavedChecksums {
                checksums: vec![SavedChecksum::new(Frame::new(60), "a".to_owned())],
            }),
            MessageBody::KeepAlive,
        ];
        for (i, body) in bodies.into_iter().enumerate() {
            let msg = Message {
                header: MessageHeader { sequence: i as u32 },
                body,
            };
            let bytes = codec::encode(&msg).expect("encode");
            let (decoded, _): (Message, _) = codec::decode(&bytes).expect("decode");
            assert_eq!(msg, decoded);
        }
    }
}
