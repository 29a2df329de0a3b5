//! # JeeLabs Packet Codec
//!
//! Stateless conversion between raw radio frames and [`DecodedPacket`]s, plus
//! construction of the minimal acknowledgment frame sent back to a node.
//!
//! ## V1 layout
//!
//! ```text
//! byte 0      : 6-bit dest node id, top 2 bits group parity
//! byte 1      : 6-bit source node id, bit 7 ack requested
//! byte 2      : 7-bit format code, bit 7 trailer present
//! byte 3..    : node id, varint encoded (node -> gateway frames only)
//! ...         : payload
//! len-2       : optional, 6-bit margin reported by the sender
//! len-1       : optional, signed frequency error / 128
//! ```
//!
//! ## V2 layout
//!
//! ```text
//! byte 0      : header (bit 6 special, bit 5 from gateway, bit 4 ack requested,
//!               low bits 0b10 to disambiguate from V1)
//! byte 1..=4  : 32-bit node id, little-endian
//! byte 5      : 7-bit format code, bit 7 trailer present
//! byte 6..    : payload, followed by the optional 2-byte trailer
//! ```
//!
//! An ack must start within ~10ms of the end of the received frame, so nothing
//! here allocates beyond the payload copy or touches I/O.

pub mod varint;

use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::radio::RadioFrame;
use varint::{decode_varint, MAX_VARINT_LEN};

/// Node id reserved for transmit-only nodes; drives the V1/V2 heuristic.
pub const TX_ONLY_NODE_ID: u8 = 61;

const V1_HEADER_LEN: usize = 3;
const V1_MIN_LEN: usize = 5;
const V1_MIN_LEN_WITH_TRAILER: usize = 9;
const V1_MIN_NODE_ID_REGION: usize = 4;
const V2_HEADER_LEN: usize = 6;
const V2_MIN_LEN_WITH_TRAILER: usize = 8;
const TRAILER_LEN: usize = 2;
const MAX_MARGIN: u8 = 0x3F;
const FEI_UNIT_HZ: i16 = 128;

/// Header byte handed to the driver together with a V1 ack body.
pub const V1_ACK_HEADER: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatVersion {
    V1,
    V2,
}

impl std::fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatVersion::V1 => write!(f, "v1"),
            FormatVersion::V2 => write!(f, "v2"),
        }
    }
}

/// Link quality the sender observed on our previous transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    /// Margin above the noise floor, 0..=63 dB.
    pub margin: u8,
    /// Frequency error in Hz, a multiple of 128.
    pub fei: i16,
}

impl Trailer {
    fn parse(margin: u8, fei: u8) -> Self {
        Trailer {
            margin: margin & MAX_MARGIN,
            fei: (fei as i8) as i16 * FEI_UNIT_HZ,
        }
    }
}

/// Local reception metadata copied verbatim from the [`RadioFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkMeta {
    pub rssi: i16,
    pub snr: u8,
    pub fei: i16,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub version: FormatVersion,
    pub is_ack: bool,
    pub from_gateway: bool,
    pub ack_requested: bool,
    /// V2 control bit; always false for V1.
    pub special: bool,
    /// Format code, 0..=127.
    pub format: u8,
    pub node_id: u32,
    pub payload: Vec<u8>,
    pub trailer: Option<Trailer>,
    pub link: LinkMeta,
    /// Last hand-off to the message bus; `None` until first forwarded.
    pub forwarded_at: Option<Instant>,
}

impl DecodedPacket {
    pub fn has_trailer(&self) -> bool {
        self.trailer.is_some()
    }

    /// Compact flag string used in receive logs, e.g. `.<Q.T`.
    pub fn flag_summary(&self) -> String {
        [
            if self.is_ack { 'A' } else { '.' },
            if self.from_gateway { '>' } else { '<' },
            if self.ack_requested { 'Q' } else { '.' },
            if self.special { 'S' } else { '.' },
            if self.has_trailer() { 'T' } else { '.' },
        ]
        .iter()
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame too short: {len} bytes (min {min})")]
    TooShort { len: usize, min: usize },
    #[error("trailer flag set but frame has only {len} bytes (min {min})")]
    TruncatedTrailer { len: usize, min: usize },
    #[error("malformed varint node id")]
    MalformedNodeId,
    #[error("ack encoding not implemented for {0} frames")]
    AckUnsupported(FormatVersion),
}

impl CodecError {
    /// True for errors that mean the received frame cannot be decoded.
    pub fn is_undecodable(&self) -> bool {
        !matches!(self, CodecError::AckUnsupported(_))
    }
}

/// Pick the wire format of a frame. Frames under two bytes count as V2.
pub fn detect_version(bytes: &[u8]) -> FormatVersion {
    let (a, b) = match bytes {
        [a, b, ..] => (a & 0x3F, b & 0x3F),
        _ => return FormatVersion::V2,
    };
    if (a == 0 && b == TX_ONLY_NODE_ID) || (b == 0 && a == TX_ONLY_NODE_ID) {
        FormatVersion::V1
    } else {
        FormatVersion::V2
    }
}

/// Decode a received frame into a [`DecodedPacket`].
pub fn decode(frame: &RadioFrame) -> Result<DecodedPacket, CodecError> {
    let bytes = frame.bytes.as_slice();
    if bytes.len() < 2 {
        return Err(CodecError::TooShort {
            len: bytes.len(),
            min: 2,
        });
    }
    let link = LinkMeta {
        rssi: frame.rssi,
        snr: frame.snr,
        fei: frame.fei,
        received_at: frame.received_at,
    };
    match detect_version(bytes) {
        FormatVersion::V1 => decode_v1(bytes, link),
        FormatVersion::V2 => decode_v2(bytes, link),
    }
}

fn split_trailer(bytes: &[u8], present: bool) -> (&[u8], Option<Trailer>) {
    if present {
        let n = bytes.len();
        (
            &bytes[..n - TRAILER_LEN],
            Some(Trailer::parse(bytes[n - 2], bytes[n - 1])),
        )
    } else {
        (bytes, None)
    }
}

fn decode_v1(bytes: &[u8], link: LinkMeta) -> Result<DecodedPacket, CodecError> {
    let len = bytes.len();
    if len < V1_MIN_LEN {
        return Err(CodecError::TooShort {
            len,
            min: V1_MIN_LEN,
        });
    }
    let has_trailer = bytes[2] & 0x80 != 0;
    if has_trailer && len < V1_MIN_LEN_WITH_TRAILER {
        return Err(CodecError::TruncatedTrailer {
            len,
            min: V1_MIN_LEN_WITH_TRAILER,
        });
    }
    let (body, trailer) = split_trailer(bytes, has_trailer);
    let from_gateway = bytes[0] & 0x3F != 0;
    let remaining = &body[V1_HEADER_LEN..];

    // Gateways only ever send acks and those never carry a node id.
    let (node_id, payload) = if !from_gateway && remaining.len() >= V1_MIN_NODE_ID_REGION {
        let window = remaining.len().min(MAX_VARINT_LEN);
        let (id, used) =
            decode_varint(remaining, window).map_err(|_| CodecError::MalformedNodeId)?;
        (id, &remaining[used..])
    } else {
        (0, remaining)
    };

    Ok(DecodedPacket {
        version: FormatVersion::V1,
        is_ack: from_gateway,
        from_gateway,
        ack_requested: bytes[1] & 0x80 != 0,
        special: false,
        format: bytes[2] & 0x7F,
        node_id,
        payload: payload.to_vec(),
        trailer,
        link,
        forwarded_at: None,
    })
}

fn decode_v2(bytes: &[u8], link: LinkMeta) -> Result<DecodedPacket, CodecError> {
    let len = bytes.len();
    if len < V2_HEADER_LEN {
        return Err(CodecError::TooShort {
            len,
            min: V2_HEADER_LEN,
        });
    }
    let has_trailer = bytes[5] & 0x80 != 0;
    if has_trailer && len < V2_MIN_LEN_WITH_TRAILER {
        return Err(CodecError::TruncatedTrailer {
            len,
            min: V2_MIN_LEN_WITH_TRAILER,
        });
    }
    let (body, trailer) = split_trailer(bytes, has_trailer);
    let header = bytes[0];
    let special = header & 0x40 != 0;
    let ack_requested = header & 0x10 != 0;

    Ok(DecodedPacket {
        version: FormatVersion::V2,
        // ctrl=1, ack=0 marks an ack; ctrl=1, ack=1 is unused
        is_ack: special && !ack_requested,
        from_gateway: header & 0x20 != 0,
        ack_requested,
        special,
        format: bytes[5] & 0x7F,
        node_id: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
        payload: body[V2_HEADER_LEN..].to_vec(),
        trailer,
        link,
        forwarded_at: None,
    })
}

/// Minimal ack frame: `header` goes to the driver separately from `body`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub header: u8,
    pub body: Vec<u8>,
}

/// Build the ack for a packet received with the given margin and frequency error.
pub fn encode_ack(version: FormatVersion, margin: u8, fei: i16) -> Result<AckFrame, CodecError> {
    match version {
        FormatVersion::V1 => {
            let fei_units = (fei / FEI_UNIT_HZ).clamp(i8::MIN as i16, i8::MAX as i16) as i8;
            Ok(AckFrame {
                header: V1_ACK_HEADER,
                body: vec![
                    0x00, // broadcast dest
                    0x80, // format 0 with trailer
                    margin.min(MAX_MARGIN),
                    fei_units as u8,
                ],
            })
        }
        FormatVersion::V2 => Err(CodecError::AckUnsupported(FormatVersion::V2)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: &[u8]) -> RadioFrame {
        RadioFrame::new(bytes.to_vec(), -70, 20, -256, Utc::now())
    }

    #[test]
    fn disambiguation_heuristic() {
        assert_eq!(detect_version(&[0x00, 61]), FormatVersion::V1);
        assert_eq!(detect_version(&[0xC0 | 61, 0x80]), FormatVersion::V1);
        assert_eq!(detect_version(&[0x02, 61]), FormatVersion::V2);
        assert_eq!(detect_version(&[0x00, 0x00]), FormatVersion::V2);
        assert_eq!(detect_version(&[61, 61]), FormatVersion::V2);
    }

    #[test]
    fn undersized_frames_are_rejected() {
        assert!(matches!(decode(&frame(&[])), Err(CodecError::TooShort { .. })));
        assert!(matches!(decode(&frame(&[0x00])), Err(CodecError::TooShort { .. })));
        assert!(matches!(
            decode(&frame(&[0x00, 61, 0x05, 0x01])),
            Err(CodecError::TooShort { min: 5, .. })
        ));
        assert!(matches!(
            decode(&frame(&[0x02, 1, 2, 3, 4])),
            Err(CodecError::TooShort { min: 6, .. })
        ));
    }

    #[test]
    fn v1_short_node_frame_keeps_bytes_as_payload() {
        let pkt = decode(&frame(&[0x00, 61, 0x03, 0xAA, 0xBB])).unwrap();
        assert_eq!(pkt.node_id, 0);
        assert_eq!(pkt.payload, vec![0xAA, 0xBB]);
        assert_eq!(pkt.format, 3);
        assert!(!pkt.from_gateway);
    }

    #[test]
    fn v1_gateway_frame_is_ack() {
        let pkt = decode(&frame(&[61, 0x00, 0x05, 1, 2, 3, 4])).unwrap();
        assert!(pkt.from_gateway);
        assert!(pkt.is_ack);
        assert_eq!(pkt.node_id, 0);
        assert_eq!(pkt.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn v1_overlong_node_id_fails_closed() {
        let bytes = [0x00, 61, 0x01, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80];
        assert_eq!(decode(&frame(&bytes)), Err(CodecError::MalformedNodeId));
        // continuation bit runs into the end of the frame
        let bytes = [0x00, 61, 0x01, 0x81, 0x82, 0x83, 0x84];
        assert_eq!(decode(&frame(&bytes)), Err(CodecError::MalformedNodeId));
    }

    #[test]
    fn v1_node_id_does_not_read_into_trailer() {
        // varint would continue into the trailer bytes
        let bytes = [0x00, 61, 0x81, 0x81, 0x82, 0x83, 0x84, 0x10, 0x01];
        assert_eq!(decode(&frame(&bytes)), Err(CodecError::MalformedNodeId));
    }

    #[test]
    fn v1_trailer_requires_nine_bytes() {
        let bytes = [0x00, 61, 0x81, 0x05, 1, 2, 0x10, 0xFF];
        assert!(matches!(
            decode(&frame(&bytes)),
            Err(CodecError::TruncatedTrailer { min: 9, .. })
        ));
    }

    #[test]
    fn v2_fields() {
        let bytes = [0x52, 0x01, 0x10, 0x00, 0x00, 0x85, 9, 8, 7, 0x3F, 0x02];
        let pkt = decode(&frame(&bytes)).unwrap();
        assert_eq!(pkt.version, FormatVersion::V2);
        assert_eq!(pkt.node_id, 0x1001);
        assert_eq!(pkt.format, 5);
        assert!(pkt.special);
        assert!(pkt.ack_requested);
        assert!(!pkt.from_gateway);
        assert!(!pkt.is_ack);
        assert_eq!(pkt.payload, vec![9, 8, 7]);
        assert_eq!(pkt.trailer, Some(Trailer { margin: 63, fei: 256 }));
        assert_eq!(pkt.flag_summary(), ".<QST");
    }

    #[test]
    fn v2_trailer_requires_eight_bytes() {
        let bytes = [0x02, 1, 0, 0, 0, 0x80, 0x10];
        assert!(matches!(
            decode(&frame(&bytes)),
            Err(CodecError::TruncatedTrailer { min: 8, .. })
        ));
    }

    #[test]
    fn link_metadata_is_copied() {
        let f = frame(&[0x02, 1, 0, 0, 0, 3]);
        let pkt = decode(&f).unwrap();
        assert_eq!(pkt.link.rssi, -70);
        assert_eq!(pkt.link.snr, 20);
        assert_eq!(pkt.link.fei, -256);
        assert_eq!(pkt.link.received_at, f.received_at);
        assert_eq!(pkt.forwarded_at, None);
        assert!(pkt.payload.is_empty());
    }

    #[test]
    fn v1_ack_layout() {
        let ack = encode_ack(FormatVersion::V1, 22, -384).unwrap();
        assert_eq!(ack.header, V1_ACK_HEADER);
        assert_eq!(ack.body, vec![0x00, 0x80, 22, 0xFD]);

        let clamped = encode_ack(FormatVersion::V1, 200, i16::MAX).unwrap();
        assert_eq!(clamped.body[2], 63);
        assert_eq!(clamped.body[3], 127);
    }

    #[test]
    fn v2_ack_is_a_known_gap() {
        let err = encode_ack(FormatVersion::V2, 10, 0).unwrap_err();
        assert_eq!(err, CodecError::AckUnsupported(FormatVersion::V2));
        assert!(!err.is_undecodable());
    }
}
