//! Test utilities & fixtures shared by the integration tests.
#![allow(dead_code)]

use chrono::{DateTime, Utc};
use rfgw::codec::varint::encode_varint;
use rfgw::codec::{self, DecodedPacket, TX_ONLY_NODE_ID};
use rfgw::config::Config;
use rfgw::radio::RadioFrame;

/// V1 node-to-gateway frame: node id as varint, then payload.
pub fn v1_bytes(node_id: u32, format: u8, payload: &[u8], ack_requested: bool) -> Vec<u8> {
    let src = TX_ONLY_NODE_ID | if ack_requested { 0x80 } else { 0 };
    let mut bytes = vec![0x00, src, format & 0x7F];
    bytes.extend(encode_varint(node_id));
    bytes.extend_from_slice(payload);
    bytes
}

/// V2 frame with header flags as given; low bits carry the 0b10 discriminator.
pub fn v2_bytes(node_id: u32, format: u8, payload: &[u8], ack_requested: bool) -> Vec<u8> {
    let header = 0x02 | if ack_requested { 0x10 } else { 0 };
    let mut bytes = vec![header];
    bytes.extend(node_id.to_le_bytes());
    bytes.push(format & 0x7F);
    bytes.extend_from_slice(payload);
    bytes
}

pub fn frame_at(bytes: Vec<u8>, snr: u8, at: DateTime<Utc>) -> RadioFrame {
    RadioFrame::new(bytes, -75, snr, -256, at)
}

pub fn frame(bytes: Vec<u8>, snr: u8) -> RadioFrame {
    frame_at(bytes, snr, Utc::now())
}

pub fn packet(node_id: u32, payload: &[u8], at: DateTime<Utc>) -> DecodedPacket {
    codec::decode(&frame_at(v2_bytes(node_id, 5, payload, true), 20, at)).expect("valid frame")
}

pub fn config(name: &str) -> Config {
    let mut cfg = Config::default();
    cfg.gateway.name = name.to_string();
    cfg
}
