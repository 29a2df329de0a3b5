//! JSON record published for every forwarded packet.

use base64::Engine;
use chrono::SecondsFormat;
use serde::Serialize;

use crate::codec::varint::{decode_varints, MAX_PACKED_VALUES};
use crate::codec::DecodedPacket;

#[derive(Debug, Serialize)]
pub struct ForwardRecord<'a> {
    /// Receive time, RFC 3339 UTC with milliseconds.
    pub at: String,
    pub gw: &'a str,
    /// Node id as lowercase hex.
    pub hwid: String,
    pub rssi: i16,
    pub snr: u8,
    pub fei: i16,
    #[serde(rename = "type")]
    pub format: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_margin: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_fei: Option<i16>,
    /// Payload, standard base64.
    pub payload: String,
    /// Payload read as packed varints, when it parses as such.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u32>>,
}

impl<'a> ForwardRecord<'a> {
    pub fn new(gw: &'a str, pkt: &DecodedPacket) -> Self {
        let data = if pkt.payload.is_empty() {
            None
        } else {
            decode_varints(&pkt.payload, MAX_PACKED_VALUES)
        };
        Self {
            at: pkt
                .link
                .received_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            gw,
            hwid: format!("{:x}", pkt.node_id),
            rssi: pkt.link.rssi,
            snr: pkt.link.snr,
            fei: pkt.link.fei,
            format: pkt.format,
            remote_margin: pkt.trailer.map(|t| t.margin),
            remote_fei: pkt.trailer.map(|t| t.fei),
            payload: base64::engine::general_purpose::STANDARD.encode(&pkt.payload),
            data,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FormatVersion, LinkMeta, Trailer};
    use chrono::{TimeZone, Utc};

    fn packet(payload: Vec<u8>, trailer: Option<Trailer>) -> DecodedPacket {
        let at = Utc.with_ymd_and_hms(2019, 6, 1, 12, 30, 5).unwrap()
            + chrono::Duration::milliseconds(42);
        DecodedPacket {
            version: FormatVersion::V2,
            is_ack: false,
            from_gateway: false,
            ack_requested: true,
            special: false,
            format: 7,
            node_id: 0x1001,
            payload,
            trailer,
            link: LinkMeta {
                rssi: -71,
                snr: 24,
                fei: -512,
                received_at: at,
            },
            forwarded_at: None,
        }
    }

    #[test]
    fn record_with_trailer_and_packed_data() {
        let pkt = packet(vec![1, 0xAC, 0x02], Some(Trailer { margin: 12, fei: -128 }));
        let json = String::from_utf8(ForwardRecord::new("gw-a", &pkt).to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"at":"2019-06-01T12:30:05.042Z","gw":"gw-a","hwid":"1001","rssi":-71,"snr":24,"fei":-512,"type":7,"remote_margin":12,"remote_fei":-128,"payload":"AawC","data":[1,300]}"#
        );
    }

    #[test]
    fn record_omits_optional_fields() {
        // trailing continuation byte: not a packed varint array
        let pkt = packet(vec![0x81], None);
        let value: serde_json::Value =
            serde_json::from_slice(&ForwardRecord::new("gw-a", &pkt).to_json().unwrap()).unwrap();
        assert!(value.get("remote_margin").is_none());
        assert!(value.get("remote_fei").is_none());
        assert!(value.get("data").is_none());
        assert_eq!(value["payload"], "gQ==");

        let empty = packet(Vec::new(), None);
        let value: serde_json::Value =
            serde_json::from_slice(&ForwardRecord::new("gw-a", &empty).to_json().unwrap()).unwrap();
        assert_eq!(value["payload"], "");
        assert!(value.get("data").is_none());
    }
}
