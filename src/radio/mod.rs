//! # Radio Driver Seam
//!
//! The transceiver itself (modulation, SPI timing, RSSI/FEI measurement) lives
//! outside this crate. The gateway only needs a non-blocking receive and a send
//! that reports success, captured by [`RadioDriver`].
//!
//! [`ScriptedRadio`] feeds frames from a text script and records every ack the
//! gateway transmits; it backs the `replay` command and the tests.
//!
//! Script format, one frame per line:
//!
//! ```text
//! # hex bytes, then optional rssi snr fei
//! 003d05ac0248656c6c6f -72 18 -256
//! 521001000005010203
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Largest frame the transceiver FIFO can deliver.
pub const MAX_FRAME_LEN: usize = 256;

/// One frame as captured by the driver. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioFrame {
    pub bytes: Vec<u8>,
    /// Received signal strength, dBm.
    pub rssi: i16,
    /// Margin above the noise floor, dB.
    pub snr: u8,
    /// Frequency error estimate, Hz.
    pub fei: i16,
    pub received_at: DateTime<Utc>,
}

impl RadioFrame {
    pub fn new(bytes: Vec<u8>, rssi: i16, snr: u8, fei: i16, received_at: DateTime<Utc>) -> Self {
        Self {
            bytes,
            rssi,
            snr,
            fei,
            received_at,
        }
    }
}

/// Non-blocking access to the transceiver.
pub trait RadioDriver {
    /// Next received frame, if one is waiting.
    fn receive(&mut self) -> Option<RadioFrame>;

    /// Transmit `body` preceded by the driver-level `header` byte.
    fn send(&mut self, header: u8, body: &[u8]) -> bool;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// Replays a fixed list of frames and records transmissions.
#[derive(Debug, Default)]
pub struct ScriptedRadio {
    frames: VecDeque<RadioFrame>,
    sent: Vec<(u8, Vec<u8>)>,
    fail_sends: bool,
}

impl ScriptedRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a frame script (see module docs). Every frame is stamped with `now`.
    pub fn from_script(script: &str, now: DateTime<Utc>) -> Result<Self, ScriptError> {
        let mut radio = Self::new();
        for (idx, raw) in script.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let frame = parse_line(line, now).map_err(|reason| ScriptError::Parse {
                line: idx + 1,
                reason,
            })?;
            radio.push(frame);
        }
        Ok(radio)
    }

    pub fn push(&mut self, frame: RadioFrame) {
        self.frames.push_back(frame);
    }

    /// Make subsequent sends report failure.
    pub fn set_fail_sends(&mut self, fail: bool) {
        self.fail_sends = fail;
    }

    pub fn pending(&self) -> usize {
        self.frames.len()
    }

    pub fn sent(&self) -> &[(u8, Vec<u8>)] {
        &self.sent
    }
}

impl RadioDriver for ScriptedRadio {
    fn receive(&mut self) -> Option<RadioFrame> {
        self.frames.pop_front()
    }

    fn send(&mut self, header: u8, body: &[u8]) -> bool {
        if self.fail_sends {
            return false;
        }
        self.sent.push((header, body.to_vec()));
        true
    }
}

fn parse_line(line: &str, now: DateTime<Utc>) -> Result<RadioFrame, String> {
    let mut fields = line.split_whitespace();
    let hex = fields.next().ok_or("missing frame bytes")?;
    let bytes = parse_hex(hex)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(format!("frame of {} bytes exceeds {}", bytes.len(), MAX_FRAME_LEN));
    }
    let rssi = next_num(&mut fields, "rssi")?.unwrap_or(-80);
    let snr = next_num(&mut fields, "snr")?.unwrap_or(15);
    let fei = next_num(&mut fields, "fei")?.unwrap_or(0);
    Ok(RadioFrame::new(bytes, rssi, snr, fei, now))
}

fn next_num<'a, T: std::str::FromStr>(
    fields: &mut impl Iterator<Item = &'a str>,
    name: &str,
) -> Result<Option<T>, String> {
    match fields.next() {
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| format!("invalid {name} '{s}'")),
        None => Ok(None),
    }
}

/// Parse a contiguous hex string such as `003dac02`.
pub fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{s}'"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex in '{s}'"))
        })
        .collect()
}
