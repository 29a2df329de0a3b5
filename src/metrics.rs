//! Process-wide gateway counters.
//!
//! Plain relaxed atomics; the loop logs a [`snapshot`] periodically.
use std::sync::atomic::{AtomicU64, Ordering};

static FRAMES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static FRAMES_UNDECODABLE: AtomicU64 = AtomicU64::new(0);
static ACKS_SENT: AtomicU64 = AtomicU64::new(0);
static ACKS_FAILED: AtomicU64 = AtomicU64::new(0);
static ANNOUNCEMENTS_REJECTED: AtomicU64 = AtomicU64::new(0);
static PACKETS_PUBLISHED: AtomicU64 = AtomicU64::new(0);
static PACKETS_CONFIRMED: AtomicU64 = AtomicU64::new(0);
static PACKETS_RETRANSMITTED: AtomicU64 = AtomicU64::new(0);
static PACKETS_EVICTED: AtomicU64 = AtomicU64::new(0);
static ENCODING_OVERFLOWS: AtomicU64 = AtomicU64::new(0);

pub fn inc_frames_received() {
    FRAMES_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_frames_undecodable() {
    FRAMES_UNDECODABLE.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_acks_sent() {
    ACKS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_acks_failed() {
    ACKS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_announcements_rejected() {
    ANNOUNCEMENTS_REJECTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_published() {
    PACKETS_PUBLISHED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_confirmed() {
    PACKETS_CONFIRMED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_retransmitted() {
    PACKETS_RETRANSMITTED.fetch_add(1, Ordering::Relaxed);
}
pub fn add_packets_evicted(n: u64) {
    if n > 0 {
        PACKETS_EVICTED.fetch_add(n, Ordering::Relaxed);
    }
}
pub fn inc_encoding_overflow() {
    ENCODING_OVERFLOWS.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub frames_received: u64,
    pub frames_undecodable: u64,
    pub acks_sent: u64,
    pub acks_failed: u64,
    pub announcements_rejected: u64,
    pub packets_published: u64,
    pub packets_confirmed: u64,
    pub packets_retransmitted: u64,
    pub packets_evicted: u64,
    pub encoding_overflows: u64,
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rx={} bad={} acks={}/{} pub={} conf={} rexmit={} evicted={} oversize={} ann_rej={}",
            self.frames_received,
            self.frames_undecodable,
            self.acks_sent,
            self.acks_failed,
            self.packets_published,
            self.packets_confirmed,
            self.packets_retransmitted,
            self.packets_evicted,
            self.encoding_overflows,
            self.announcements_rejected
        )
    }
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        frames_received: FRAMES_RECEIVED.load(Ordering::Relaxed),
        frames_undecodable: FRAMES_UNDECODABLE.load(Ordering::Relaxed),
        acks_sent: ACKS_SENT.load(Ordering::Relaxed),
        acks_failed: ACKS_FAILED.load(Ordering::Relaxed),
        announcements_rejected: ANNOUNCEMENTS_REJECTED.load(Ordering::Relaxed),
        packets_published: PACKETS_PUBLISHED.load(Ordering::Relaxed),
        packets_confirmed: PACKETS_CONFIRMED.load(Ordering::Relaxed),
        packets_retransmitted: PACKETS_RETRANSMITTED.load(Ordering::Relaxed),
        packets_evicted: PACKETS_EVICTED.load(Ordering::Relaxed),
        encoding_overflows: ENCODING_OVERFLOWS.load(Ordering::Relaxed),
    }
}
