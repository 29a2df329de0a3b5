//! # Reliable Delivery Buffer
//!
//! Decoded packets stay here from the moment they are handed to the bus until
//! the bus confirms them. Two sets share one capacity:
//!
//! - **in flight**: published, awaiting confirmation, keyed by the bus
//!   [`ConfirmationId`]; resent when unconfirmed for `retransmit_after`
//! - **unsent**: not yet accepted by the bus (disconnected, or the publish
//!   failed), keyed by a local sequence number; flushed once connected
//!
//! The maintenance pass ([`DeliveryBuffer::tick`]) drops packets older than
//! `max_age` and then evicts the oldest receptions until the total is back at
//! `max_pending`. Delivery is at-least-once per packet; there is no ordering
//! across packets.

pub mod record;

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use thiserror::Error;

use crate::bus::{BusClient, ConfirmationId, Qos};
use crate::codec::DecodedPacket;
use crate::config::DeliveryConfig;
use crate::metrics;
use record::ForwardRecord;

/// Key of a packet the bus has not accepted yet.
pub type LocalId = u64;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("forward record too large: {size} bytes (max {max})")]
    EncodingOverflow { size: usize, max: usize },
    #[error("cannot serialize forward record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Published; awaiting confirmation under this id.
    Published(ConfirmationId),
    /// Held locally until the bus accepts it.
    Queued(LocalId),
}

#[derive(Debug)]
pub struct PendingDelivery {
    pub packet: DecodedPacket,
    /// Number of publishes so far, retransmissions included.
    pub attempts: u32,
    seq: u64,
    oversize: bool,
}

impl PendingDelivery {
    fn last_sent(&self) -> Option<Instant> {
        self.packet.forwarded_at
    }
}

/// Outcome of one maintenance pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub flushed: usize,
    pub retransmitted: usize,
    pub expired: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    InFlight(ConfirmationId),
    Unsent(LocalId),
}

pub struct DeliveryBuffer {
    gateway: String,
    topic: String,
    in_flight: HashMap<ConfirmationId, PendingDelivery>,
    unsent: BTreeMap<LocalId, PendingDelivery>,
    next_local: LocalId,
    next_seq: u64,
    retransmit_after: Duration,
    max_pending: usize,
    max_age: chrono::Duration,
    max_message_bytes: usize,
}

impl DeliveryBuffer {
    pub fn new(gateway: &str, topic: &str, config: &DeliveryConfig) -> Self {
        Self {
            gateway: gateway.to_string(),
            topic: topic.to_string(),
            in_flight: HashMap::new(),
            unsent: BTreeMap::new(),
            next_local: 1,
            next_seq: 0,
            retransmit_after: Duration::from_millis(config.retransmit_after_ms),
            max_pending: config.max_pending,
            max_age: chrono::Duration::seconds(config.max_age_secs.min(u32::MAX as u64) as i64),
            max_message_bytes: config.max_message_bytes,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Packets held, sent or not.
    pub fn len(&self) -> usize {
        self.in_flight.len() + self.unsent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn unsent(&self) -> usize {
        self.unsent.len()
    }

    pub fn is_in_flight(&self, id: ConfirmationId) -> bool {
        self.in_flight.contains_key(&id)
    }

    /// Serialize the forward record for `packet`, enforcing the size budget.
    pub fn encode(&self, packet: &DecodedPacket) -> Result<Vec<u8>, DeliveryError> {
        let bytes = ForwardRecord::new(&self.gateway, packet).to_json()?;
        if bytes.len() > self.max_message_bytes {
            return Err(DeliveryError::EncodingOverflow {
                size: bytes.len(),
                max: self.max_message_bytes,
            });
        }
        Ok(bytes)
    }

    /// Hand a packet to the bus, or hold it until the bus is reachable.
    ///
    /// On `EncodingOverflow` the packet is kept but never published; it leaves
    /// the buffer through age or capacity eviction.
    pub fn submit(
        &mut self,
        packet: DecodedPacket,
        bus: &mut impl BusClient,
        now: Instant,
    ) -> Result<SubmitOutcome, DeliveryError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let mut entry = PendingDelivery {
            packet,
            attempts: 0,
            seq,
            oversize: false,
        };
        let payload = match self.encode(&entry.packet) {
            Ok(p) => p,
            Err(e) => {
                let node = entry.packet.node_id;
                if matches!(e, DeliveryError::EncodingOverflow { .. }) {
                    metrics::inc_encoding_overflow();
                    entry.oversize = true;
                    self.enqueue(entry);
                }
                warn!("Packet from {:x} not published: {}", node, e);
                return Err(e);
            }
        };
        if bus.is_connected() {
            match self.publish(entry, &payload, bus, now, false) {
                Ok(id) => return Ok(SubmitOutcome::Published(id)),
                Err(back) => entry = back,
            }
        }
        Ok(SubmitOutcome::Queued(self.enqueue(entry)))
    }

    /// Release the packet confirmed under `id`. Unknown ids are ignored.
    pub fn on_confirmed(&mut self, id: ConfirmationId) -> bool {
        match self.in_flight.remove(&id) {
            Some(entry) => {
                metrics::inc_packets_confirmed();
                debug!(
                    "Confirmed id={} node={:x} after {} attempt(s)",
                    id, entry.packet.node_id, entry.attempts
                );
                true
            }
            None => {
                debug!("Confirmation for unknown id={}", id);
                false
            }
        }
    }

    /// Publish every queued packet while the bus accepts them.
    pub fn flush(&mut self, bus: &mut impl BusClient, now: Instant) -> usize {
        if !bus.is_connected() {
            return 0;
        }
        let keys: Vec<LocalId> = self
            .unsent
            .iter()
            .filter(|(_, e)| !e.oversize)
            .map(|(k, _)| *k)
            .collect();
        let mut flushed = 0;
        for key in keys {
            let Some(entry) = self.unsent.remove(&key) else {
                continue;
            };
            let payload = match self.encode(&entry.packet) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Queued packet {} cannot be encoded: {}", key, e);
                    let mut entry = entry;
                    entry.oversize = true;
                    self.unsent.insert(key, entry);
                    continue;
                }
            };
            // entries sent before keep the duplicate marking
            let retransmit = entry.attempts > 0;
            match self.publish(entry, &payload, bus, now, retransmit) {
                Ok(_) => flushed += 1,
                Err(back) => {
                    self.unsent.insert(key, back);
                    break;
                }
            }
        }
        if flushed > 0 {
            info!("Flushed {} queued packet(s)", flushed);
        }
        flushed
    }

    /// Periodic maintenance: flush, retransmit, expire, enforce capacity.
    pub fn tick(&mut self, bus: &mut impl BusClient, now: Instant, wall: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        if bus.is_connected() {
            report.flushed = self.flush(bus, now);
            report.retransmitted = self.retransmit_due(bus, now);
        }
        report.expired = self.expire(wall);
        report.evicted = self.enforce_capacity();
        report
    }

    fn retransmit_due(&mut self, bus: &mut impl BusClient, now: Instant) -> usize {
        let due: Vec<ConfirmationId> = self
            .in_flight
            .iter()
            .filter(|(_, e)| {
                e.last_sent()
                    .map_or(true, |t| now.saturating_duration_since(t) > self.retransmit_after)
            })
            .map(|(id, _)| *id)
            .collect();
        let mut count = 0;
        for old_id in due {
            let Some(entry) = self.in_flight.remove(&old_id) else {
                continue;
            };
            let payload = match self.encode(&entry.packet) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Cannot re-encode id={}: {}", old_id, e);
                    let mut entry = entry;
                    entry.oversize = true;
                    self.enqueue(entry);
                    continue;
                }
            };
            debug!("Rexmit {}", old_id);
            match self.publish(entry, &payload, bus, now, true) {
                Ok(_) => {
                    metrics::inc_packets_retransmitted();
                    count += 1;
                }
                Err(back) => {
                    self.enqueue(back);
                }
            }
        }
        count
    }

    fn publish(
        &mut self,
        mut entry: PendingDelivery,
        payload: &[u8],
        bus: &mut impl BusClient,
        now: Instant,
        retransmit: bool,
    ) -> Result<ConfirmationId, PendingDelivery> {
        match bus.publish(&self.topic, Qos::AtLeastOnce, payload, retransmit) {
            Ok(id) => {
                entry.attempts += 1;
                entry.packet.forwarded_at = Some(now);
                metrics::inc_packets_published();
                info!(
                    "Packet from {:x} at {} {}sent, id={} len={}",
                    entry.packet.node_id,
                    entry.packet.link.received_at.timestamp(),
                    if retransmit { "re" } else { "" },
                    id,
                    payload.len()
                );
                if let Some(displaced) = self.in_flight.insert(id, entry) {
                    // the bus reused an id we still track; keep the older packet too
                    warn!("Confirmation id {} reused while pending, requeueing", id);
                    self.enqueue(displaced);
                }
                Ok(id)
            }
            Err(e) => {
                debug!("Publish failed ({}), keeping packet queued", e);
                Err(entry)
            }
        }
    }

    fn enqueue(&mut self, entry: PendingDelivery) -> LocalId {
        let id = self.next_local;
        self.next_local += 1;
        self.unsent.insert(id, entry);
        id
    }

    fn expire(&mut self, wall: DateTime<Utc>) -> usize {
        let max_age = self.max_age;
        let is_stale = |e: &PendingDelivery| wall - e.packet.link.received_at > max_age;
        let before = self.len();
        self.in_flight.retain(|id, e| {
            let stale = is_stale(e);
            if stale {
                warn!("Dropping stale packet id={} from {:x}", id, e.packet.node_id);
            }
            !stale
        });
        self.unsent.retain(|id, e| {
            let stale = is_stale(e);
            if stale {
                warn!("Dropping stale queued packet {} from {:x}", id, e.packet.node_id);
            }
            !stale
        });
        let dropped = before - self.len();
        metrics::add_packets_evicted(dropped as u64);
        dropped
    }

    fn enforce_capacity(&mut self) -> usize {
        let excess = self.len().saturating_sub(self.max_pending);
        if excess == 0 {
            return 0;
        }
        warn!("Delivery buffer over capacity: dropping {} packet(s)", excess);
        let mut slots: Vec<(DateTime<Utc>, u64, Slot)> = self
            .in_flight
            .iter()
            .map(|(id, e)| (e.packet.link.received_at, e.seq, Slot::InFlight(*id)))
            .chain(
                self.unsent
                    .iter()
                    .map(|(id, e)| (e.packet.link.received_at, e.seq, Slot::Unsent(*id))),
            )
            .collect();
        slots.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        for (_, _, slot) in slots.into_iter().take(excess) {
            let removed = match slot {
                Slot::InFlight(id) => self.in_flight.remove(&id),
                Slot::Unsent(id) => self.unsent.remove(&id),
            };
            if let Some(e) = removed {
                debug!(
                    "Evicted packet from {:x} received {}",
                    e.packet.node_id, e.packet.link.received_at
                );
            }
        }
        metrics::add_packets_evicted(excess as u64);
        excess
    }
}
