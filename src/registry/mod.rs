//! # Ack Arbitration Registry
//!
//! Several gateways may overhear the same node, but only one of them should
//! transmit the radio ack: duplicate acks collide at the node. Every gateway
//! runs the same margin-weighted soft election per node id and converges by
//! exchanging announcements on a shared bus topic.
//!
//! - [`NodeRegistry`] holds the per-node state and the [`GatewayTable`]. It is
//!   a single owned table; callers reach it only through its methods.
//! - [`AckCoordinator`] wraps the registry with the bus side: it decides
//!   whether to ack, publishes observations, and ingests peer announcements.
//!
//! ## Announcement format
//!
//! ```json
//! {"gw":"rfgw-kitchen","node":4097,"margin":27}
//! {"gw":"rfgw-kitchen","node":4097,"ack":true}
//! ```

pub mod gateways;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{BusClient, Qos};
use crate::config::RegistryConfig;
pub use gateways::{GatewayId, GatewayTable, OVERFLOW_SLOT, SELF_ID};

/// Announcements at or above this size are ignored.
pub const MAX_ANNOUNCEMENT_BYTES: usize = 128;

/// Margin given to a freshly created entry; any real observation beats it.
const UNKNOWN_MARGIN: i16 = -100;

/// Which gateway currently answers for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Responsible {
    Unknown,
    Gateway(GatewayId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEntry {
    pub responsible: Responsible,
    pub margin: i16,
    pub at: Instant,
}

impl NodeEntry {
    fn new(now: Instant) -> Self {
        Self {
            responsible: Responsible::Unknown,
            margin: UNKNOWN_MARGIN,
            at: now,
        }
    }
}

/// When the local gateway sends the ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Ack only while no gateway has been recorded for the node.
    FirstContact,
    /// Ack while no gateway, or this gateway, is recorded for the node.
    #[default]
    ResponsibleOrUnknown,
}

/// Per-node soft state for ack arbitration.
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: HashMap<u32, NodeEntry>,
    gateways: GatewayTable,
    stale_after: Duration,
    policy: AckPolicy,
}

impl NodeRegistry {
    pub fn new(self_name: &str, config: &RegistryConfig) -> Self {
        Self {
            nodes: HashMap::new(),
            gateways: GatewayTable::new(self_name, config.max_gateways),
            stale_after: Duration::from_millis(config.stale_after_ms),
            policy: config.ack_policy,
        }
    }

    pub fn set_self(&mut self, self_name: &str) {
        self.gateways.set_self(self_name);
    }

    pub fn self_name(&self) -> &str {
        self.gateways.self_name()
    }

    /// Whether the local gateway should ack `node_id`. Creates the entry lazily.
    pub fn should_ack(&mut self, node_id: u32, now: Instant) -> bool {
        let entry = self.nodes.entry(node_id).or_insert_with(|| NodeEntry::new(now));
        match (self.policy, entry.responsible) {
            (_, Responsible::Unknown) => true,
            (AckPolicy::ResponsibleOrUnknown, Responsible::Gateway(SELF_ID)) => true,
            _ => false,
        }
    }

    /// Record that `gateway` heard `node_id` with `margin`.
    ///
    /// Takes over the entry when nobody is responsible yet, when the margin is
    /// better, or when the stored observation is older than the stale window.
    /// Returns true when the entry changed.
    pub fn record_observation(
        &mut self,
        node_id: u32,
        gateway: &str,
        margin: i16,
        now: Instant,
    ) -> bool {
        let gw = self.gateways.resolve(gateway);
        let entry = self.nodes.entry(node_id).or_insert_with(|| NodeEntry::new(now));
        let stale = now.saturating_duration_since(entry.at) > self.stale_after;
        if entry.responsible == Responsible::Unknown || margin > entry.margin || stale {
            *entry = NodeEntry {
                responsible: Responsible::Gateway(gw),
                margin,
                at: now,
            };
            debug!(
                "Node {:08x} reachable via GW {} ({}) with {}dB",
                node_id, gw, gateway, margin
            );
            true
        } else {
            false
        }
    }

    pub fn entry(&self, node_id: u32) -> Option<&NodeEntry> {
        self.nodes.get(&node_id)
    }

    /// Name of the gateway recorded as responsible for `node_id`.
    pub fn responsible_name(&self, node_id: u32) -> Option<&str> {
        match self.nodes.get(&node_id)?.responsible {
            Responsible::Gateway(id) => self.gateways.name(id),
            Responsible::Unknown => None,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn gateway_count(&self) -> usize {
        self.gateways.len()
    }
}

/// Wire form of a gateway announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(default)]
    pub gw: String,
    #[serde(default)]
    pub node: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<bool>,
}

impl Announcement {
    pub fn observation(gw: &str, node: u32, margin: i16) -> Self {
        Self {
            gw: gw.to_string(),
            node,
            margin: Some(margin as i32),
            ack: None,
        }
    }

    pub fn ack_claim(gw: &str, node: u32) -> Self {
        Self {
            gw: gw.to_string(),
            node,
            margin: None,
            ack: Some(true),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.ack.unwrap_or(false)
    }
}

#[derive(Debug, Error)]
pub enum AnnouncementError {
    #[error("announcement too large: {0} bytes")]
    TooLarge(usize),
    #[error("invalid announcement json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad data in announcement: gw={gw:?} node={node:x}")]
    BadData { gw: String, node: u32 },
}

/// What the coordinator did with a local reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckDecision {
    pub ack: bool,
    /// Number of announcements handed to the bus.
    pub announced: usize,
}

/// Bus-facing side of the registry.
#[derive(Debug)]
pub struct AckCoordinator {
    registry: NodeRegistry,
    self_name: String,
    topic: String,
}

impl AckCoordinator {
    pub fn new(self_name: &str, topic: &str, config: &RegistryConfig) -> Self {
        Self {
            registry: NodeRegistry::new(self_name, config),
            self_name: self_name.to_string(),
            topic: topic.to_string(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Subscribe to announcements after (re)connecting.
    pub fn on_connected(&mut self, bus: &mut impl BusClient) {
        self.registry.set_self(&self.self_name);
        match bus.subscribe(&self.topic, Qos::AtLeastOnce) {
            Ok(()) => debug!("Subscribed to {} for node registry", self.topic),
            Err(e) => warn!("Subscribe to {} failed: {}", self.topic, e),
        }
    }

    /// Decide whether to ack a frame from `node_id` heard locally with `margin`,
    /// then announce the observation (and the ack claim, if any).
    pub fn should_ack(
        &mut self,
        node_id: u32,
        margin: i16,
        bus: &mut impl BusClient,
        now: Instant,
    ) -> AckDecision {
        if node_id == 0 {
            // never ack another gateway's packet
            return AckDecision {
                ack: false,
                announced: 0,
            };
        }
        let ack = self.registry.should_ack(node_id, now);
        self.registry
            .record_observation(node_id, &self.self_name, margin, now);

        let mut announced = 0;
        let mut messages = vec![Announcement::observation(&self.self_name, node_id, margin)];
        if ack {
            messages.push(Announcement::ack_claim(&self.self_name, node_id));
        }
        for msg in messages {
            if self.announce(&msg, bus) {
                announced += 1;
            }
        }
        AckDecision { ack, announced }
    }

    fn announce(&self, msg: &Announcement, bus: &mut impl BusClient) -> bool {
        let payload = match serde_json::to_vec(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!("Cannot encode announcement: {}", e);
                return false;
            }
        };
        match bus.publish(&self.topic, Qos::AtLeastOnce, &payload, false) {
            Ok(id) => {
                trace!(
                    "Pub to {} -> {}: {}",
                    self.topic,
                    id,
                    String::from_utf8_lossy(&payload)
                );
                true
            }
            Err(e) => {
                debug!("Announcement for {:08x} not published: {}", msg.node, e);
                false
            }
        }
    }

    /// Ingest an announcement received on the registry topic.
    ///
    /// Ack claims are accepted but never update margin state.
    pub fn handle_announcement(
        &mut self,
        payload: &[u8],
        now: Instant,
    ) -> Result<Announcement, AnnouncementError> {
        if payload.len() >= MAX_ANNOUNCEMENT_BYTES {
            return Err(AnnouncementError::TooLarge(payload.len()));
        }
        let msg: Announcement = serde_json::from_slice(payload)?;
        if msg.gw.is_empty() || msg.node == 0 {
            return Err(AnnouncementError::BadData {
                gw: msg.gw,
                node: msg.node,
            });
        }
        if !msg.is_ack() {
            let margin = msg
                .margin
                .unwrap_or(0)
                .clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            self.registry
                .record_observation(msg.node, &msg.gw, margin, now);
        }
        Ok(msg)
    }
}
