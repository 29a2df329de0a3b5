//! # Gateway Loop
//!
//! One cooperative task owns the radio driver, the bus client, the ack
//! coordinator and the delivery buffer. Each iteration:
//!
//! 1. drains pending bus events (confirmations, peer announcements, connection
//!    changes), so announcements land before the next ack decision;
//! 2. polls the radio: decode, arbitrate, ack, forward;
//! 3. on its own interval, runs the delivery maintenance pass.
//!
//! The ack path (decode, decide, encode, send) never waits on the bus:
//! announcements and forwards are non-blocking publishes, and retransmission
//! happens only in the maintenance pass.

use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::bus::{BusClient, BusEvent};
use crate::codec::{self, CodecError, DecodedPacket};
use crate::config::Config;
use crate::delivery::{DeliveryBuffer, SubmitOutcome, TickReport};
use crate::logutil::hex_preview;
use crate::metrics;
use crate::radio::RadioDriver;
use crate::registry::AckCoordinator;

/// Control messages for the running loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayControl {
    Shutdown,
}

/// What happened to one received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Undecodable(CodecError),
    Received {
        node_id: u32,
        /// The registry picked this gateway to ack.
        ack_claimed: bool,
        /// An ack frame actually went out.
        ack_sent: bool,
        /// `None` when the packet was not forwarded (node 0 or oversize).
        forwarded: Option<SubmitOutcome>,
    },
}

pub struct Gateway<R: RadioDriver, B: BusClient> {
    config: Config,
    radio: R,
    bus: B,
    coordinator: AckCoordinator,
    delivery: DeliveryBuffer,
}

impl<R: RadioDriver, B: BusClient> Gateway<R, B> {
    pub fn new(config: Config, radio: R, bus: B) -> Self {
        let coordinator = AckCoordinator::new(
            &config.gateway.name,
            &config.gateway.announce_topic,
            &config.registry,
        );
        let delivery = DeliveryBuffer::new(
            &config.gateway.name,
            &config.gateway.forward_topic(),
            &config.delivery,
        );
        Self {
            config,
            radio,
            bus,
            coordinator,
            delivery,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn coordinator(&self) -> &AckCoordinator {
        &self.coordinator
    }

    pub fn delivery(&self) -> &DeliveryBuffer {
        &self.delivery
    }

    /// Subscribe when the bus is already up; otherwise wait for `Connected`.
    pub fn start(&mut self, now: Instant) {
        let radio = &self.config.radio;
        info!(
            "Gateway {} radio node={} group={} freq={}kHz power={}dBm",
            self.config.gateway.name,
            radio.node_id,
            radio.group,
            radio.frequency_khz,
            radio.power_dbm
        );
        if self.bus.is_connected() {
            self.on_connected(now);
        }
    }

    fn on_connected(&mut self, now: Instant) {
        self.coordinator.on_connected(&mut self.bus);
        self.delivery.flush(&mut self.bus, now);
    }

    /// Take one frame from the radio, if any, and run it through the pipeline.
    pub fn poll_radio(&mut self, now: Instant) -> Option<FrameOutcome> {
        let frame = self.radio.receive()?;
        metrics::inc_frames_received();
        let pkt = match codec::decode(&frame) {
            Ok(pkt) => pkt,
            Err(e) => {
                metrics::inc_frames_undecodable();
                warn!("Cannot decode packet ({}): {}", e, hex_preview(&frame.bytes));
                return Some(FrameOutcome::Undecodable(e));
            }
        };

        let mut ack_claimed = false;
        let mut ack_sent = false;
        if !pkt.is_ack && !pkt.from_gateway {
            let decision =
                self.coordinator
                    .should_ack(pkt.node_id, pkt.link.snr as i16, &mut self.bus, now);
            ack_claimed = decision.ack;
            if ack_claimed {
                ack_sent = self.send_ack(&pkt);
            }
        }
        log_reception(&pkt, ack_sent);

        let node_id = pkt.node_id;
        let forwarded = if node_id != 0 {
            self.delivery.submit(pkt, &mut self.bus, now).ok()
        } else {
            None
        };
        Some(FrameOutcome::Received {
            node_id,
            ack_claimed,
            ack_sent,
            forwarded,
        })
    }

    fn send_ack(&mut self, pkt: &DecodedPacket) -> bool {
        match codec::encode_ack(pkt.version, pkt.link.snr, pkt.link.fei) {
            Ok(ack) => {
                if self.radio.send(ack.header, &ack.body) {
                    metrics::inc_acks_sent();
                    true
                } else {
                    metrics::inc_acks_failed();
                    warn!("Couldn't send ACK to {:08x}", pkt.node_id);
                    false
                }
            }
            Err(e) => {
                debug!("No ack for {:08x}: {}", pkt.node_id, e);
                false
            }
        }
    }

    pub fn handle_bus_event(&mut self, event: BusEvent, now: Instant) {
        match event {
            BusEvent::Connected => {
                info!("Connected to message bus");
                self.on_connected(now);
            }
            BusEvent::Disconnected => {
                warn!(
                    "Disconnected from message bus ({} packet(s) pending)",
                    self.delivery.len()
                );
            }
            BusEvent::Message { topic, payload } => {
                if topic == self.coordinator.topic() {
                    if let Err(e) = self.coordinator.handle_announcement(&payload, now) {
                        metrics::inc_announcements_rejected();
                        warn!("Bad data in {} message: {}", topic, e);
                    }
                } else {
                    debug!("Ignoring message on {}", topic);
                }
            }
            BusEvent::PublishConfirmed(id) => {
                self.delivery.on_confirmed(id);
            }
        }
    }

    pub fn maintain(&mut self, now: Instant) -> TickReport {
        self.maintain_at(now, Utc::now())
    }

    /// Maintenance pass with an explicit wall clock for age checks.
    pub fn maintain_at(&mut self, now: Instant, wall: DateTime<Utc>) -> TickReport {
        let report = self.delivery.tick(&mut self.bus, now, wall);
        if report != TickReport::default() {
            debug!("Delivery tick: {:?}, {} pending", report, self.delivery.len());
        }
        report
    }

    /// Drive the gateway until shutdown or until the bus event channel closes.
    pub async fn run(
        &mut self,
        mut events: mpsc::UnboundedReceiver<BusEvent>,
        mut control: mpsc::UnboundedReceiver<GatewayControl>,
    ) -> Result<()> {
        info!("Starting gateway loop");
        self.start(Instant::now());

        // zero periods make tokio::time::interval panic
        let poll_ms = self.config.gateway.radio_poll_ms.max(1);
        let tick_ms = self.config.delivery.tick_interval_ms.max(1);
        let mut radio_poll = tokio::time::interval(Duration::from_millis(poll_ms));
        radio_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut maintenance = tokio::time::interval(Duration::from_millis(tick_ms));
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let status_secs = self.config.gateway.status_interval_secs;
        let mut status = tokio::time::interval(Duration::from_secs(status_secs.max(1)));

        loop {
            tokio::select! {
                biased;
                ctrl = control.recv() => {
                    match ctrl {
                        Some(GatewayControl::Shutdown) | None => {
                            info!("Gateway loop shutting down ({} packet(s) pending)", self.delivery.len());
                            break;
                        }
                    }
                }
                ev = events.recv() => {
                    match ev {
                        Some(ev) => self.handle_bus_event(ev, Instant::now()),
                        None => {
                            warn!("Bus event channel closed, stopping gateway");
                            break;
                        }
                    }
                }
                _ = radio_poll.tick() => {
                    loop {
                        while let Ok(ev) = events.try_recv() {
                            self.handle_bus_event(ev, Instant::now());
                        }
                        if self.poll_radio(Instant::now()).is_none() {
                            break;
                        }
                    }
                }
                _ = maintenance.tick() => {
                    self.maintain(Instant::now());
                }
                _ = status.tick(), if status_secs > 0 => {
                    info!(
                        "Status: {} | nodes={} gateways={} pending={} (unsent {})",
                        metrics::snapshot(),
                        self.coordinator.registry().node_count(),
                        self.coordinator.registry().gateway_count(),
                        self.delivery.len(),
                        self.delivery.unsent()
                    );
                }
            }
        }
        Ok(())
    }
}

fn log_reception(pkt: &DecodedPacket, acked: bool) {
    let mut line = format!(
        "RX {:08x} {} [{}]{{{}}} {}dBm {}Hz",
        pkt.node_id,
        pkt.version,
        pkt.flag_summary(),
        pkt.format,
        pkt.link.rssi,
        pkt.link.fei
    );
    if let Some(t) = pkt.trailer {
        line.push_str(&format!(" {{{}dB {}Hz}}", t.margin, t.fei));
    }
    line.push_str(&format!(" {}: {}", pkt.payload.len(), hex_preview(&pkt.payload)));
    if acked {
        line.push_str(" --ACKED");
    }
    info!("{}", line);
}
