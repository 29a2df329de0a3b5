//! # Message Bus Seam
//!
//! The gateway talks to an MQTT-style publish/subscribe bus through
//! [`BusClient`]. Client callbacks (connect, message, publish-confirmed) are
//! modelled as [`BusEvent`]s delivered over a channel and processed inside the
//! gateway loop, so their ordering relative to radio processing is explicit.
//!
//! [`LoopbackBus`] is an in-memory broker used by the `replay` command and by
//! tests: it hands out confirmation ids, records publishes, and can confirm
//! publishes and echo messages to subscribers through the event channel.

use std::collections::HashSet;

use log::{debug, info};
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifier correlating a publish with its later confirmation.
pub type ConfirmationId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

impl Qos {
    pub fn level(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
        }
    }
}

/// Callback surface of the bus client, as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
    PublishConfirmed(ConfirmationId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus not connected")]
    NotConnected,
    #[error("bus client closed")]
    Closed,
}

/// Non-blocking bus operations used by the core.
pub trait BusClient {
    fn is_connected(&self) -> bool;

    /// Queue a publish. `retransmit` marks a resend of an earlier publish.
    fn publish(
        &mut self,
        topic: &str,
        qos: Qos,
        payload: &[u8],
        retransmit: bool,
    ) -> Result<ConfirmationId, BusError>;

    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), BusError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub id: ConfirmationId,
    pub topic: String,
    pub qos: Qos,
    pub payload: Vec<u8>,
    pub retransmit: bool,
}

impl Published {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("<binary>")
    }
}

/// In-memory broker with a single client.
pub struct LoopbackBus {
    events: Option<mpsc::UnboundedSender<BusEvent>>,
    connected: bool,
    next_id: ConfirmationId,
    subscriptions: HashSet<String>,
    published: Vec<Published>,
    auto_confirm: bool,
    echo: bool,
    log_publishes: bool,
}

impl LoopbackBus {
    /// A connected bus that neither confirms nor echoes on its own.
    pub fn new() -> Self {
        let mut next_id: ConfirmationId = rand::random();
        if next_id == 0 {
            next_id = 1;
        }
        Self {
            events: None,
            connected: true,
            next_id,
            subscriptions: HashSet::new(),
            published: Vec::new(),
            auto_confirm: false,
            echo: false,
            log_publishes: false,
        }
    }

    /// Deliver confirmations and echoes through `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<BusEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Confirm every QoS 1 publish immediately.
    pub fn auto_confirm(mut self, on: bool) -> Self {
        self.auto_confirm = on;
        self
    }

    /// Echo publishes back as messages on subscribed topics, like a broker would.
    pub fn echo(mut self, on: bool) -> Self {
        self.echo = on;
        self
    }

    /// Log each publish at info level (used by the replay command).
    pub fn log_publishes(mut self, on: bool) -> Self {
        self.log_publishes = on;
        self
    }

    pub fn set_connected(&mut self, connected: bool) {
        if self.connected == connected {
            return;
        }
        self.connected = connected;
        self.emit(if connected {
            BusEvent::Connected
        } else {
            BusEvent::Disconnected
        });
    }

    pub fn published(&self) -> &[Published] {
        &self.published
    }

    pub fn published_on(&self, topic: &str) -> Vec<&Published> {
        self.published.iter().filter(|p| p.topic == topic).collect()
    }

    pub fn take_published(&mut self) -> Vec<Published> {
        std::mem::take(&mut self.published)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains(topic)
    }

    /// Inject a message as if another client published it.
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        if self.subscriptions.contains(topic) {
            self.emit(BusEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
        }
    }

    fn emit(&self, event: BusEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn allocate_id(&mut self) -> ConfirmationId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        id
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusClient for LoopbackBus {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(
        &mut self,
        topic: &str,
        qos: Qos,
        payload: &[u8],
        retransmit: bool,
    ) -> Result<ConfirmationId, BusError> {
        if !self.connected {
            return Err(BusError::NotConnected);
        }
        let id = self.allocate_id();
        if self.log_publishes {
            info!(
                "Pub {} id={} qos={}{}: {}",
                topic,
                id,
                qos.level(),
                if retransmit { " (dup)" } else { "" },
                String::from_utf8_lossy(payload)
            );
        } else {
            debug!("Pub {} id={} len={}", topic, id, payload.len());
        }
        self.published.push(Published {
            id,
            topic: topic.to_string(),
            qos,
            payload: payload.to_vec(),
            retransmit,
        });
        if self.echo {
            self.inject(topic, payload);
        }
        if self.auto_confirm && qos == Qos::AtLeastOnce {
            self.emit(BusEvent::PublishConfirmed(id));
        }
        Ok(id)
    }

    fn subscribe(&mut self, topic: &str, _qos: Qos) -> Result<(), BusError> {
        if !self.connected {
            return Err(BusError::NotConnected);
        }
        self.subscriptions.insert(topic.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_nonzero_and_distinct() {
        let mut bus = LoopbackBus::new();
        bus.next_id = u16::MAX;
        let a = bus.publish("t", Qos::AtLeastOnce, b"a", false).unwrap();
        let b = bus.publish("t", Qos::AtLeastOnce, b"b", false).unwrap();
        assert_eq!(a, u16::MAX);
        assert_eq!(b, 1);
    }

    #[test]
    fn disconnected_publish_fails() {
        let mut bus = LoopbackBus::new();
        bus.set_connected(false);
        assert_eq!(
            bus.publish("t", Qos::AtLeastOnce, b"x", false),
            Err(BusError::NotConnected)
        );
        assert!(bus.published().is_empty());
    }

    #[test]
    fn confirm_and_echo_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut bus = LoopbackBus::new().with_events(tx).auto_confirm(true).echo(true);
        bus.subscribe("rfgw/reports", Qos::AtLeastOnce).unwrap();
        let id = bus
            .publish("rfgw/reports", Qos::AtLeastOnce, b"{}", false)
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            BusEvent::Message {
                topic: "rfgw/reports".into(),
                payload: b"{}".to_vec()
            }
        );
        assert_eq!(rx.try_recv().unwrap(), BusEvent::PublishConfirmed(id));
        // not subscribed: confirmation only
        let id2 = bus.publish("gw/rx", Qos::AtLeastOnce, b"{}", false).unwrap();
        assert_eq!(rx.try_recv().unwrap(), BusEvent::PublishConfirmed(id2));
        assert!(rx.try_recv().is_err());
    }
}
