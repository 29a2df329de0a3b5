//! # rfgw - FSK radio to message bus gateway
//!
//! rfgw receives packets from a low-power FSK sensor network, decodes both
//! generations of its compact wire format, acknowledges transmissions over
//! the air in coordination with other gateways in range, and forwards every
//! decoded packet to a publish/subscribe message bus with at-least-once
//! delivery.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rfgw::bus::LoopbackBus;
//! use rfgw::config::Config;
//! use rfgw::gateway::Gateway;
//! use rfgw::radio::ScriptedRadio;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
//!     let (_control_tx, control_rx) = tokio::sync::mpsc::unbounded_channel();
//!     let bus = LoopbackBus::new().with_events(events_tx).auto_confirm(true);
//!     let mut gateway = Gateway::new(config, ScriptedRadio::new(), bus);
//!     gateway.run(events_rx, control_rx).await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`codec`] - V1/V2 frame decoding, ack frame encoding, varints
//! - [`registry`] - multi-gateway ack arbitration
//! - [`delivery`] - reliable delivery buffer and the forward record
//! - [`gateway`] - the cooperative loop tying the pieces together
//! - [`radio`], [`bus`] - driver seams plus in-process implementations
//! - [`config`] - TOML configuration
//! - [`metrics`], [`logutil`] - counters and log formatting
//!
//! ## Architecture
//!
//! ```text
//! radio ──► codec ──► registry ──► radio (ack)
//!                        │
//!                        ▼
//!                     delivery ──► bus
//!                        ▲          │
//!                        └──────────┘ confirmations, announcements
//! ```

pub mod bus;
pub mod codec;
pub mod config;
pub mod delivery;
pub mod gateway;
pub mod logutil;
pub mod metrics;
pub mod radio;
pub mod registry;
