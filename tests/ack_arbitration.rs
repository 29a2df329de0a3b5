//! Ack arbitration between gateways that share the announcement topic.

use std::time::{Duration, Instant};

use rfgw::bus::{BusClient, LoopbackBus};
use rfgw::config::RegistryConfig;
use rfgw::registry::{AckCoordinator, AckPolicy, Announcement, AnnouncementError, Responsible};

const TOPIC: &str = "rfgw/reports";
const NODE: u32 = 0x1001;

fn coordinator(name: &str) -> (AckCoordinator, LoopbackBus) {
    let mut coord = AckCoordinator::new(name, TOPIC, &RegistryConfig::default());
    let mut bus = LoopbackBus::new();
    coord.on_connected(&mut bus);
    (coord, bus)
}

/// Hand everything `from` announced to `to`, as the broker would.
fn relay(from: &mut LoopbackBus, to: &mut AckCoordinator, now: Instant) -> usize {
    let msgs = from.take_published();
    for msg in &msgs {
        assert_eq!(msg.topic, TOPIC);
        to.handle_announcement(&msg.payload, now).unwrap();
    }
    msgs.len()
}

#[test]
fn first_observation_acks_and_announces() {
    let (mut a, mut bus) = coordinator("gw-a");
    assert!(bus.is_subscribed(TOPIC));
    let now = Instant::now();

    let decision = a.should_ack(NODE, 20, &mut bus, now);
    assert!(decision.ack);
    assert_eq!(decision.announced, 2);

    let published = bus.published();
    assert_eq!(published[0].payload_str(), r#"{"gw":"gw-a","node":4097,"margin":20}"#);
    assert_eq!(published[1].payload_str(), r#"{"gw":"gw-a","node":4097,"ack":true}"#);
    assert_eq!(a.registry().responsible_name(NODE), Some("gw-a"));
}

#[test]
fn node_zero_is_never_acked() {
    let (mut a, mut bus) = coordinator("gw-a");
    let decision = a.should_ack(0, 40, &mut bus, Instant::now());
    assert!(!decision.ack);
    assert_eq!(decision.announced, 0);
    assert!(bus.published().is_empty());
}

#[test]
fn two_gateways_converge_on_the_stronger_one() {
    let (mut a, mut bus_a) = coordinator("gw-a");
    let (mut b, mut bus_b) = coordinator("gw-b");
    let t0 = Instant::now();

    // A hears the node first and claims it
    assert!(a.should_ack(NODE, 20, &mut bus_a, t0).ack);
    relay(&mut bus_a, &mut b, t0);
    assert_eq!(b.registry().responsible_name(NODE), Some("gw-a"));

    // B hears the same transmission better: no ack this time, but it takes over
    let t1 = t0 + Duration::from_millis(5);
    let decision = b.should_ack(NODE, 35, &mut bus_b, t1);
    assert!(!decision.ack);
    assert_eq!(decision.announced, 1);
    assert_eq!(b.registry().responsible_name(NODE), Some("gw-b"));
    relay(&mut bus_b, &mut a, t1);
    assert_eq!(a.registry().responsible_name(NODE), Some("gw-b"));

    // next transmission: only B acks
    let t2 = t0 + Duration::from_millis(1000);
    assert!(!a.should_ack(NODE, 20, &mut bus_a, t2).ack);
    assert!(b.should_ack(NODE, 35, &mut bus_b, t2).ack);
    relay(&mut bus_a, &mut b, t2);
    relay(&mut bus_b, &mut a, t2);
    assert_eq!(a.registry().responsible_name(NODE), Some("gw-b"));
    assert_eq!(b.registry().responsible_name(NODE), Some("gw-b"));
}

#[test]
fn stale_entries_are_taken_over_by_weaker_gateways() {
    let (mut a, mut bus_a) = coordinator("gw-a");
    let t0 = Instant::now();
    a.handle_announcement(br#"{"gw":"gw-b","node":4097,"margin":35}"#, t0)
        .unwrap();
    assert!(!a.should_ack(NODE, 20, &mut bus_a, t0).ack);

    let later = t0 + Duration::from_millis(5001);
    a.should_ack(NODE, 20, &mut bus_a, later);
    let entry = a.registry().entry(NODE).unwrap();
    assert_ne!(entry.responsible, Responsible::Unknown);
    assert_eq!(a.registry().responsible_name(NODE), Some("gw-a"));
    assert_eq!(entry.margin, 20);
}

#[test]
fn first_contact_policy_stops_after_the_first_ack() {
    let config = RegistryConfig {
        ack_policy: AckPolicy::FirstContact,
        ..RegistryConfig::default()
    };
    let mut a = AckCoordinator::new("gw-a", TOPIC, &config);
    let mut bus = LoopbackBus::new();
    let now = Instant::now();
    assert!(a.should_ack(NODE, 20, &mut bus, now).ack);
    assert!(!a.should_ack(NODE, 20, &mut bus, now).ack);
}

#[test]
fn ack_claims_do_not_move_responsibility() {
    let (mut a, mut bus) = coordinator("gw-a");
    let now = Instant::now();
    a.should_ack(NODE, 20, &mut bus, now);
    let msg = a
        .handle_announcement(br#"{"gw":"gw-b","node":4097,"ack":true}"#, now)
        .unwrap();
    assert!(msg.is_ack());
    assert_eq!(a.registry().responsible_name(NODE), Some("gw-a"));
}

#[test]
fn bad_announcements_are_rejected() {
    let (mut a, _bus) = coordinator("gw-a");
    let now = Instant::now();
    assert!(matches!(
        a.handle_announcement(b"not json", now),
        Err(AnnouncementError::Json(_))
    ));
    assert!(matches!(
        a.handle_announcement(br#"{"node":4097,"margin":3}"#, now),
        Err(AnnouncementError::BadData { .. })
    ));
    assert!(matches!(
        a.handle_announcement(br#"{"gw":"gw-b","margin":3}"#, now),
        Err(AnnouncementError::BadData { .. })
    ));
    let big = vec![b' '; 200];
    assert!(matches!(
        a.handle_announcement(&big, now),
        Err(AnnouncementError::TooLarge(200))
    ));
    assert_eq!(a.registry().node_count(), 0);
}

#[test]
fn announcement_round_trips_through_json() {
    let obs = Announcement::observation("gw-a", NODE, 22);
    let json = serde_json::to_string(&obs).unwrap();
    assert_eq!(json, r#"{"gw":"gw-a","node":4097,"margin":22}"#);
    let back: Announcement = serde_json::from_str(&json).unwrap();
    assert_eq!(back, obs);
    assert!(!back.is_ack());
}
