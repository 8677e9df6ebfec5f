pub mod common;

use locshare::{
    gate::{BroadcastGate, GateError, GateState},
    geo::{Fix, GeoError, GeoEvent},
};
use share_common::{Notice, ParticipantLocation};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::common::{ManualClock, MockGeoSource};

struct Harness {
    gate: BroadcastGate<MockGeoSource>,
    source: MockGeoSource,
    clock: ManualClock,
    geo_rx: UnboundedReceiver<GeoEvent>,
    outbound_rx: UnboundedReceiver<ParticipantLocation>,
    notices_rx: UnboundedReceiver<Notice>,
}

impl Harness {
    fn new(source: MockGeoSource) -> Self {
        let (geo_tx, geo_rx) = unbounded_channel();
        let (outbound_tx, outbound_rx) = unbounded_channel();
        let (notices_tx, notices_rx) = unbounded_channel();
        let clock = ManualClock::new(1_000);
        let gate = BroadcastGate::new("me", source.clone(), geo_tx, outbound_tx, notices_tx)
            .with_clock(clock.clock());
        Self {
            gate,
            source,
            clock,
            geo_rx,
            outbound_rx,
            notices_rx,
        }
    }

    /// Feeds every pending geo event through the gate
    fn pump(&mut self) -> Vec<ParticipantLocation> {
        let mut published = vec![];
        while let Ok(event) = self.geo_rx.try_recv() {
            published.extend(self.gate.handle(event));
        }
        published
    }

    fn notices(&mut self) -> Vec<Notice> {
        let mut notices = vec![];
        while let Ok(notice) = self.notices_rx.try_recv() {
            notices.push(notice);
        }
        notices
    }
}

#[test]
fn start_publishes_stamped_positions() {
    let mut h = Harness::new(MockGeoSource::new());
    assert_eq!(h.gate.state(), GateState::Idle);

    h.gate.start().unwrap();
    assert_eq!(h.gate.state(), GateState::Sharing);
    assert_eq!(h.notices(), vec![Notice::SharingStarted]);

    h.source.emit(Fix::new(52.5, 13.4));
    h.clock.set(2_000);
    h.source.emit(Fix::new(52.6, 13.5));
    let published = h.pump();

    assert_eq!(published.len(), 2);
    assert_eq!(published[0].id, "me");
    // stamped when handled, not when emitted
    assert_eq!(published[0].observed_at, 2_000);
    assert_eq!(h.outbound_rx.try_recv().unwrap(), published[0]);
    assert_eq!(h.outbound_rx.try_recv().unwrap(), published[1]);
}

#[test]
fn nothing_is_published_after_stop() {
    let mut h = Harness::new(MockGeoSource::new());
    h.gate.start().unwrap();
    h.notices();

    // already queued when stop is called
    let watch = h.source.emit(Fix::new(1.0, 1.0));
    h.gate.stop();

    assert_eq!(h.gate.state(), GateState::Idle);
    assert_eq!(h.source.cleared(), vec![watch]);
    assert!(h.pump().is_empty());
    h.source.emit(Fix::new(2.0, 2.0));
    assert!(h.pump().is_empty());
    assert!(h.outbound_rx.try_recv().is_err());
    assert_eq!(h.notices(), vec![Notice::SharingStopped]);
}

#[test]
fn stop_is_idempotent() {
    let mut h = Harness::new(MockGeoSource::new());
    h.gate.stop();
    assert_eq!(h.gate.state(), GateState::Idle);
    assert!(h.notices().is_empty());

    h.gate.start().unwrap();
    h.gate.stop();
    h.gate.stop();
    assert_eq!(h.source.cleared().len(), 1);
    assert_eq!(
        h.notices(),
        vec![Notice::SharingStarted, Notice::SharingStopped]
    );
}

#[test]
fn start_twice_keeps_one_watch() {
    let mut h = Harness::new(MockGeoSource::new());
    h.gate.start().unwrap();
    h.gate.start().unwrap();
    assert_eq!(h.source.active().len(), 1);
    assert_eq!(h.notices(), vec![Notice::SharingStarted]);
}

#[test]
fn permission_denied_on_start_leaves_gate_idle() {
    let mut h = Harness::new(MockGeoSource::failing(GeoError::PermissionDenied(
        "user declined".into(),
    )));

    let err = h.gate.start().unwrap_err();
    assert!(matches!(err, GateError::CapabilityUnavailable(_)));
    assert_eq!(h.gate.state(), GateState::Idle);

    let notices = h.notices();
    assert_eq!(notices.len(), 1);
    assert!(matches!(&notices[0], Notice::CapabilityUnavailable(reason) if reason.contains("user declined")));
}

#[test]
fn missing_capability_fails_start() {
    let mut h = Harness::new(MockGeoSource::unavailable());
    assert!(h.gate.start().is_err());
    assert_eq!(h.gate.state(), GateState::Idle);
    assert!(h.source.active().is_empty());
    assert!(matches!(
        h.notices().as_slice(),
        [Notice::CapabilityUnavailable(_)]
    ));
}

#[test]
fn fatal_source_error_reverts_to_idle() {
    let mut h = Harness::new(MockGeoSource::new());
    h.gate.start().unwrap();
    h.notices();

    let watch = h.source.emit_error(GeoError::PermissionDenied("revoked".into()));
    assert!(h.pump().is_empty());

    assert_eq!(h.gate.state(), GateState::Idle);
    assert_eq!(h.source.cleared(), vec![watch]);
    assert!(matches!(
        h.notices().as_slice(),
        [Notice::LocationUnavailable(reason)] if reason.contains("revoked")
    ));

    // can be started again
    h.gate.start().unwrap();
    assert_eq!(h.gate.state(), GateState::Sharing);
}

#[test]
fn timeout_keeps_sharing() {
    let mut h = Harness::new(MockGeoSource::new());
    h.gate.start().unwrap();
    h.notices();

    h.source.emit_error(GeoError::Timeout);
    h.source.emit(Fix::new(1.0, 1.0));
    assert_eq!(h.pump().len(), 1);
    assert_eq!(h.gate.state(), GateState::Sharing);
    assert!(h.notices().is_empty());
}

#[test]
fn events_from_previous_watch_are_dropped() {
    let mut h = Harness::new(MockGeoSource::new());
    h.gate.start().unwrap();
    let old = h.source.emit(Fix::new(1.0, 1.0));
    h.gate.stop();
    h.gate.start().unwrap();

    let published = h.pump();
    assert!(published.is_empty());

    let new = h.source.emit(Fix::new(2.0, 2.0));
    assert_ne!(old, new);
    let published = h.pump();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].latitude, 2.0);
}

#[test]
fn drop_releases_watch() {
    let h = Harness::new(MockGeoSource::new());
    let Harness {
        mut gate, source, ..
    } = h;
    gate.start().unwrap();
    assert_eq!(source.active().len(), 1);

    drop(gate);
    assert!(source.active().is_empty());
}
