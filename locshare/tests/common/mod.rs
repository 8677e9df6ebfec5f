#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, Mutex,
};

use locshare::{
    gate::Clock,
    geo::{Fix, GeoError, GeoEvent, GeoSource, WatchId},
};
use share_common::ParticipantLocation;
use tokio::sync::mpsc::UnboundedSender;

pub fn report(id: &str, latitude: f64, longitude: f64, observed_at: i64) -> ParticipantLocation {
    ParticipantLocation::new(id, latitude, longitude, observed_at)
}

/// Clock whose value is set by the test
#[derive(Clone, Default)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self(Arc::new(AtomicI64::new(now)))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn clock(&self) -> Clock {
        let now = self.0.clone();
        Box::new(move || now.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct MockState {
    pub unavailable: bool,
    pub watch_error: Option<GeoError>,
    pub current: Option<Fix>,
    pub next_id: u64,
    pub watches: Vec<(WatchId, UnboundedSender<GeoEvent>)>,
    pub cleared: Vec<WatchId>,
}

/// Geo source driven by the test through the shared `MockState`
#[derive(Clone, Default)]
pub struct MockGeoSource(pub Arc<Mutex<MockState>>);

impl MockGeoSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        let source = Self::default();
        source.0.lock().unwrap().unavailable = true;
        source
    }

    pub fn failing(e: GeoError) -> Self {
        let source = Self::default();
        source.0.lock().unwrap().watch_error = Some(e);
        source
    }

    pub fn at(fix: Fix) -> Self {
        let source = Self::default();
        source.0.lock().unwrap().current = Some(fix);
        source
    }

    pub fn active(&self) -> Vec<WatchId> {
        let state = self.0.lock().unwrap();
        state
            .watches
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| !state.cleared.contains(id))
            .collect()
    }

    pub fn cleared(&self) -> Vec<WatchId> {
        self.0.lock().unwrap().cleared.clone()
    }

    /// Emits `fix` on the most recent watch, even if it was cleared
    pub fn emit(&self, fix: Fix) -> WatchId {
        self.emit_event(|id| GeoEvent::Position(id, fix))
    }

    pub fn emit_error(&self, e: GeoError) -> WatchId {
        self.emit_event(|id| GeoEvent::Error(id, e.clone()))
    }

    fn emit_event(&self, event: impl Fn(WatchId) -> GeoEvent) -> WatchId {
        let state = self.0.lock().unwrap();
        let (id, tx) = state.watches.last().expect("no watch registered");
        tx.send(event(*id)).unwrap();
        *id
    }
}

impl GeoSource for MockGeoSource {
    fn is_available(&self) -> bool {
        !self.0.lock().unwrap().unavailable
    }

    fn current(&mut self) -> Result<Fix, GeoError> {
        self.0
            .lock()
            .unwrap()
            .current
            .ok_or_else(|| GeoError::Unavailable("no fix yet".into()))
    }

    fn watch(&mut self, events: UnboundedSender<GeoEvent>) -> Result<WatchId, GeoError> {
        let mut state = self.0.lock().unwrap();
        if let Some(e) = state.watch_error.clone() {
            return Err(e);
        }
        state.next_id += 1;
        let id = WatchId(state.next_id);
        state.watches.push((id, events));
        Ok(id)
    }

    fn clear_watch(&mut self, id: WatchId) {
        self.0.lock().unwrap().cleared.push(id);
    }
}
