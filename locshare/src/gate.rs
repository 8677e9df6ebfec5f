use share_common::{Notice, ParticipantLocation};
use tokio::sync::mpsc::UnboundedSender;

use crate::geo::{GeoError, GeoEvent, GeoSource, WatchId};

/// Milliseconds since the unix epoch
pub type Clock = Box<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Box::new(|| chrono::Utc::now().timestamp_millis())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Sharing,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("Location capability unavailable: {0}")]
    CapabilityUnavailable(String),
}

/// Controls whether positions from the geo source are published.
///
/// Every position received while `Sharing` is stamped with the clock and sent over `outbound`.
/// Notices for the user go over `notices`.
pub struct BroadcastGate<G: GeoSource> {
    identity: String,
    source: G,
    geo_tx: UnboundedSender<GeoEvent>,
    outbound: UnboundedSender<ParticipantLocation>,
    notices: UnboundedSender<Notice>,
    clock: Clock,
    watch: Option<WatchId>,
}

impl<G: GeoSource> BroadcastGate<G> {
    /// `geo_tx` is handed to the source on every `start`; the matching receiver must be drained
    /// into `handle`.
    pub fn new(
        identity: impl Into<String>,
        source: G,
        geo_tx: UnboundedSender<GeoEvent>,
        outbound: UnboundedSender<ParticipantLocation>,
        notices: UnboundedSender<Notice>,
    ) -> Self {
        Self {
            identity: identity.into(),
            source,
            geo_tx,
            outbound,
            notices,
            clock: system_clock(),
            watch: None,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> GateState {
        match self.watch {
            Some(_) => GateState::Sharing,
            None => GateState::Idle,
        }
    }

    pub fn is_sharing(&self) -> bool {
        self.state() == GateState::Sharing
    }

    pub fn source(&self) -> &G {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut G {
        &mut self.source
    }

    fn notify(&self, notice: Notice) {
        if notice.is_error() {
            log::warn!("{}: {}", notice.title(), notice.description());
        } else {
            log::info!("{}", notice.description());
        }
        if let Err(e) = self.notices.send(notice) {
            log::debug!("Notice receiver gone: {e}");
        }
    }

    pub fn start(&mut self) -> Result<(), GateError> {
        if self.is_sharing() {
            log::debug!("Already sharing location");
            return Ok(());
        }

        if !self.source.is_available() {
            let reason = "geolocation is not supported on this host".to_string();
            self.notify(Notice::CapabilityUnavailable(reason.clone()));
            return Err(GateError::CapabilityUnavailable(reason));
        }

        match self.source.watch(self.geo_tx.clone()) {
            Ok(id) => {
                self.watch = Some(id);
                self.notify(Notice::SharingStarted);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.notify(Notice::CapabilityUnavailable(reason.clone()));
                Err(GateError::CapabilityUnavailable(reason))
            }
        }
    }

    /// No-op while idle
    pub fn stop(&mut self) {
        if let Some(id) = self.watch.take() {
            self.source.clear_watch(id);
            self.notify(Notice::SharingStopped);
        }
    }

    /// Processes one event from the geo source and returns the report that was published, if
    /// any. Events from a watch that is no longer active are dropped.
    pub fn handle(&mut self, event: GeoEvent) -> Option<ParticipantLocation> {
        if self.watch != Some(event.watch_id()) {
            log::trace!("Dropping event from inactive watch {:?}", event.watch_id());
            return None;
        }

        match event {
            GeoEvent::Position(_, fix) => {
                let report = ParticipantLocation::new(
                    self.identity.clone(),
                    fix.latitude,
                    fix.longitude,
                    (self.clock)(),
                );
                if let Err(e) = self.outbound.send(report.clone()) {
                    log::error!("Cannot send location over outbound channel: {e}");
                }
                Some(report)
            }
            GeoEvent::Error(_, e) => {
                self.source_error(e);
                None
            }
        }
    }

    fn source_error(&mut self, e: GeoError) {
        if !e.is_fatal() {
            log::warn!("Location source: {e}");
            return;
        }
        if let Some(id) = self.watch.take() {
            self.source.clear_watch(id);
        }
        self.notify(Notice::LocationUnavailable(e.to_string()));
    }
}

impl<G: GeoSource> Drop for BroadcastGate<G> {
    fn drop(&mut self) {
        if let Some(id) = self.watch.take() {
            self.source.clear_watch(id);
        }
    }
}
