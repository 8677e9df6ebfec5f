use std::time::Duration;

use realtime_api::ChangeEvent;
use share_common::{display_label, Notice, ParticipantLocation};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    watch,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    gate::{system_clock, BroadcastGate, Clock},
    geo::{GeoEvent, GeoSource},
    server::MpscTopic,
    set_config,
    snapshot::Snapshot,
    store::{LocationStore, MalformedReport},
};

const EXPIRY_TICK: Duration = Duration::from_secs(5);

/// Single coordination context owning the store and the broadcast gate.
///
/// Every mutation happens inside `run`, readers only ever see the `Snapshot` copies published on
/// the watch channel.
pub struct Session<G: GeoSource> {
    store: LocationStore,
    gate: BroadcastGate<G>,
    config: Config,
    notices: UnboundedSender<Notice>,
    snapshot_tx: watch::Sender<Snapshot>,
    clock: Clock,
    expiry_tick: Duration,
}

impl<G: GeoSource> Session<G> {
    pub fn new(
        store: LocationStore,
        gate: BroadcastGate<G>,
        config: Config,
        notices: UnboundedSender<Notice>,
        snapshot_tx: watch::Sender<Snapshot>,
    ) -> Self {
        Self {
            store,
            gate,
            config,
            notices,
            snapshot_tx,
            clock: system_clock(),
            expiry_tick: EXPIRY_TICK,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_expiry_tick(mut self, expiry_tick: Duration) -> Self {
        self.expiry_tick = expiry_tick;
        self
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.store.snapshot());
    }

    fn sync_sharing_status(&self) {
        set_config!(self.config.sharing, self.gate.is_sharing());
    }

    /// One-off position of the local participant, shown before sharing starts
    fn locate_once(&mut self) -> bool {
        match self.gate.source_mut().current() {
            Ok(fix) => {
                let report = ParticipantLocation::new(
                    self.store.identity(),
                    fix.latitude,
                    fix.longitude,
                    (self.clock)(),
                );
                self.store.ingest(report).is_change()
            }
            Err(e) => {
                log::warn!("Unable to get current location: {e}");
                if let Err(e) = self
                    .notices
                    .send(Notice::LocationUnavailable(e.to_string()))
                {
                    log::debug!("Notice receiver gone: {e}");
                }
                false
            }
        }
    }

    pub fn apply_change(&mut self, event: ChangeEvent) -> bool {
        match event {
            ChangeEvent::Upsert(row) => {
                let observed_at = row.observed_at();
                let report = ParticipantLocation::new(
                    row.user_id,
                    row.latitude,
                    row.longitude,
                    observed_at,
                );
                self.store.ingest_at(report, (self.clock)()).is_change()
            }
            ChangeEvent::Delete { user_id } => {
                let removed = self.store.remove(&user_id).is_some();
                if removed {
                    log::info!(
                        "{} removed by the backend",
                        display_label(&user_id, self.store.identity())
                    );
                }
                removed
            }
            ChangeEvent::Malformed(reason) => {
                self.store
                    .record_malformed(MalformedReport::Undecodable(reason));
                false
            }
        }
    }

    fn on_geo_event(&mut self, event: GeoEvent) -> bool {
        let changed = match self.gate.handle(event) {
            // local echo, the backend round trip delivers the same report again later
            Some(report) => self.store.ingest(report).is_change(),
            None => false,
        };
        self.sync_sharing_status();
        changed
    }

    fn set_sharing(&mut self, enable: bool) {
        if enable {
            if let Err(e) = self.gate.start() {
                log::warn!("{e}");
            }
        } else {
            self.gate.stop();
        }
        self.sync_sharing_status();
    }

    fn expire(&mut self) -> bool {
        !self.store.expire((self.clock)()).is_empty()
    }

    pub async fn run(
        mut self,
        mut geo_rx: UnboundedReceiver<GeoEvent>,
        mut inbound_rx: mpsc::Receiver<ChangeEvent>,
        mut commands_rx: UnboundedReceiver<MpscTopic>,
        cancellation_token: CancellationToken,
    ) {
        let name = "session_task";

        self.locate_once();
        if self.config.share_at_startup {
            self.set_sharing(true);
        }
        self.publish();

        let mut expiry = tokio::time::interval(self.expiry_tick);

        loop {
            let changed = tokio::select! {
                _ = cancellation_token.cancelled() => break,
                Some(event) = inbound_rx.recv() => self.apply_change(event),
                Some(event) = geo_rx.recv() => self.on_geo_event(event),
                command = commands_rx.recv() => match command {
                    Some(MpscTopic::Sharing(enable)) => {
                        self.set_sharing(enable);
                        false
                    }
                    None => {
                        if !cancellation_token.is_cancelled() {
                            log::error!("commands_rx channel closed, exiting {name}");
                        }
                        break;
                    }
                },
                _ = expiry.tick() => self.expire(),
            };

            if changed {
                self.publish();
            }
        }

        // releases the geo watch before the gate is dropped
        self.gate.stop();
        self.sync_sharing_status();

        let stats = self.store.stats();
        log::info!(
            "Session ended: {} accepted, {} stale, {} rejected, {} expired reports",
            stats.accepted,
            stats.stale,
            stats.rejected,
            stats.expired
        );
        tracing::warn!("exiting {name}");
    }
}
