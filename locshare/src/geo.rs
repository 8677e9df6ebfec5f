use std::{collections::HashMap, fs::File, io::BufReader, path::Path, time::Duration};

use anyhow::Context;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
}

impl Fix {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

impl std::str::FromStr for Fix {
    type Err = anyhow::Error;

    /// Parses `lat,lng`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lat, lng) = s
            .split_once(',')
            .with_context(|| format!("Expected `lat,lng`, got `{s}`"))?;
        let latitude: f64 = lat.trim().parse().context("Invalid latitude")?;
        let longitude: f64 = lng.trim().parse().context("Invalid longitude")?;
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            anyhow::bail!("Position `{s}` is out of range");
        }
        Ok(Self::new(latitude, longitude))
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GeoError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Timed out waiting for a position")]
    Timeout,
    #[error("Position unavailable: {0}")]
    Unavailable(String),
}

impl GeoError {
    /// Fatal errors end a watch. A timeout only means this particular fix was late.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, GeoError::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum GeoEvent {
    Position(WatchId, Fix),
    Error(WatchId, GeoError),
}

impl GeoEvent {
    pub fn watch_id(&self) -> WatchId {
        match self {
            GeoEvent::Position(id, _) | GeoEvent::Error(id, _) => *id,
        }
    }
}

/// Platform position sensing.
///
/// `watch` delivers a continuous feed over `events` until `clear_watch` is called with the
/// returned id.
pub trait GeoSource {
    fn is_available(&self) -> bool {
        true
    }

    fn current(&mut self) -> Result<Fix, GeoError>;

    fn watch(&mut self, events: UnboundedSender<GeoEvent>) -> Result<WatchId, GeoError>;

    fn clear_watch(&mut self, id: WatchId);
}

impl<G: GeoSource + ?Sized> GeoSource for Box<G> {
    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn current(&mut self) -> Result<Fix, GeoError> {
        (**self).current()
    }

    fn watch(&mut self, events: UnboundedSender<GeoEvent>) -> Result<WatchId, GeoError> {
        (**self).watch(events)
    }

    fn clear_watch(&mut self, id: WatchId) {
        (**self).clear_watch(id)
    }
}

/// Host without any position capability
#[derive(Debug, Default)]
pub struct Unsupported;

impl GeoSource for Unsupported {
    fn is_available(&self) -> bool {
        false
    }

    fn current(&mut self) -> Result<Fix, GeoError> {
        Err(GeoError::Unavailable("no position source configured".into()))
    }

    fn watch(&mut self, _events: UnboundedSender<GeoEvent>) -> Result<WatchId, GeoError> {
        Err(GeoError::Unavailable("no position source configured".into()))
    }

    fn clear_watch(&mut self, _id: WatchId) {}
}

/// Replays a list of fixes at a fixed period, wrapping around at the end.
///
/// A single fix behaves like a stationary receiver that re-reports its position.
pub struct ReplaySource {
    fixes: Vec<Fix>,
    period: Duration,
    next_id: u64,
    watches: HashMap<WatchId, CancellationToken>,
}

impl ReplaySource {
    pub fn new(fixes: Vec<Fix>, period: Duration) -> anyhow::Result<Self> {
        if fixes.is_empty() {
            anyhow::bail!("Replay source needs at least one position");
        }
        Ok(Self {
            fixes,
            period,
            next_id: 1,
            watches: HashMap::new(),
        })
    }

    pub fn fixed(fix: Fix, period: Duration) -> Self {
        Self {
            fixes: vec![fix],
            period,
            next_id: 1,
            watches: HashMap::new(),
        }
    }

    /// Loads every track point of every track segment in the file
    pub fn from_gpx(path: &Path, period: Duration) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("Cannot open {path:?}"))?;
        let gpx = gpx::read(BufReader::new(file)).with_context(|| format!("Cannot parse {path:?}"))?;

        let fixes: Vec<Fix> = gpx
            .tracks
            .iter()
            .flat_map(|t| t.segments.iter())
            .flat_map(|s| s.points.iter())
            .map(|p| Fix::new(p.point().y(), p.point().x()))
            .collect();

        log::info!("Loaded {} track points from {path:?}", fixes.len());
        Self::new(fixes, period).with_context(|| format!("No track points in {path:?}"))
    }

    pub fn active_watches(&self) -> usize {
        self.watches.len()
    }
}

impl GeoSource for ReplaySource {
    fn current(&mut self) -> Result<Fix, GeoError> {
        self.fixes
            .first()
            .copied()
            .ok_or_else(|| GeoError::Unavailable("no positions to replay".into()))
    }

    fn watch(&mut self, events: UnboundedSender<GeoEvent>) -> Result<WatchId, GeoError> {
        let id = WatchId(self.next_id);
        self.next_id += 1;

        let cancellation_token = CancellationToken::new();
        let fixes = self.fixes.clone();
        let period = self.period;

        tokio::task::spawn({
            let cancellation_token = cancellation_token.clone();
            async move {
                let mut interval = tokio::time::interval(period);
                for fix in fixes.iter().cycle() {
                    tokio::select! {
                        _ = cancellation_token.cancelled() => break,
                        _ = interval.tick() => (),
                    }
                    if events.send(GeoEvent::Position(id, *fix)).is_err() {
                        break;
                    }
                }
                log::debug!("Replay watch {id:?} finished");
            }
        });

        self.watches.insert(id, cancellation_token);
        Ok(id)
    }

    fn clear_watch(&mut self, id: WatchId) {
        if let Some(token) = self.watches.remove(&id) {
            token.cancel();
        }
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        for (_, token) in self.watches.drain() {
            token.cancel();
        }
    }
}
