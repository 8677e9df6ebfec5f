use std::collections::BTreeMap;

use share_common::{display_label, minutes_since, ParticipantLocation};

use crate::snapshot::Snapshot;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MalformedReport {
    #[error("participant id is empty")]
    EmptyId,
    #[error("latitude `{0}` is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude `{0}` is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("timestamp `{0}` is before the epoch")]
    NegativeTimestamp(i64),
    #[error("{0}")]
    Undecodable(String),
}

pub fn validate(report: &ParticipantLocation) -> Result<(), MalformedReport> {
    if report.id.trim().is_empty() {
        return Err(MalformedReport::EmptyId);
    }
    // NaN fails both range checks
    if !(-90.0..=90.0).contains(&report.latitude) {
        return Err(MalformedReport::LatitudeOutOfRange(report.latitude));
    }
    if !(-180.0..=180.0).contains(&report.longitude) {
        return Err(MalformedReport::LongitudeOutOfRange(report.longitude));
    }
    if report.observed_at < 0 {
        return Err(MalformedReport::NegativeTimestamp(report.observed_at));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Inserted,
    Replaced,
    Stale,
    /// Already older than the expiry threshold when it arrived
    Expired,
    Rejected(MalformedReport),
}

impl IngestOutcome {
    /// True if the store content may have changed
    pub fn is_change(&self) -> bool {
        matches!(self, IngestOutcome::Inserted | IngestOutcome::Replaced)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: u64,
    pub stale: u64,
    pub rejected: u64,
    pub expired: u64,
}

/// Latest known location of every participant, last writer wins by `observed_at`.
pub struct LocationStore {
    entries: BTreeMap<String, ParticipantLocation>,
    identity: String,
    expiry_ms: Option<i64>,
    stats: IngestStats,
}

impl LocationStore {
    /// `identity` is the local participant. Its entry is never expired so the user's own marker
    /// stays visible while sharing is paused. `expiry_ms` of `None` keeps entries forever.
    pub fn new(identity: impl Into<String>, expiry_ms: Option<i64>) -> Self {
        Self {
            entries: BTreeMap::new(),
            identity: identity.into(),
            expiry_ms: expiry_ms.filter(|ms| *ms > 0),
            stats: IngestStats::default(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn is_expired(&self, entry: &ParticipantLocation, now: i64) -> bool {
        match self.expiry_ms {
            Some(expiry_ms) => {
                entry.id != self.identity && now.saturating_sub(entry.observed_at) > expiry_ms
            }
            None => false,
        }
    }

    /// Like `ingest`, but a remote report that `expire(now)` would drop right away never enters
    /// the store.
    pub fn ingest_at(&mut self, report: ParticipantLocation, now: i64) -> IngestOutcome {
        if validate(&report).is_ok() && self.is_expired(&report, now) {
            log::debug!(
                "Dropping report for `{}` observed {} ms ago",
                report.id,
                now.saturating_sub(report.observed_at)
            );
            self.stats.expired += 1;
            return IngestOutcome::Expired;
        }
        self.ingest(report)
    }

    pub fn ingest(&mut self, report: ParticipantLocation) -> IngestOutcome {
        if let Err(e) = validate(&report) {
            self.record_malformed(e.clone());
            return IngestOutcome::Rejected(e);
        }

        let outcome = match self.entries.get(&report.id) {
            None => IngestOutcome::Inserted,
            Some(existing) if report.observed_at >= existing.observed_at => IngestOutcome::Replaced,
            Some(existing) => {
                log::trace!(
                    "Dropping stale report for `{}` ({} < {})",
                    report.id,
                    report.observed_at,
                    existing.observed_at
                );
                self.stats.stale += 1;
                return IngestOutcome::Stale;
            }
        };

        self.stats.accepted += 1;
        self.entries.insert(report.id.clone(), report);
        outcome
    }

    /// Counts and logs input that never made it into a `ParticipantLocation`
    pub fn record_malformed(&mut self, reason: MalformedReport) {
        self.stats.rejected += 1;
        log::warn!("Dropping malformed location report: {reason}");
    }

    pub fn remove(&mut self, id: &str) -> Option<ParticipantLocation> {
        self.entries.remove(id)
    }

    /// Drops every remote entry older than the expiry threshold and returns their ids
    pub fn expire(&mut self, now: i64) -> Vec<String> {
        if self.expiry_ms.is_none() {
            return vec![];
        }

        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| self.is_expired(e, now))
            .map(|e| e.id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = self.entries.remove(id) {
                log::info!(
                    "{} expired, last seen {} minutes ago",
                    display_label(id, &self.identity),
                    minutes_since(entry.observed_at, now)
                );
            }
        }
        self.stats.expired += expired.len() as u64;
        expired
    }

    pub fn get(&self, id: &str) -> Option<&ParticipantLocation> {
        self.entries.get(id)
    }

    pub fn own_location(&self) -> Option<&ParticipantLocation> {
        self.entries.get(&self.identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Copy of the current entries ordered by participant id
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::from_sorted(self.entries.values().cloned().collect())
    }
}
