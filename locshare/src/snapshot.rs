use std::cmp::Ordering;

use serde::Serialize;
use share_common::{ParticipantLocation, SnapshotDiff};

/// Immutable copy of the store, sorted by participant id.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    entries: Vec<ParticipantLocation>,
}

impl Snapshot {
    pub(crate) fn from_sorted(entries: Vec<ParticipantLocation>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].id < w[1].id));
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ParticipantLocation> {
        self.entries.iter()
    }

    pub fn get(&self, id: &str) -> Option<&ParticipantLocation> {
        self.entries
            .binary_search_by(|e| e.id.as_str().cmp(id))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn as_slice(&self) -> &[ParticipantLocation] {
        &self.entries
    }

    pub fn into_vec(self) -> Vec<ParticipantLocation> {
        self.entries
    }

    /// What changed going from `self` to `next`. Both sides are sorted so this is a single
    /// merge pass.
    pub fn diff(&self, next: &Snapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();
        let mut old = self.entries.iter().peekable();
        let mut new = next.entries.iter().peekable();

        loop {
            match (old.peek(), new.peek()) {
                (Some(o), Some(n)) => match o.id.cmp(&n.id) {
                    Ordering::Less => {
                        diff.removed.push(o.id.clone());
                        old.next();
                    }
                    Ordering::Greater => {
                        diff.added.push((*n).clone());
                        new.next();
                    }
                    Ordering::Equal => {
                        if o != n {
                            diff.updated.push((*n).clone());
                        }
                        old.next();
                        new.next();
                    }
                },
                (Some(o), None) => {
                    diff.removed.push(o.id.clone());
                    old.next();
                }
                (None, Some(n)) => {
                    diff.added.push((*n).clone());
                    new.next();
                }
                (None, None) => break,
            }
        }

        diff
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a ParticipantLocation;
    type IntoIter = std::slice::Iter<'a, ParticipantLocation>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
