use share_common::SharingStatus;

use crate::snapshot::Snapshot;

pub fn sharing_status(identity: &str, snapshot: &Snapshot, is_sharing: bool) -> SharingStatus {
    SharingStatus {
        participant_id: identity.to_string(),
        is_sharing,
        participants: snapshot.len(),
        own_location: snapshot.get(identity).cloned(),
    }
}
