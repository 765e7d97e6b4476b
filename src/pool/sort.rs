//! Snapshot ordering strategies

use chrono::{DateTime, Utc};

use crate::models::Entry;

/// Pluggable ordering applied to combined pool snapshots.
pub trait SnapshotOrder: Send + Sync {
    fn sort(&self, entries: &mut Vec<Entry>);
}

/// Default ordering: quarantine deadline ascending (unquarantined first),
/// offered count ascending, staleness descending, speed ascending.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultOrder;

impl SnapshotOrder for DefaultOrder {
    fn sort(&self, entries: &mut Vec<Entry>) {
        entries.sort_by(|a, b| {
            deadline_key(a)
                .cmp(&deadline_key(b))
                .then(a.offered.cmp(&b.offered))
                // Staleness descending == oldest last_seen first.
                .then(a.last_seen.cmp(&b.last_seen))
                .then(a.speed.cmp(&b.speed))
        });
    }
}

fn deadline_key(entry: &Entry) -> DateTime<Utc> {
    // "Not quarantined" sorts before any real deadline.
    entry.reanimate_after.unwrap_or(DateTime::<Utc>::MIN_UTC)
}
