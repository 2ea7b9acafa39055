//! Per-record version timelines and point-in-time content queries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::event::EventAction;
use crate::log::EventSource;
use crate::reconstruct::fold_content;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VersionEntry {
    pub action: EventAction,
    pub timestamp: DateTime<Utc>,
}

/// The lifecycle timeline of one record, oldest first. Survives deletion:
/// the Remove event is part of the answer.
pub fn list_versions(source: &dyn EventSource, record_id: Uuid) -> Result<Vec<VersionEntry>> {
    Ok(source
        .manifest_events()?
        .into_iter()
        .filter(|e| e.record_id == record_id)
        .map(|e| VersionEntry {
            action: e.action,
            timestamp: e.timestamp,
        })
        .collect())
}

/// Record content as of `as_of`: fold only deltas stamped at or before the
/// cutoff. Events are chronologically sorted, so everything after the first
/// too-new event is irrelevant. A record with no deltas by then folds to the
/// empty string.
pub fn content_at(
    source: &dyn EventSource,
    password: &str,
    record_id: Uuid,
    as_of: DateTime<Utc>,
) -> Result<String> {
    let events = source.content_events(record_id)?;
    let cutoff = events.partition_point(|e| e.timestamp <= as_of);
    fold_content(&events[..cutoff], password)
}
