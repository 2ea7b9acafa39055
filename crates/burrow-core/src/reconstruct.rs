//! Full-log state reconstruction.

use std::collections::{BTreeSet, HashMap};

use tracing::warn;
use uuid::Uuid;

use crate::crypto;
use crate::delta;
use crate::error::{Result, StoreError};
use crate::event::{ContentEvent, EventAction};
use crate::log::EventSource;
use crate::record::Record;

/// Fold a record's content deltas, oldest first, seeded from the empty
/// string.
pub(crate) fn fold_content(events: &[ContentEvent], password: &str) -> Result<String> {
    let mut text = String::new();
    for event in events {
        let plaintext = crypto::decrypt(&event.ciphertext, password)?;
        let patch_text = String::from_utf8(plaintext.to_vec())
            .map_err(|_| StoreError::Corrupt("patch text is not valid UTF-8".to_string()))?;
        text = delta::apply_patch(&patch_text, &text)?;
    }
    Ok(text)
}

/// Replay the complete event log into the map of live records.
///
/// Pass 1 walks the manifest events in chronological order and derives the
/// live-id set: Add inserts, Remove deletes, Update leaves it unchanged — so
/// an Update arriving after a Remove (a replay artifact of multi-device
/// merging) cannot resurrect a record.
///
/// Pass 2 folds each live record's encrypted deltas and parses the result.
/// A record that fails to decrypt, apply or parse is logged and skipped;
/// the rest of the store stays available.
pub fn reconstruct_state(
    source: &dyn EventSource,
    password: &str,
) -> Result<HashMap<Uuid, Record>> {
    let mut live: BTreeSet<Uuid> = BTreeSet::new();
    for event in source.manifest_events()? {
        match event.action {
            EventAction::Add => {
                live.insert(event.record_id);
            }
            EventAction::Remove => {
                live.remove(&event.record_id);
            }
            EventAction::Update => {}
        }
    }

    let mut state = HashMap::with_capacity(live.len());
    for id in live {
        let events = source.content_events(id)?;
        if events.is_empty() {
            warn!(record_id = %id, "live record has no content events, skipping");
            continue;
        }
        let text = match fold_content(&events, password) {
            Ok(text) => text,
            Err(e) => {
                warn!(record_id = %id, error = %e, "cannot rebuild record content, skipping");
                continue;
            }
        };
        match Record::from_json(&text) {
            Ok(record) if record.id == id => {
                state.insert(id, record);
            }
            Ok(record) => {
                warn!(
                    record_id = %id,
                    embedded_id = %record.id,
                    "reconstructed record id disagrees with event id, skipping"
                );
            }
            Err(e) => {
                warn!(record_id = %id, error = %e, "reconstructed text is not a record, skipping");
            }
        }
    }
    Ok(state)
}
