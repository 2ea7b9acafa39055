//! Event types and the filename codec for the on-disk log.
//!
//! Event filenames start with a UTC timestamp rendered with fixed-width
//! microseconds and `:` swapped for `-`, so plain lexical directory order is
//! chronological order. The record id is embedded verbatim, which makes
//! per-record scans a substring match on the listing.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};

pub const MANIFEST_SUFFIX: &str = "_manifest.json";
pub const PATCH_SUFFIX: &str = ".patch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Add,
    Update,
    Remove,
}

/// Lifecycle event: one JSON file under `history/` per add/update/remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEvent {
    pub action: EventAction,
    pub record_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// Encrypted content delta: one `.patch` file per add/update.
#[derive(Debug, Clone)]
pub struct ContentEvent {
    pub record_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub ciphertext: Vec<u8>,
}

/// Render a timestamp for use in filenames.
pub fn encode_stamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
        .replace(':', "-")
}

/// Parse a filename timestamp back into a `DateTime`.
pub fn decode_stamp(stamp: &str) -> Result<DateTime<Utc>> {
    let (date, time) = stamp
        .split_once('T')
        .ok_or_else(|| StoreError::Corrupt(format!("bad timestamp: {stamp}")))?;
    let iso = format!("{date}T{}", time.replace('-', ":"));
    let parsed = DateTime::parse_from_rfc3339(&iso)
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {stamp}: {e}")))?;
    Ok(parsed.with_timezone(&Utc))
}

pub fn manifest_file_name(stamp: &str, record_id: Uuid) -> String {
    format!("{stamp}_{record_id}{MANIFEST_SUFFIX}")
}

pub fn patch_file_name(stamp: &str, record_id: Uuid) -> String {
    format!("{stamp}_{record_id}{PATCH_SUFFIX}")
}

/// Split a `{stamp}_{record_id}` stem. Neither part contains `_`, so the
/// single underscore is unambiguous.
fn parse_stem(stem: &str) -> Option<(DateTime<Utc>, Uuid)> {
    let (stamp, id) = stem.rsplit_once('_')?;
    let ts = decode_stamp(stamp).ok()?;
    let record_id = Uuid::parse_str(id).ok()?;
    Some((ts, record_id))
}

pub fn parse_manifest_file_name(name: &str) -> Option<(DateTime<Utc>, Uuid)> {
    parse_stem(name.strip_suffix(MANIFEST_SUFFIX)?)
}

pub fn parse_patch_file_name(name: &str) -> Option<(DateTime<Utc>, Uuid)> {
    parse_stem(name.strip_suffix(PATCH_SUFFIX)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stamp_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 58).unwrap()
            + chrono::Duration::microseconds(123_456);
        let stamp = encode_stamp(&ts);
        assert!(!stamp.contains(':'));
        assert_eq!(decode_stamp(&stamp).unwrap(), ts);
    }

    #[test]
    fn lexical_order_is_chronological() {
        let early = Utc.with_ymd_and_hms(2024, 1, 2, 9, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
        assert!(encode_stamp(&early) < encode_stamp(&late));

        // sub-second ordering relies on fixed-width microseconds
        let base = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
        let a = base + chrono::Duration::microseconds(90);
        let b = base + chrono::Duration::microseconds(100);
        assert!(encode_stamp(&a) < encode_stamp(&b));
    }

    #[test]
    fn filename_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let stamp = encode_stamp(&ts);
        let id = Uuid::new_v4();

        let manifest = manifest_file_name(&stamp, id);
        assert_eq!(parse_manifest_file_name(&manifest), Some((ts, id)));
        assert!(parse_patch_file_name(&manifest).is_none());

        let patch = patch_file_name(&stamp, id);
        assert_eq!(parse_patch_file_name(&patch), Some((ts, id)));
        assert!(parse_manifest_file_name(&patch).is_none());
    }

    #[test]
    fn junk_names_are_rejected() {
        assert!(parse_manifest_file_name("_index.json").is_none());
        assert!(parse_patch_file_name("notes.txt").is_none());
        assert!(parse_patch_file_name("x_y.patch").is_none());
    }
}
