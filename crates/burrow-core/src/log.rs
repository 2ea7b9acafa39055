//! Append-only event persistence.
//!
//! The store uses the filesystem itself as both log and index: one manifest
//! file per lifecycle event under `history/`, one encrypted patch file per
//! content delta at the store root, names sorted lexically equal
//! chronological order. `DirEventLog` hides that layout behind the
//! `EventSource`/`EventLog` traits so reconstruction logic never touches the
//! directory scheme directly.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::event::{
    encode_stamp, manifest_file_name, parse_manifest_file_name, parse_patch_file_name,
    patch_file_name, ContentEvent, EventAction, ManifestEvent, PATCH_SUFFIX,
};
use crate::fsutil::{cleanup_staging_dir, write_atomic};

pub const HISTORY_DIR: &str = "history";
pub const STAGING_DIR: &str = ".staging";

/// Marker the external file synchronizer inserts into the losing copy's
/// filename when the same file was edited on two devices (Syncthing
/// convention: `name.sync-conflict-YYYYMMDD-HHMMSS-DEVICE.ext`).
pub const CONFLICT_MARKER: &str = ".sync-conflict-";

/// Read access to an ordered event sequence.
pub trait EventSource {
    /// All manifest events, chronologically ordered.
    fn manifest_events(&self) -> Result<Vec<ManifestEvent>>;

    /// Content deltas for one record, chronologically ordered.
    fn content_events(&self, record_id: Uuid) -> Result<Vec<ContentEvent>>;
}

/// An appendable event log.
pub trait EventLog: EventSource {
    /// Persist one event. `patch_ciphertext` carries the encrypted content
    /// delta and must be present exactly for Add/Update.
    fn append(
        &self,
        action: EventAction,
        record_id: Uuid,
        patch_ciphertext: Option<&[u8]>,
    ) -> Result<ManifestEvent>;
}

pub fn is_conflict_artifact(name: &str) -> bool {
    name.contains(CONFLICT_MARKER)
}

fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts - Duration::nanoseconds(i64::from(ts.timestamp_subsec_nanos() % 1_000))
}

/// Recover the original filename from a conflict-marked copy, e.g.
/// `a_manifest.sync-conflict-20240101-010101-AAAAAAA.json` → `a_manifest.json`.
pub fn strip_conflict_marker(name: &str) -> Option<String> {
    let start = name.find(CONFLICT_MARKER)?;
    let marker_end = start + CONFLICT_MARKER.len();
    let end = name[marker_end..]
        .find('.')
        .map(|i| marker_end + i)
        .unwrap_or(name.len());
    Some(format!("{}{}", &name[..start], &name[end..]))
}

/// Directory-of-files log rooted at the synchronized folder.
pub struct DirEventLog {
    root: PathBuf,
    history_dir: PathBuf,
    staging_dir: PathBuf,
    last_stamp: Mutex<Option<DateTime<Utc>>>,
}

impl DirEventLog {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let history_dir = root.join(HISTORY_DIR);
        let staging_dir = root.join(STAGING_DIR);
        fs::create_dir_all(&history_dir)?;
        fs::create_dir_all(&staging_dir)?;
        cleanup_staging_dir(&staging_dir);
        Ok(Self {
            root,
            history_dir,
            staging_dir,
            last_stamp: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn history_dir(&self) -> &Path {
        &self.history_dir
    }

    pub(crate) fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Next event timestamp, strictly greater than any timestamp handed out
    /// by this process. Truncated to microseconds — the precision filenames
    /// carry — so two events for one writer never share a stamp even at
    /// filename granularity.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_stamp.lock();
        let mut now = truncate_to_micros(Utc::now());
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }

    fn list_names(dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

/// Read and validate one manifest file. The filename stamp is the ordering
/// authority; a file whose body disagrees with its name is skipped.
pub(crate) fn read_manifest_file(
    path: &Path,
    ts: DateTime<Utc>,
    id: Uuid,
) -> Option<ManifestEvent> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping unreadable manifest");
            return None;
        }
    };
    let event: ManifestEvent = match serde_json::from_slice(&bytes) {
        Ok(event) => event,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping corrupt manifest");
            return None;
        }
    };
    if event.record_id != id {
        warn!(path = %path.display(), "manifest record id disagrees with filename, skipping");
        return None;
    }
    Some(ManifestEvent {
        action: event.action,
        record_id: id,
        timestamp: ts,
    })
}

impl EventSource for DirEventLog {
    fn manifest_events(&self) -> Result<Vec<ManifestEvent>> {
        let mut events = Vec::new();
        for name in Self::list_names(&self.history_dir)? {
            if is_conflict_artifact(&name) {
                continue;
            }
            let Some((ts, id)) = parse_manifest_file_name(&name) else {
                continue;
            };
            if let Some(event) = read_manifest_file(&self.history_dir.join(&name), ts, id) {
                events.push(event);
            }
        }
        events.sort_by(|a, b| (a.timestamp, a.record_id).cmp(&(b.timestamp, b.record_id)));
        Ok(events)
    }

    fn content_events(&self, record_id: Uuid) -> Result<Vec<ContentEvent>> {
        let mut events = Vec::new();
        for name in Self::list_names(&self.root)? {
            if is_conflict_artifact(&name) {
                continue;
            }
            let Some((ts, id)) = parse_patch_file_name(&name) else {
                continue;
            };
            if id != record_id {
                continue;
            }
            events.push(ContentEvent {
                record_id,
                timestamp: ts,
                ciphertext: fs::read(self.root.join(&name))?,
            });
        }
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

impl EventLog for DirEventLog {
    fn append(
        &self,
        action: EventAction,
        record_id: Uuid,
        patch_ciphertext: Option<&[u8]>,
    ) -> Result<ManifestEvent> {
        match (action, patch_ciphertext) {
            (EventAction::Add | EventAction::Update, Some(_)) | (EventAction::Remove, None) => {}
            (EventAction::Add | EventAction::Update, None) => {
                return Err(StoreError::Corrupt(
                    "add/update event requires a content patch".to_string(),
                ));
            }
            (EventAction::Remove, Some(_)) => {
                return Err(StoreError::Corrupt(
                    "remove event must not carry a content patch".to_string(),
                ));
            }
        }

        let timestamp = self.next_timestamp();
        let stamp = encode_stamp(&timestamp);
        let event = ManifestEvent {
            action,
            record_id,
            timestamp,
        };

        // Patch first: a crash between the two writes orphans an invisible
        // patch instead of publishing an Add with no content.
        if let Some(ciphertext) = patch_ciphertext {
            let patch_path = self.root.join(patch_file_name(&stamp, record_id));
            write_atomic(&self.staging_dir, &patch_path, ciphertext)?;
        }
        let manifest_path = self
            .history_dir
            .join(manifest_file_name(&stamp, record_id));
        write_atomic(&self.staging_dir, &manifest_path, &serde_json::to_vec(&event)?)?;
        Ok(event)
    }
}

impl DirEventLog {
    /// All patch file names at the root, conflict-marked copies included.
    /// Used by the password-change path, which must keep every copy
    /// decryptable for later resolution.
    pub(crate) fn all_patch_names(&self) -> Result<Vec<String>> {
        Ok(Self::list_names(&self.root)?
            .into_iter()
            .filter(|n| n.ends_with(PATCH_SUFFIX))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_list_roundtrip() {
        let dir = tempdir().unwrap();
        let log = DirEventLog::open(dir.path()).unwrap();
        let id = Uuid::new_v4();

        let added = log.append(EventAction::Add, id, Some(b"cipher-a")).unwrap();
        log.append(EventAction::Update, id, Some(b"cipher-b")).unwrap();
        log.append(EventAction::Remove, id, None).unwrap();

        let manifests = log.manifest_events().unwrap();
        assert_eq!(manifests.len(), 3);
        assert_eq!(manifests[0], added);
        assert_eq!(manifests[2].action, EventAction::Remove);

        let contents = log.content_events(id).unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0].ciphertext, b"cipher-a");
        assert_eq!(contents[1].ciphertext, b"cipher-b");
        assert!(contents[0].timestamp < contents[1].timestamp);
    }

    #[test]
    fn stamps_are_strictly_monotonic() {
        let dir = tempdir().unwrap();
        let log = DirEventLog::open(dir.path()).unwrap();
        let id = Uuid::new_v4();
        let mut previous = None;
        let mut stamps = std::collections::HashSet::new();
        for _ in 0..64 {
            let event = log.append(EventAction::Add, id, Some(b"x")).unwrap();
            if let Some(prev) = previous {
                assert!(event.timestamp > prev);
            }
            // distinct at filename granularity too
            assert!(stamps.insert(encode_stamp(&event.timestamp)));
            previous = Some(event.timestamp);
        }
        assert_eq!(log.content_events(id).unwrap().len(), 64);
    }

    #[test]
    fn patch_presence_is_enforced() {
        let dir = tempdir().unwrap();
        let log = DirEventLog::open(dir.path()).unwrap();
        let id = Uuid::new_v4();
        assert!(log.append(EventAction::Add, id, None).is_err());
        assert!(log.append(EventAction::Remove, id, Some(b"x")).is_err());
    }

    #[test]
    fn conflict_marker_strip() {
        assert_eq!(
            strip_conflict_marker("a_manifest.sync-conflict-20240101-010101-AAAAAAA.json")
                .as_deref(),
            Some("a_manifest.json")
        );
        assert_eq!(
            strip_conflict_marker("x.sync-conflict-20240101-010101-BBBBBBB.patch").as_deref(),
            Some("x.patch")
        );
        assert_eq!(strip_conflict_marker("plain.patch"), None);
    }

    #[test]
    fn conflict_copies_are_excluded_from_listings() {
        let dir = tempdir().unwrap();
        let log = DirEventLog::open(dir.path()).unwrap();
        let id = Uuid::new_v4();
        let event = log.append(EventAction::Add, id, Some(b"cipher")).unwrap();

        let stamp = encode_stamp(&event.timestamp);
        let conflict_manifest = format!(
            "{}_{id}_manifest.sync-conflict-20240101-010101-AAAAAAA.json",
            stamp
        );
        fs::write(
            log.history_dir().join(conflict_manifest),
            serde_json::to_vec(&event).unwrap(),
        )
        .unwrap();

        assert_eq!(log.manifest_events().unwrap().len(), 1);
        assert_eq!(log.content_events(id).unwrap().len(), 1);
    }
}
