//! Multi-device conflict detection and resolution.
//!
//! Replication is delegated to an external file synchronizer that knows
//! nothing about event semantics. Because the log is append-only and keyed
//! by unique ids, concurrent edits on different devices usually merge by
//! simple file accumulation. Two cases need explicit work:
//!
//! 1. the synchronizer renamed a losing copy of a file with its
//!    `.sync-conflict-` marker (same file edited on two devices), and
//! 2. two devices independently created records for the same real-world
//!    entity under different ids (natural-key collision).
//!
//! The resolution protocol elects a single device through a lock file plus
//! a propagation window: claim, wait for the synchronizer to replicate
//! competing claims, re-read, and only proceed if the claim still names this
//! device. That is a best-effort, time-based heuristic, not consensus; it
//! converges eventually, it does not linearize. Leadership confirmation is a
//! precondition for appending any resolution event, so a device that loses
//! the election has nothing to roll back.
//!
//! Choosing winners for natural-key collisions is a policy/UI concern: the
//! resolver surfaces `CollisionGroup`s and suspends; the caller hands back
//! one winner per group and `commit` converges the log.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto;
use crate::delta;
use crate::error::{Result, StoreError};
use crate::event::{
    parse_manifest_file_name, parse_patch_file_name, ContentEvent, EventAction, ManifestEvent,
};
use crate::log::{
    is_conflict_artifact, read_manifest_file, strip_conflict_marker, DirEventLog, EventLog,
    EventSource,
};
use crate::reconstruct::reconstruct_state;
use crate::record::{NaturalKey, Record};

pub const LOCK_FILE: &str = "resolution.lock";

/// Contents of `resolution.lock`: which device claimed the resolution, when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockClaim {
    pub device_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// Proof that this device confirmed leadership. Not cloneable; consumed by
/// `commit`, so resolution events cannot be emitted twice or without an
/// election.
pub struct LeaderToken {
    _private: (),
}

/// Union-replayed state, including events recovered from conflict-marked
/// copies, plus each record's newest manifest timestamp (for winner-picking
/// policies).
pub struct UnifiedState {
    pub records: HashMap<Uuid, Record>,
    pub last_modified: HashMap<Uuid, DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub record: Record,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CollisionGroup {
    pub key: NaturalKey,
    pub candidates: Vec<Candidate>,
}

/// One decision per collision group: the surviving id and the ids it
/// absorbs.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub winner: Uuid,
    pub losers: Vec<Uuid>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub artifacts_deleted: usize,
}

pub struct ConflictResolver<'a> {
    log: &'a DirEventLog,
    device_id: String,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(log: &'a DirEventLog, device_id: impl Into<String>) -> Self {
        Self {
            log,
            device_id: device_id.into(),
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.log.root().join(LOCK_FILE)
    }

    /// Conflict-marked artifacts at the store root and under `history/`.
    pub fn detect(&self) -> Result<Vec<PathBuf>> {
        let mut artifacts = Vec::new();
        for dir in [self.log.root(), self.log.history_dir()] {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if is_conflict_artifact(&entry.file_name().to_string_lossy()) {
                    artifacts.push(entry.path());
                }
            }
        }
        artifacts.sort();
        Ok(artifacts)
    }

    /// Whoever currently claims the resolution, if anyone.
    pub fn lock_holder(&self) -> Result<Option<LockClaim>> {
        match fs::read(self.lock_path()) {
            Ok(bytes) => {
                let claim: LockClaim = serde_json::from_slice(&bytes).map_err(|e| {
                    StoreError::Corrupt(format!("unreadable resolution lock: {e}"))
                })?;
                Ok(Some(claim))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stake this device's claim. Fails with `LockContention` if another
    /// device already claimed.
    pub fn claim(&self) -> Result<()> {
        if let Some(holder) = self.lock_holder()? {
            if holder.device_id == self.device_id {
                return Ok(());
            }
            return Err(StoreError::LockContention {
                holder: holder.device_id,
            });
        }
        let claim = LockClaim {
            device_id: self.device_id.clone(),
            claimed_at: Utc::now(),
        };
        // create_new keeps two in-process claimants from clobbering each
        // other; cross-device races are caught by confirm() after the
        // propagation window.
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path())
        {
            Ok(mut file) => {
                file.write_all(&serde_json::to_vec(&claim)?)?;
                file.sync_all()?;
                info!(device_id = %self.device_id, "claimed conflict resolution");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => match self.lock_holder()? {
                Some(holder) if holder.device_id == self.device_id => Ok(()),
                Some(holder) => Err(StoreError::LockContention {
                    holder: holder.device_id,
                }),
                None => Err(StoreError::LockContention {
                    holder: "unknown".to_string(),
                }),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Re-read the lock after the propagation window. Only a claim that
    /// still names this device confirms leadership; the synchronizer may
    /// have replaced it with a competing device's claim in the meantime.
    pub fn confirm(&self) -> Result<LeaderToken> {
        match self.lock_holder()? {
            Some(holder) if holder.device_id == self.device_id => {
                info!(device_id = %self.device_id, "leadership confirmed");
                Ok(LeaderToken { _private: () })
            }
            Some(holder) => Err(StoreError::LockContention {
                holder: holder.device_id,
            }),
            None => Err(StoreError::LockContention {
                holder: "unknown".to_string(),
            }),
        }
    }

    /// Claim, wait out the propagation window, confirm.
    pub fn elect(&self, window: Duration) -> Result<LeaderToken> {
        self.claim()?;
        std::thread::sleep(window);
        self.confirm()
    }

    /// Drop this device's claim (deferred or aborted resolution).
    pub fn release(&self) -> Result<()> {
        if let Some(holder) = self.lock_holder()? {
            if holder.device_id == self.device_id {
                fs::remove_file(self.lock_path())?;
            }
        }
        Ok(())
    }

    /// Replay the union of all events — conflict-marked copies included,
    /// marker stripped — into a candidate unified state.
    pub fn unified_state(&self, _token: &LeaderToken, password: &str) -> Result<UnifiedState> {
        let union = UnionSource { log: self.log };
        let records = reconstruct_state(&union, password)?;
        let mut last_modified = HashMap::new();
        for event in union.manifest_events()? {
            let slot = last_modified
                .entry(event.record_id)
                .or_insert(event.timestamp);
            if event.timestamp > *slot {
                *slot = event.timestamp;
            }
        }
        Ok(UnifiedState {
            records,
            last_modified,
        })
    }

    /// Group unified records by natural key; only groups with more than one
    /// member need a decision.
    pub fn collision_groups(state: &UnifiedState) -> Vec<CollisionGroup> {
        let mut by_key: BTreeMap<NaturalKey, Vec<Candidate>> = BTreeMap::new();
        for record in state.records.values() {
            let last_modified = state
                .last_modified
                .get(&record.id)
                .copied()
                .unwrap_or_else(Utc::now);
            by_key
                .entry(record.natural_key())
                .or_default()
                .push(Candidate {
                    record: record.clone(),
                    last_modified,
                });
        }
        by_key
            .into_iter()
            .filter(|(_, candidates)| candidates.len() > 1)
            .map(|(key, mut candidates)| {
                candidates.sort_by_key(|c| (c.last_modified, c.record.id));
                CollisionGroup { key, candidates }
            })
            .collect()
    }

    /// Drop losers from the unified record set and rewrite every reference
    /// to a loser onto its group's winner.
    pub fn resolve_target(
        state: &UnifiedState,
        decisions: &[Resolution],
    ) -> Result<HashMap<Uuid, Record>> {
        let mut winner_of: HashMap<Uuid, Uuid> = HashMap::new();
        for decision in decisions {
            if !state.records.contains_key(&decision.winner) {
                return Err(StoreError::NotFound(decision.winner));
            }
            for loser in &decision.losers {
                if *loser == decision.winner {
                    return Err(StoreError::Corrupt(
                        "resolution lists its winner as a loser".to_string(),
                    ));
                }
                winner_of.insert(*loser, decision.winner);
            }
        }

        let mut target = HashMap::new();
        for (id, record) in &state.records {
            if winner_of.contains_key(id) {
                continue;
            }
            let mut record = record.clone();
            for (loser, winner) in &winner_of {
                record.rewrite_reference(*loser, *winner);
            }
            target.insert(*id, record);
        }
        Ok(target)
    }

    /// Converge the log onto `target`: diff against currently-reconstructed
    /// local state, emit the minimal Add/Update/Remove set, then delete the
    /// lock and all conflict artifacts. Consumes the leader token.
    pub fn commit(
        self,
        _token: LeaderToken,
        password: &str,
        target: &HashMap<Uuid, Record>,
        losers: &HashSet<Uuid>,
    ) -> Result<CommitSummary> {
        let local = reconstruct_state(self.log, password)?;
        let mut summary = CommitSummary::default();

        let mut target_ids: Vec<Uuid> = target.keys().copied().collect();
        target_ids.sort();
        for id in target_ids {
            let record = &target[&id];
            let new_text = record.to_canonical_json()?;
            let old_text = match local.get(&id) {
                Some(existing) => existing.to_canonical_json()?,
                None => String::new(),
            };
            if old_text == new_text {
                continue;
            }
            let ciphertext = crypto::encrypt(
                delta::make_patch(&old_text, &new_text).as_bytes(),
                password,
            )?;
            if local.contains_key(&id) {
                self.log
                    .append(EventAction::Update, id, Some(&ciphertext))?;
                summary.updated += 1;
            } else {
                self.log.append(EventAction::Add, id, Some(&ciphertext))?;
                summary.added += 1;
            }
        }

        // Remove everything that must die: records live locally but absent
        // from the target, plus every loser — other devices may consider a
        // loser live even when this one never did.
        let mut removals: Vec<Uuid> = local
            .keys()
            .filter(|id| !target.contains_key(id))
            .copied()
            .chain(losers.iter().copied())
            .collect();
        removals.sort();
        removals.dedup();
        for id in removals {
            self.log.append(EventAction::Remove, id, None)?;
            summary.removed += 1;
        }

        for artifact in self.detect()? {
            match fs::remove_file(&artifact) {
                Ok(()) => summary.artifacts_deleted += 1,
                Err(e) => warn!(path = %artifact.display(), error = %e, "cannot delete conflict artifact"),
            }
        }
        self.release()?;
        info!(
            added = summary.added,
            updated = summary.updated,
            removed = summary.removed,
            artifacts = summary.artifacts_deleted,
            "conflict resolution committed"
        );
        Ok(summary)
    }
}

/// Read-only event view merging the normal log with conflict-marked copies.
/// Each logical filename appears once; when both the original and a conflict
/// copy exist, the original wins.
struct UnionSource<'a> {
    log: &'a DirEventLog,
}

impl UnionSource<'_> {
    /// Map logical name → actual path for one directory.
    fn logical_entries(dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
        let mut originals: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut conflicts: BTreeMap<String, PathBuf> = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            match strip_conflict_marker(&name) {
                Some(logical) => {
                    conflicts.entry(logical).or_insert_with(|| entry.path());
                }
                None => {
                    originals.insert(name, entry.path());
                }
            }
        }
        for (logical, path) in conflicts {
            originals.entry(logical).or_insert(path);
        }
        Ok(originals)
    }
}

impl EventSource for UnionSource<'_> {
    fn manifest_events(&self) -> Result<Vec<ManifestEvent>> {
        let mut events = Vec::new();
        for (logical, path) in Self::logical_entries(self.log.history_dir())? {
            let Some((ts, id)) = parse_manifest_file_name(&logical) else {
                continue;
            };
            if let Some(event) = read_manifest_file(&path, ts, id) {
                events.push(event);
            }
        }
        events.sort_by(|a, b| (a.timestamp, a.record_id).cmp(&(b.timestamp, b.record_id)));
        Ok(events)
    }

    fn content_events(&self, record_id: Uuid) -> Result<Vec<ContentEvent>> {
        let mut events = Vec::new();
        for (logical, path) in Self::logical_entries(self.log.root())? {
            let Some((ts, id)) = parse_patch_file_name(&logical) else {
                continue;
            };
            if id != record_id {
                continue;
            }
            events.push(ContentEvent {
                record_id,
                timestamp: ts,
                ciphertext: fs::read(&path)?,
            });
        }
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}
