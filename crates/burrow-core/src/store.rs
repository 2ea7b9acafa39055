//! The `ConfigStore` facade — the only surface the application layer talks
//! to. Owns the unlock/lock lifecycle, the store-wide write lock, the
//! incrementally-maintained in-memory state and the plaintext display index.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto;
use crate::delta;
use crate::error::{Result, StoreError};
use crate::event::{EventAction, PATCH_SUFFIX};
use crate::fsutil::{fsync_dir, write_atomic};
use crate::history::{self, VersionEntry};
use crate::log::{DirEventLog, EventLog};
use crate::reconstruct::reconstruct_state;
use crate::record::{CredentialFields, Record, RecordBody, RecordKind};
use crate::resolver::{
    CollisionGroup, CommitSummary, ConflictResolver, LeaderToken, Resolution, UnifiedState,
};

pub const VERIFICATION_FILE: &str = "verification.dat";
pub const RECOVERY_FILE: &str = "recovery.dat";
pub const INDEX_FILE: &str = "_index.json";

const REKEY_DIR: &str = ".rekey";
const REKEY_COMMIT_MARKER: &str = "COMMIT";

#[derive(Debug)]
pub enum UnlockOutcome {
    /// Existing store unlocked.
    Unlocked,
    /// First run: the store was created. The recovery key is shown exactly
    /// once and never stored in the clear.
    Created { recovery_key: String },
}

/// One row of the plaintext display index. Advisory only: the UI may list
/// names without unlocking, but the event log is the authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    pub kind: RecordKind,
}

struct Inner {
    password: Option<Zeroizing<String>>,
    state: HashMap<Uuid, Record>,
}

pub struct ConfigStore {
    device_id: String,
    log: DirEventLog,
    inner: Mutex<Inner>,
}

impl ConfigStore {
    /// Open (or lay out) a store rooted at the synchronized folder. Finishes
    /// any password re-encryption that was interrupted mid-publish.
    pub fn open(root: impl AsRef<Path>, device_id: impl Into<String>) -> Result<Self> {
        let log = DirEventLog::open(root)?;
        Self::resume_rekey(log.root())?;
        Ok(Self {
            device_id: device_id.into(),
            log,
            inner: Mutex::new(Inner {
                password: None,
                state: HashMap::new(),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        self.log.root()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_configured(&self) -> bool {
        self.log.root().join(VERIFICATION_FILE).exists()
    }

    pub fn is_unlocked(&self) -> bool {
        self.inner.lock().password.is_some()
    }

    /// Unlock with the master password. On first run this creates the store:
    /// verification and recovery blobs are written and the fresh recovery
    /// key is returned to be shown to the user.
    pub fn unlock(&self, password: &str) -> Result<UnlockOutcome> {
        let mut inner = self.inner.lock();
        let verification_path = self.log.root().join(VERIFICATION_FILE);

        if !verification_path.exists() {
            info!("first-time setup: creating verification and recovery blobs");
            let verification = crypto::encrypt(crypto::VERIFICATION_PLAINTEXT, password)?;
            write_atomic(self.log.staging_dir(), &verification_path, &verification)?;

            let recovery_key = crypto::generate_recovery_key();
            let recovery_blob = crypto::encrypt(recovery_key.as_bytes(), password)?;
            write_atomic(
                self.log.staging_dir(),
                &self.log.root().join(RECOVERY_FILE),
                &recovery_blob,
            )?;

            inner.password = Some(Zeroizing::new(password.to_string()));
            inner.state = reconstruct_state(&self.log, password)?;
            return Ok(UnlockOutcome::Created { recovery_key });
        }

        let verification = fs::read(&verification_path)?;
        crypto::verify_password(&verification, password)?;
        inner.state = reconstruct_state(&self.log, password)?;
        inner.password = Some(Zeroizing::new(password.to_string()));
        info!(records = inner.state.len(), "store unlocked");
        Ok(UnlockOutcome::Unlocked)
    }

    /// Drop key material and reconstructed state.
    pub fn lock(&self) {
        let mut inner = self.inner.lock();
        inner.password = None;
        inner.state.clear();
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn get_record(&self, id: Uuid) -> Option<Record> {
        self.inner.lock().state.get(&id).cloned()
    }

    pub fn records(&self) -> Vec<Record> {
        let inner = self.inner.lock();
        let mut records: Vec<Record> = inner.state.values().cloned().collect();
        records.sort_by_key(|r| (r.display_name().to_lowercase(), r.id));
        records
    }

    pub fn list_by_kind(&self, kind: RecordKind) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|r| r.kind() == kind)
            .collect()
    }

    /// The singleton automation credentials record, if configured.
    pub fn automation_credentials(&self) -> Option<Record> {
        self.list_by_kind(RecordKind::AutomationCredentials)
            .into_iter()
            .next()
    }

    pub fn list_versions(&self, record_id: Uuid) -> Result<Vec<VersionEntry>> {
        history::list_versions(&self.log, record_id)
    }

    pub fn content_at(&self, record_id: Uuid, as_of: DateTime<Utc>) -> Result<String> {
        let password = self.require_password()?;
        history::content_at(&self.log, &password, record_id, as_of)
    }

    // ── Mutations ───────────────────────────────────────────────────────────

    /// Create a record: assign an id, emit an Add event plus the full-content
    /// patch against the empty string.
    pub fn add(&self, body: RecordBody) -> Result<Uuid> {
        let mut inner = self.inner.lock();
        let password = Self::password_of(&inner)?;
        self.ensure_no_pending_conflict()?;

        let record = Record::new(Uuid::new_v4(), body);
        let text = record.to_canonical_json()?;
        let patch = delta::make_patch("", &text);
        let ciphertext = crypto::encrypt(patch.as_bytes(), &password)?;
        self.log
            .append(EventAction::Add, record.id, Some(&ciphertext))?;

        let id = record.id;
        inner.state.insert(id, record);
        self.write_index(&inner.state);
        Ok(id)
    }

    /// Replace a record's fields: emit an Update event carrying the delta
    /// against the last known serialisation. Unchanged content is a no-op.
    pub fn update(&self, id: Uuid, body: RecordBody) -> Result<()> {
        let mut inner = self.inner.lock();
        let password = Self::password_of(&inner)?;
        self.ensure_no_pending_conflict()?;

        let old = inner.state.get(&id).ok_or(StoreError::NotFound(id))?;
        let old_text = old.to_canonical_json()?;
        let record = Record::new(id, body);
        let new_text = record.to_canonical_json()?;
        if old_text == new_text {
            return Ok(());
        }
        let patch = delta::make_patch(&old_text, &new_text);
        let ciphertext = crypto::encrypt(patch.as_bytes(), &password)?;
        self.log
            .append(EventAction::Update, id, Some(&ciphertext))?;

        inner.state.insert(id, record);
        self.write_index(&inner.state);
        Ok(())
    }

    /// Delete a record: emit a Remove event. The id is never reused and its
    /// full event history survives for audit.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::password_of(&inner)?;
        self.ensure_no_pending_conflict()?;

        if !inner.state.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        self.log.append(EventAction::Remove, id, None)?;
        inner.state.remove(&id);
        self.write_index(&inner.state);
        Ok(())
    }

    /// Upsert the singleton automation credentials record.
    pub fn set_automation_credentials(
        &self,
        ssh_private_key_path: impl Into<String>,
        ssh_public_key_path: impl Into<String>,
    ) -> Result<Uuid> {
        let body = RecordBody::AutomationCredentials(CredentialFields {
            ssh_private_key_path: ssh_private_key_path.into(),
            ssh_public_key_path: ssh_public_key_path.into(),
            extra: BTreeMap::new(),
        });
        match self.automation_credentials() {
            Some(existing) => {
                self.update(existing.id, body)?;
                Ok(existing.id)
            }
            None => self.add(body),
        }
    }

    /// Throw away the in-memory map and replay the full log — cold start or
    /// after the synchronizer delivered new events.
    pub fn reload(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let password = Self::password_of(&inner)?;
        inner.state = reconstruct_state(&self.log, &password)?;
        Ok(())
    }

    // ── Password lifecycle ──────────────────────────────────────────────────

    /// Decrypt and return the recovery key (unlocked stores only).
    pub fn recovery_key(&self) -> Result<String> {
        let password = self.require_password()?;
        let path = self.log.root().join(RECOVERY_FILE);
        if !path.exists() {
            return Err(StoreError::Corrupt("recovery key blob missing".to_string()));
        }
        let blob = fs::read(&path)?;
        let plaintext = crypto::decrypt(&blob, &password)?;
        String::from_utf8(plaintext.to_vec())
            .map_err(|_| StoreError::Corrupt("recovery key is not valid UTF-8".to_string()))
    }

    /// Change the master password. All-or-nothing: every encrypted file is
    /// re-encrypted into a staging directory and published only after the
    /// complete set exists; a crash at any point leaves the store
    /// decryptable under exactly one of the two passwords.
    pub fn change_password(&self, old_password: &str, new_password: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        self.ensure_no_pending_conflict()?;

        let verification = fs::read(self.log.root().join(VERIFICATION_FILE))?;
        crypto::verify_password(&verification, old_password)?;

        self.staged_rekey(old_password, new_password)?;

        if inner.password.is_some() {
            inner.password = Some(Zeroizing::new(new_password.to_string()));
        }
        info!("master password changed");
        Ok(())
    }

    // ── Conflict surface ────────────────────────────────────────────────────

    fn resolver(&self) -> ConflictResolver<'_> {
        ConflictResolver::new(&self.log, self.device_id.clone())
    }

    /// The device currently claiming a resolution, if any.
    pub fn pending_conflict(&self) -> Result<Option<String>> {
        Ok(self.resolver().lock_holder()?.map(|c| c.device_id))
    }

    /// Conflict-marked artifacts left behind by the file synchronizer.
    pub fn detect_conflicts(&self) -> Result<Vec<PathBuf>> {
        self.resolver().detect()
    }

    /// Run the election (claim, propagation wait, confirm) and reconstruct
    /// the unified candidate state. Returns a session the caller completes
    /// once winners have been chosen for every collision group.
    pub fn begin_resolution(&self, window: Duration) -> Result<ResolutionSession<'_>> {
        let password = self.require_password()?;
        let resolver = self.resolver();
        let token = resolver.elect(window)?;
        let state = resolver.unified_state(&token, &password)?;
        Ok(ResolutionSession {
            store: self,
            token,
            state,
        })
    }

    fn ensure_no_pending_conflict(&self) -> Result<()> {
        if let Some(claim) = self.resolver().lock_holder()? {
            return Err(StoreError::ConflictPending {
                holder: claim.device_id,
            });
        }
        Ok(())
    }

    // ── Display index ───────────────────────────────────────────────────────

    /// Regenerate `_index.json` from live state.
    pub fn rebuild_index(&self) -> Result<()> {
        let inner = self.inner.lock();
        Self::password_of(&inner)?;
        self.write_index(&inner.state);
        Ok(())
    }

    /// Read the plaintext index without unlocking. Advisory: may lag the log.
    pub fn display_index(&self) -> Result<BTreeMap<Uuid, IndexEntry>> {
        let path = self.log.root().join(INDEX_FILE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let bytes = fs::read(&path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupt(format!("unreadable display index: {e}")))
    }

    fn write_index(&self, state: &HashMap<Uuid, Record>) {
        let index: BTreeMap<Uuid, IndexEntry> = state
            .values()
            .map(|r| {
                (
                    r.id,
                    IndexEntry {
                        name: r.display_name(),
                        kind: r.kind(),
                    },
                )
            })
            .collect();
        let path = self.log.root().join(INDEX_FILE);
        match serde_json::to_vec_pretty(&index) {
            Ok(bytes) => {
                if let Err(e) = fs::write(&path, bytes) {
                    warn!(error = %e, "cannot write display index");
                }
            }
            Err(e) => warn!(error = %e, "cannot serialise display index"),
        }
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn password_of(inner: &Inner) -> Result<Zeroizing<String>> {
        inner.password.clone().ok_or(StoreError::Locked)
    }

    fn require_password(&self) -> Result<Zeroizing<String>> {
        Self::password_of(&self.inner.lock())
    }

    fn staged_rekey(&self, old_password: &str, new_password: &str) -> Result<()> {
        let root = self.log.root();
        let staging = root.join(REKEY_DIR);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let mut names = vec![VERIFICATION_FILE.to_string(), RECOVERY_FILE.to_string()];
        names.extend(self.log.all_patch_names()?);

        for name in &names {
            let path = root.join(name);
            if !path.exists() {
                continue;
            }
            let blob = fs::read(&path)?;
            let rewrapped = match crypto::re_encrypt(&blob, old_password, new_password) {
                Ok(rewrapped) => rewrapped,
                // A patch that was already undecryptable stays as it is:
                // skipping it from the staged set would silently drop the
                // file, and it is no less readable under either password.
                Err(StoreError::AuthFailure | StoreError::Corrupt(_))
                    if name.ends_with(PATCH_SUFFIX) =>
                {
                    warn!(file = %name, "patch cannot be re-encrypted, carrying original bytes");
                    blob
                }
                Err(e) => return Err(e),
            };
            let staged = staging.join(name);
            let mut file = File::create(&staged)?;
            file.write_all(&rewrapped)?;
            file.sync_all()?;
        }
        fsync_dir(&staging)?;

        // The marker is the commit point: from here on the staged set is
        // authoritative and publication can be resumed after a crash.
        let marker = File::create(staging.join(REKEY_COMMIT_MARKER))?;
        marker.sync_all()?;
        fsync_dir(&staging)?;

        Self::publish_rekey(root)
    }

    fn publish_rekey(root: &Path) -> Result<()> {
        let staging = root.join(REKEY_DIR);
        for entry in fs::read_dir(&staging)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == REKEY_COMMIT_MARKER {
                continue;
            }
            fs::rename(entry.path(), root.join(&name))?;
        }
        fsync_dir(root)?;
        fs::remove_file(staging.join(REKEY_COMMIT_MARKER))?;
        fs::remove_dir_all(&staging)?;
        Ok(())
    }

    fn resume_rekey(root: &Path) -> Result<()> {
        let staging = root.join(REKEY_DIR);
        if !staging.exists() {
            return Ok(());
        }
        if staging.join(REKEY_COMMIT_MARKER).exists() {
            info!("resuming interrupted password re-encryption");
            Self::publish_rekey(root)
        } else {
            warn!("discarding abandoned password re-encryption staging");
            Ok(fs::remove_dir_all(&staging)?)
        }
    }
}

/// A suspended conflict resolution: leadership is confirmed and the unified
/// state is built; the caller picks winners, then completes (or aborts).
pub struct ResolutionSession<'a> {
    store: &'a ConfigStore,
    token: LeaderToken,
    state: UnifiedState,
}

impl ResolutionSession<'_> {
    /// Natural-key collisions that need a decision. May be empty: pure
    /// file-level conflicts resolve without any human input.
    pub fn collision_groups(&self) -> Vec<CollisionGroup> {
        ConflictResolver::collision_groups(&self.state)
    }

    pub fn unified_records(&self) -> &HashMap<Uuid, Record> {
        &self.state.records
    }

    /// Apply the decisions, converge the log, delete conflict artifacts and
    /// the lock, then reload local state.
    pub fn complete(self, decisions: &[Resolution]) -> Result<CommitSummary> {
        let password = self.store.require_password()?;
        let target = ConflictResolver::resolve_target(&self.state, decisions)?;
        let losers: HashSet<Uuid> = decisions
            .iter()
            .flat_map(|d| d.losers.iter().copied())
            .collect();
        let summary = self
            .store
            .resolver()
            .commit(self.token, &password, &target, &losers)?;
        self.store.reload()?;
        self.store.rebuild_index()?;
        Ok(summary)
    }

    /// Walk away without emitting anything; drops this device's claim.
    pub fn abort(self) -> Result<()> {
        self.store.resolver().release()
    }
}
