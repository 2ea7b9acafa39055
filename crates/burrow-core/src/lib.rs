//! burrow-core — encrypted event-sourced configuration store for the Burrow
//! tunnel manager.
//!
//! # Storage model
//! State is never stored directly. Every mutation appends an event: a small
//! plaintext manifest (add/update/remove + timestamp) under `history/` and,
//! for add/update, an encrypted unified-diff patch at the store root.
//! Current state is the replay of that log; any past state is the replay up
//! to a cutoff.
//!
//! # Multi-device model
//! The store root is mirrored by an external file synchronizer that knows
//! nothing about events. Append-only files keyed by unique ids mean most
//! concurrent activity merges by accumulation; file-level conflict copies
//! and natural-key collisions are reconciled by `resolver` behind a
//! best-effort lock-file election.
//!
//! # Encryption
//! Everything sensitive is encrypted with XChaCha20-Poly1305 under a key
//! derived from the master password (PBKDF2-HMAC-SHA256, per-blob salt).
//! The password itself is authenticated against a known-plaintext
//! verification blob and never stored.

pub mod crypto;
pub mod delta;
pub mod error;
pub mod event;
mod fsutil;
pub mod history;
pub mod log;
pub mod paths;
pub mod reconstruct;
pub mod record;
pub mod resolver;
pub mod store;

pub use error::{Result, StoreError};
pub use event::{EventAction, ManifestEvent};
pub use history::VersionEntry;
pub use log::{DirEventLog, EventLog, EventSource};
pub use record::{Record, RecordBody, RecordKind};
pub use resolver::{CollisionGroup, CommitSummary, ConflictResolver, Resolution};
pub use store::{ConfigStore, ResolutionSession, UnlockOutcome};
