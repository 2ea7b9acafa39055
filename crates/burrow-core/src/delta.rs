//! Textual delta codec for record versions.
//!
//! Every Add/Update event stores a unified diff between the previous and the
//! new JSON serialisation of a record. Current state is the fold of those
//! patches seeded from the empty string, so `make_patch("", text)` is the
//! ordinary create case.

use diffy::Patch;

use crate::error::{Result, StoreError};

/// Produce a unified-diff patch transforming `old` into `new`.
pub fn make_patch(old: &str, new: &str) -> String {
    diffy::create_patch(old, new).to_string()
}

/// Apply a serialised patch to `base`.
///
/// Both a malformed patch and a patch that does not fit `base` come back as
/// `Corrupt`: records are independent, so the caller logs the failure and
/// skips that record instead of aborting reconstruction.
pub fn apply_patch(patch_text: &str, base: &str) -> Result<String> {
    let patch = Patch::from_str(patch_text)
        .map_err(|e| StoreError::Corrupt(format!("malformed patch: {e}")))?;
    diffy::apply(base, &patch)
        .map_err(|e| StoreError::Corrupt(format!("patch does not apply to base: {e}")))
}
