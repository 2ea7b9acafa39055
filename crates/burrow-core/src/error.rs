use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Authentication failed: wrong master password or tampered ciphertext")]
    AuthFailure,

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("AEAD encryption failed")]
    Encrypt,

    #[error("Store is locked — unlock with the master password first")]
    Locked,

    #[error("Record not found: {0}")]
    NotFound(Uuid),

    #[error("A conflict resolution is pending (claimed by device {holder}); retry once it completes")]
    ConflictPending { holder: String },

    #[error("Leader election lost to device {holder}; defer and poll again later")]
    LockContention { holder: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
