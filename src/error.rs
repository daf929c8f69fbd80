//! Secure Attachments - Error Types

use thiserror::Error;

use crate::media::asset::AssetError;

/// Result type for pipeline operations
pub type AttachmentResult<T> = Result<T, AttachmentError>;

/// Pipeline error types
#[derive(Error, Debug)]
pub enum AttachmentError {
    // ═══════════════════════════════════════════════════════════════
    // CRYPTO ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("HMAC verification failed - ciphertext corrupted or wrong key")]
    HmacVerificationFailed,

    // ═══════════════════════════════════════════════════════════════
    // INTEGRITY ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    // ═══════════════════════════════════════════════════════════════
    // MEDIA ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Media asset error: {0}")]
    Asset(#[from] AssetError),

    #[error("Image processing error: {0}")]
    ImageError(String),

    #[error("Unsupported source for {operation}: {reason}")]
    UnsupportedSource { operation: &'static str, reason: String },

    // ═══════════════════════════════════════════════════════════════
    // STORAGE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Orphan record not found: {0}")]
    OrphanNotFound(i64),

    #[error("Invalid relative path: {0}")]
    InvalidRelativePath(String),

    // ═══════════════════════════════════════════════════════════════
    // SERIALIZATION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AttachmentError {
    /// Integrity failures abort downloaded and restored payloads before any
    /// validation work starts.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            AttachmentError::IntegrityCheckFailed(_)
                | AttachmentError::HmacVerificationFailed
                | AttachmentError::DecryptionFailed(_)
        )
    }

    /// Check if this is an underlying storage failure
    pub fn is_io(&self) -> bool {
        match self {
            AttachmentError::IoError(_) => true,
            AttachmentError::Asset(AssetError::Io(_)) => true,
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for AttachmentError {
    fn from(e: rusqlite::Error) -> Self {
        AttachmentError::DatabaseError(e.to_string())
    }
}

impl From<serde_json::Error> for AttachmentError {
    fn from(e: serde_json::Error) -> Self {
        AttachmentError::SerializationError(e.to_string())
    }
}

impl From<bincode::Error> for AttachmentError {
    fn from(e: bincode::Error) -> Self {
        AttachmentError::SerializationError(e.to_string())
    }
}

impl From<image::ImageError> for AttachmentError {
    fn from(e: image::ImageError) -> Self {
        AttachmentError::ImageError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_classification() {
        assert!(AttachmentError::IntegrityCheckFailed("digest".into()).is_integrity_failure());
        assert!(AttachmentError::HmacVerificationFailed.is_integrity_failure());
        assert!(!AttachmentError::DatabaseError("locked".into()).is_integrity_failure());
    }

    #[test]
    fn test_io_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(AttachmentError::from(io).is_io());

        let asset_io = std::io::Error::new(std::io::ErrorKind::NotFound, "ffprobe");
        assert!(AttachmentError::Asset(AssetError::Io(asset_io)).is_io());
        assert!(!AttachmentError::OrphanNotFound(7).is_io());
    }
}
