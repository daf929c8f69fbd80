//! Secure Attachments - Key Management
//!
//! Attachment keys are 64 bytes: an AES-256 key followed by an HMAC-SHA256 key.

use std::fmt;

use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{AttachmentError, AttachmentResult};

/// AES-256 key length
pub const AES_KEY_LEN: usize = 32;

/// HMAC-SHA256 key length
pub const HMAC_KEY_LEN: usize = 32;

/// Combined attachment key length
pub const KEY_LEN: usize = AES_KEY_LEN + HMAC_KEY_LEN;

/// IV length for AES-CTR
pub const IV_LEN: usize = 16;

/// HKDF contexts for key derivation
pub mod contexts {
    /// Prefix of the info string for backup media outer-layer keys
    pub const BACKUP_MEDIA: &[u8] = b"ATTACHMENTS:BACKUP:MEDIA:v1:";
}

/// Symmetric attachment key, zeroized on drop
#[derive(Clone)]
pub struct AttachmentKey {
    inner: Zeroizing<[u8; KEY_LEN]>,
}

impl AttachmentKey {
    /// Create a key from raw bytes
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            inner: Zeroizing::new(bytes),
        }
    }

    /// Create a key from a slice, checking its length
    pub fn from_slice(bytes: &[u8]) -> AttachmentResult<Self> {
        if bytes.len() != KEY_LEN {
            return Err(AttachmentError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: bytes.len(),
            });
        }
        let mut inner = Zeroizing::new([0u8; KEY_LEN]);
        inner.copy_from_slice(bytes);
        Ok(Self { inner })
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut inner = Zeroizing::new([0u8; KEY_LEN]);
        rand::thread_rng().fill_bytes(&mut *inner);
        Self { inner }
    }

    /// Expose the key bytes (use with caution)
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        &self.inner
    }

    /// AES-256 half of the key
    pub fn aes_key(&self) -> &[u8] {
        &self.inner[..AES_KEY_LEN]
    }

    /// HMAC-SHA256 half of the key
    pub fn hmac_key(&self) -> &[u8] {
        &self.inner[AES_KEY_LEN..]
    }
}

impl PartialEq for AttachmentKey {
    fn eq(&self, other: &Self) -> bool {
        // Constant-time comparison
        self.inner
            .iter()
            .zip(other.inner.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for AttachmentKey {}

impl fmt::Debug for AttachmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Derive the outer-layer key of a backup media object using HKDF-SHA256
pub fn derive_backup_media_key(
    media_root_key: &[u8; 32],
    media_id: &[u8],
) -> AttachmentResult<AttachmentKey> {
    let hk = Hkdf::<Sha256>::new(None, media_root_key);

    let mut info = Vec::with_capacity(contexts::BACKUP_MEDIA.len() + media_id.len());
    info.extend_from_slice(contexts::BACKUP_MEDIA);
    info.extend_from_slice(media_id);

    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(&info, &mut *okm)
        .map_err(|e| AttachmentError::KeyDerivationFailed(e.to_string()))?;

    Ok(AttachmentKey { inner: okm })
}

/// Generate a random IV for AES-CTR
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}
