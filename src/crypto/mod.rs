//! Secure Attachments - Cryptographic Core
//!
//! Attachment keys, the streaming attachment cipher and backup key derivation.

pub mod keys;
pub mod cipher;

pub use keys::*;
pub use cipher::*;
