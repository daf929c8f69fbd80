//! # Secure Attachments
//!
//! Content validation and encryption pipeline for message attachments.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   SECURE ATTACHMENTS                     │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐  │
//! │  │   DIGEST    │  │  CLASSIFIER │  │   VALIDATORS    │  │
//! │  │   SHA-256   │  │  MIME → kind│  │  image/video/   │  │
//! │  │             │  │             │  │  audio          │  │
//! │  └──────┬──────┘  └──────┬──────┘  └────────┬────────┘  │
//! │         │                │                   │           │
//! │  ┌──────┴────────────────┴───────────────────┴────────┐ │
//! │  │                 ATTACHMENT PIPELINE                 │ │
//! │  │   key reuse → encrypt → ledger commit → move        │ │
//! │  └─────────────────────────────────────────────────────┘ │
//! │                                                          │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐  │
//! │  │  AES-CTR +  │  │  ORPHAN     │  │  RECLAIMER      │  │
//! │  │  HMAC-SHA256│  │  LEDGER     │  │  + SCRATCH SWEEP│  │
//! │  └─────────────┘  └─────────────┘  └─────────────────┘  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - Every stored file is IV ‖ AES-256-CTR ‖ HMAC-SHA256
//! - Identical plaintext reuses the stored key
//! - Downloads and backups are verified before anything is written
//! - Plaintext only touches disk as self-deleting scratch files
//! - A ledger row names every file before it reaches permanent storage

pub mod attachment;
pub mod config;
pub mod content_type;
pub mod crypto;
pub mod digest;
pub mod encryption;
pub mod error;
pub mod input;
pub mod media;
pub mod pipeline;
pub mod storage;
pub mod store;
pub mod text;
pub mod thumbnail;
pub mod validate;

pub use attachment::{
    OrphanedAttachmentRecord, PendingAttachment, RenderingFlag, RevalidatedAttachment,
};
pub use config::PipelineConfig;
pub use content_type::{ContentType, PixelSize};
pub use crypto::AttachmentKey;
pub use error::{AttachmentError, AttachmentResult};
pub use input::{
    AttachmentInput, AttachmentSource, ContentHash, EncryptedFileSource, IntegrityCheck,
};
pub use pipeline::{AttachmentPipeline, DownloadedAttachment, EncryptedLayer, InnerLayer};
pub use storage::{sweep_scratch_dir, AttachmentStorage, OrphanReclaimer};
pub use store::{AttachmentStore, OrphanLedger, SqliteAttachmentStore};
pub use text::{MessageBody, PreparedText};
pub use thumbnail::ThumbnailEngine;

/// Secure Attachments version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
