//! Secure Attachments - Attachment Store & Orphan Ledger
//!
//! SQLite-backed dedup lookup and crash-safe staging ledger.

use std::path::Path;

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::attachment::{OrphanedAttachmentRecord, PendingAttachment};
use crate::crypto::AttachmentKey;
use crate::error::{AttachmentError, AttachmentResult};
use crate::input::ContentHash;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS attachments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_hash BLOB NOT NULL UNIQUE,
    encryption_key BLOB NOT NULL,
    digest BLOB NOT NULL,
    local_relative_file_path TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    content_type TEXT NOT NULL,
    rendering_flag TEXT NOT NULL,
    source_filename TEXT,
    blurhash TEXT,
    unencrypted_byte_count INTEGER NOT NULL,
    encrypted_byte_count INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS orphaned_attachment_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    local_relative_file_path TEXT,
    waveform_relative_path TEXT,
    still_frame_relative_path TEXT,
    is_pending INTEGER NOT NULL DEFAULT 1,
    inserted_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orphans_pending ON orphaned_attachment_files(is_pending);
"#;

/// Point lookups against stored attachments
pub trait AttachmentStore: Send + Sync {
    /// Key of the stored attachment with this plaintext hash, if any
    fn encryption_key_for_content_hash(
        &self,
        content_hash: &ContentHash,
    ) -> AttachmentResult<Option<AttachmentKey>>;
}

/// Durable record of files about to be moved into permanent storage
pub trait OrphanLedger: Send + Sync {
    /// Insert a pending row, returning its id. Must be durable on return.
    fn commit_pending(&self, record: &OrphanedAttachmentRecord) -> AttachmentResult<i64>;
}

/// What committing a pending attachment did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// New attachment row
    Inserted(i64),
    /// Content already stored; the pending files were released
    Deduplicated(i64),
}

impl CommitOutcome {
    pub fn attachment_id(&self) -> i64 {
        match self {
            CommitOutcome::Inserted(id) | CommitOutcome::Deduplicated(id) => *id,
        }
    }
}

/// A ledger row with its insertion time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub record: OrphanedAttachmentRecord,
    pub inserted_at: DateTime<Utc>,
}

/// SQLite attachment store
pub struct SqliteAttachmentStore {
    conn: Mutex<Connection>,
}

impl SqliteAttachmentStore {
    /// Open (or create) a store at `path`
    pub fn open(path: &Path) -> AttachmentResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    /// Store that lives only as long as the value
    pub fn open_in_memory() -> AttachmentResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> AttachmentResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn record_from_row(row: &Row<'_>) -> rusqlite::Result<(OrphanedAttachmentRecord, String)> {
        Ok((
            OrphanedAttachmentRecord {
                id: Some(row.get(0)?),
                local_relative_file_path: row.get(1)?,
                waveform_relative_path: row.get(2)?,
                still_frame_relative_path: row.get(3)?,
                is_pending: row.get(4)?,
            },
            row.get(5)?,
        ))
    }

    fn entry(
        record: OrphanedAttachmentRecord,
        inserted_at: String,
    ) -> AttachmentResult<LedgerEntry> {
        let inserted_at = DateTime::parse_from_rfc3339(&inserted_at)
            .map_err(|e| AttachmentError::DatabaseError(format!("bad ledger timestamp: {}", e)))?
            .with_timezone(&Utc);
        Ok(LedgerEntry {
            record,
            inserted_at,
        })
    }

    /// Make a pending attachment permanent and retire its ledger row in the
    /// same transaction.
    ///
    /// When the content hash is already stored, the new files are released
    /// to the reclaimer and the existing row is returned.
    pub fn commit_attachment(
        &self,
        pending: &PendingAttachment,
    ) -> AttachmentResult<CommitOutcome> {
        let content_type = serde_json::to_string(&pending.content_type)?;
        let rendering_flag = serde_json::to_string(&pending.rendering_flag)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM attachments WHERE content_hash = ?1",
                params![&pending.content_hash.as_bytes()[..]],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match existing {
            Some(id) => {
                let released = tx.execute(
                    "UPDATE orphaned_attachment_files SET is_pending = 0 WHERE id = ?1",
                    params![pending.orphan_record_id],
                )?;
                if released == 0 {
                    return Err(AttachmentError::OrphanNotFound(pending.orphan_record_id));
                }
                CommitOutcome::Deduplicated(id)
            }
            None => {
                tx.execute(
                    "INSERT INTO attachments (
                        content_hash, encryption_key, digest, local_relative_file_path,
                        mime_type, content_type, rendering_flag, source_filename, blurhash,
                        unencrypted_byte_count, encrypted_byte_count, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        &pending.content_hash.as_bytes()[..],
                        &pending.encryption_key.expose()[..],
                        &pending.digest[..],
                        pending.local_relative_file_path,
                        pending.mime_type,
                        content_type,
                        rendering_flag,
                        pending.source_filename,
                        pending.blurhash,
                        pending.unencrypted_byte_count as i64,
                        pending.encrypted_byte_count as i64,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                let id = tx.last_insert_rowid();

                let cleared = tx.execute(
                    "DELETE FROM orphaned_attachment_files WHERE id = ?1",
                    params![pending.orphan_record_id],
                )?;
                if cleared == 0 {
                    return Err(AttachmentError::OrphanNotFound(pending.orphan_record_id));
                }
                CommitOutcome::Inserted(id)
            }
        };

        tx.commit()?;
        info!("Committed attachment {:?} ({})", outcome, pending.content_hash);
        Ok(outcome)
    }

    /// Hand a row's files to the reclaimer
    pub fn release_orphan(&self, id: i64) -> AttachmentResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE orphaned_attachment_files SET is_pending = 0 WHERE id = ?1",
            params![id],
        )?;
        if updated == 0 {
            return Err(AttachmentError::OrphanNotFound(id));
        }
        Ok(())
    }

    /// Delete a ledger row once its files are referenced elsewhere or gone
    pub fn clear_orphan(&self, id: i64) -> AttachmentResult<()> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM orphaned_attachment_files WHERE id = ?1",
            params![id],
        )?;
        if deleted == 0 {
            return Err(AttachmentError::OrphanNotFound(id));
        }
        Ok(())
    }

    /// One ledger row
    pub fn orphan(&self, id: i64) -> AttachmentResult<Option<LedgerEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, local_relative_file_path, waveform_relative_path,
                        still_frame_relative_path, is_pending, inserted_at
                 FROM orphaned_attachment_files WHERE id = ?1",
                params![id],
                Self::record_from_row,
            )
            .optional()?;
        row.map(|(record, inserted_at)| Self::entry(record, inserted_at))
            .transpose()
    }

    /// All ledger rows, oldest first
    pub fn ledger_entries(&self) -> AttachmentResult<Vec<LedgerEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, local_relative_file_path, waveform_relative_path,
                    still_frame_relative_path, is_pending, inserted_at
             FROM orphaned_attachment_files ORDER BY id",
        )?;
        let rows = stmt.query_map([], Self::record_from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            let (record, inserted_at) = row?;
            entries.push(Self::entry(record, inserted_at)?);
        }
        Ok(entries)
    }

    /// Rows still marked pending
    pub fn pending_orphans(&self) -> AttachmentResult<Vec<OrphanedAttachmentRecord>> {
        Ok(self
            .ledger_entries()?
            .into_iter()
            .filter(|entry| entry.record.is_pending)
            .map(|entry| entry.record)
            .collect())
    }

    /// Number of stored attachments
    pub fn attachment_count(&self) -> AttachmentResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM attachments", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl AttachmentStore for SqliteAttachmentStore {
    fn encryption_key_for_content_hash(
        &self,
        content_hash: &ContentHash,
    ) -> AttachmentResult<Option<AttachmentKey>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let key: Option<Vec<u8>> = tx
            .query_row(
                "SELECT encryption_key FROM attachments WHERE content_hash = ?1",
                params![&content_hash.as_bytes()[..]],
                |row| row.get(0),
            )
            .optional()?;
        tx.commit()?;

        key.map(|bytes| AttachmentKey::from_slice(&bytes)).transpose()
    }
}

impl OrphanLedger for SqliteAttachmentStore {
    fn commit_pending(&self, record: &OrphanedAttachmentRecord) -> AttachmentResult<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO orphaned_attachment_files (
                local_relative_file_path, waveform_relative_path,
                still_frame_relative_path, is_pending, inserted_at
            ) VALUES (?1, ?2, ?3, 1, ?4)",
            params![
                record.local_relative_file_path,
                record.waveform_relative_path,
                record.still_frame_relative_path,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        debug!("Ledger row {} names {:?}", id, record.relative_paths());
        Ok(id)
    }
}
