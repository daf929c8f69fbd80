//! Secure Attachments - Permanent Storage & Reclamation
//!
//! Relative-path file storage, the materializing move, and cleanup of files
//! the orphan ledger says nobody owns.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use log::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::encryption::{StagedFile, SCRATCH_PREFIX};
use crate::error::{AttachmentError, AttachmentResult};
use crate::store::SqliteAttachmentStore;

/// Moves staged files to their permanent relative path
pub trait FileMover: Send + Sync {
    fn move_into_place(&self, staged: StagedFile, relative_path: &str) -> AttachmentResult<()>;
}

/// Permanent attachment storage rooted at one directory
#[derive(Debug, Clone)]
pub struct AttachmentStorage {
    root: PathBuf,
}

impl AttachmentStorage {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// A fresh, unused relative path of the form `ab/abcdef...`
    pub fn reserve_relative_path(&self) -> String {
        let name = Uuid::new_v4().simple().to_string();
        format!("{}/{}", &name[..2], name)
    }

    /// Resolve a relative path under the root, rejecting escapes
    pub fn absolute_path(&self, relative_path: &str) -> AttachmentResult<PathBuf> {
        let relative = Path::new(relative_path);
        let is_plain = !relative_path.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !is_plain {
            return Err(AttachmentError::InvalidRelativePath(relative_path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    pub fn exists(&self, relative_path: &str) -> bool {
        self.absolute_path(relative_path)
            .map(|path| path.exists())
            .unwrap_or(false)
    }

    /// Overwrite then remove a file. Returns whether it existed.
    pub fn delete_file(&self, relative_path: &str) -> AttachmentResult<bool> {
        let path = self.absolute_path(relative_path)?;
        if !path.exists() {
            return Ok(false);
        }

        let size = fs::metadata(&path)?.len() as usize;
        if size > 0 {
            if let Ok(mut file) = OpenOptions::new().write(true).open(&path) {
                let zeros = vec![0u8; size.min(1024 * 1024)];
                let mut remaining = size;
                while remaining > 0 {
                    let to_write = remaining.min(zeros.len());
                    if file.write_all(&zeros[..to_write]).is_err() {
                        break;
                    }
                    remaining -= to_write;
                }
                let _ = file.sync_all();
            }
        }

        fs::remove_file(&path)?;
        Ok(true)
    }
}

impl FileMover for AttachmentStorage {
    fn move_into_place(&self, staged: StagedFile, relative_path: &str) -> AttachmentResult<()> {
        let destination = self.absolute_path(relative_path)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        staged.persist(&destination)?;
        debug!("Materialized {}", relative_path);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RECLAMATION
// ═══════════════════════════════════════════════════════════════════════════

/// Counts from one reclaim pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub rows_cleared: usize,
    pub files_deleted: usize,
}

/// Deletes files named by released ledger rows and by pending rows older
/// than the grace period
pub struct OrphanReclaimer<'a> {
    store: &'a SqliteAttachmentStore,
    storage: &'a AttachmentStorage,
    grace_period: chrono::Duration,
}

impl<'a> OrphanReclaimer<'a> {
    pub fn new(
        store: &'a SqliteAttachmentStore,
        storage: &'a AttachmentStorage,
        grace_period_secs: u64,
    ) -> Self {
        Self {
            store,
            storage,
            grace_period: chrono::Duration::seconds(grace_period_secs.min(i64::MAX as u64) as i64),
        }
    }

    pub fn reclaim(&self) -> AttachmentResult<ReclaimReport> {
        let cutoff = Utc::now() - self.grace_period;
        let mut report = ReclaimReport::default();

        for entry in self.store.ledger_entries()? {
            if entry.record.is_pending && entry.inserted_at > cutoff {
                continue;
            }
            let Some(id) = entry.record.id else { continue };

            for relative_path in entry.record.relative_paths() {
                match self.storage.delete_file(relative_path) {
                    Ok(true) => report.files_deleted += 1,
                    Ok(false) => {}
                    Err(AttachmentError::InvalidRelativePath(path)) => {
                        warn!("Ledger row {} names unusable path {:?}", id, path);
                    }
                    Err(e) => return Err(e),
                }
            }

            self.store.clear_orphan(id)?;
            report.rows_cleared += 1;
        }

        info!(
            "Reclaimed {} ledger rows, {} files",
            report.rows_cleared, report.files_deleted
        );
        Ok(report)
    }
}

/// Remove scratch files older than `max_age` left behind by a crash
pub fn sweep_scratch_dir(scratch_dir: &Path, max_age: Duration) -> AttachmentResult<usize> {
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in WalkDir::new(scratch_dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable scratch entry: {}", e);
                continue;
            }
        };

        let is_scratch = entry
            .file_name()
            .to_str()
            .map_or(false, |name| name.starts_with(SCRATCH_PREFIX));
        if !entry.file_type().is_file() || !is_scratch {
            continue;
        }

        let age = entry
            .metadata()
            .ok()
            .and_then(|metadata| metadata.modified().ok())
            .map(|modified| now.duration_since(modified).unwrap_or(Duration::ZERO));
        if matches!(age, Some(age) if age >= max_age) {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }

    if removed > 0 {
        info!("Swept {} stale scratch files from {}", removed, scratch_dir.display());
    }
    Ok(removed)
}
