//! Secure Attachments - CLI
//!
//! Command-line interface for importing, revalidating and reclaiming
//! attachments.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::{Parser, Subcommand};
use log::info;

use secure_attachments::{
    sweep_scratch_dir, AttachmentInput, AttachmentKey, AttachmentPipeline, AttachmentSource,
    MessageBody, OrphanReclaimer, PendingAttachment, PipelineConfig, PreparedText, RenderingFlag,
    SqliteAttachmentStore,
};

#[derive(Parser)]
#[command(name = "secure-attachments")]
#[command(version = secure_attachments::VERSION)]
#[command(about = "Validate, encrypt and store message attachments")]
struct Cli {
    /// Config file (JSON); defaults are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and encrypt a local file
    Import {
        /// File to import
        path: PathBuf,

        /// Declared MIME type
        #[arg(short, long, default_value = "application/octet-stream")]
        mime: String,

        /// Mark as a voice message
        #[arg(long)]
        voice: bool,
    },

    /// Recompute the content type of a stored ciphertext
    Revalidate {
        /// Encrypted file
        path: PathBuf,

        /// Base64 attachment key
        #[arg(short, long)]
        key: String,

        /// Plaintext byte count
        #[arg(short, long)]
        length: u64,

        /// Declared MIME type
        #[arg(short, long)]
        mime: String,
    },

    /// Prepare a message body, attaching it when oversize
    Text {
        /// File holding the body text
        path: PathBuf,
    },

    /// Delete files named by released or expired ledger rows
    Reclaim {
        /// Override the configured grace period
        #[arg(long)]
        grace_secs: Option<u64>,
    },

    /// Remove stale scratch files
    Sweep {
        /// Minimum age in seconds
        #[arg(long, default_value_t = 3600)]
        max_age_secs: u64,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn print_pending(pending: &PendingAttachment) {
    println!("Content hash:   {}", pending.content_hash);
    println!("Content type:   {}", pending.content_type.name());
    println!("MIME type:      {}", pending.mime_type);
    println!("Stored at:      {}", pending.local_relative_file_path);
    println!("Key:            {}", BASE64.encode(pending.encryption_key.expose()));
    println!("Digest:         {}", hex::encode(pending.digest));
    println!(
        "Size:           {} bytes ({} encrypted)",
        pending.unencrypted_byte_count, pending.encrypted_byte_count
    );
    if let Some(blurhash) = &pending.blurhash {
        println!("Blurhash:       {}", blurhash);
    }
    for path in pending.content_type.derived_relative_paths() {
        println!("Artifact:       {}", path);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let store = Arc::new(
        SqliteAttachmentStore::open(&config.database_path)
            .with_context(|| format!("opening {}", config.database_path.display()))?,
    );

    match cli.command {
        Commands::Import { path, mime, voice } => {
            let pipeline = AttachmentPipeline::new(config, store.clone(), store.clone())?;
            let filename = path.file_name().and_then(|name| name.to_str()).map(str::to_string);
            let input = AttachmentInput::new(AttachmentSource::UnencryptedFile(path.clone()))
                .with_context(|| format!("reading {}", path.display()))?;
            let flag = if voice { RenderingFlag::VoiceMessage } else { RenderingFlag::Default };

            let pending = pipeline.validate_local(input, &mime, flag, filename.as_deref())?;
            let outcome = store.commit_attachment(&pending)?;
            info!("Committed attachment row {}", outcome.attachment_id());
            print_pending(&pending);
        }

        Commands::Revalidate {
            path,
            key,
            length,
            mime,
        } => {
            let key_bytes = BASE64.decode(key.trim()).context("key is not base64")?;
            let key = AttachmentKey::from_slice(&key_bytes)?;
            let pipeline = AttachmentPipeline::new(config, store.clone(), store.clone())?;

            let revalidated = pipeline.revalidate_encrypted(path, key, length, &mime)?;
            println!("Content type:   {}", revalidated.content_type.name());
            println!("MIME type:      {}", revalidated.mime_type);
            for path in revalidated.content_type.derived_relative_paths() {
                println!("Artifact:       {}", path);
            }
            if let Some(id) = revalidated.orphan_record_id {
                println!("Ledger row:     {}", id);
            }
        }

        Commands::Text { path } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let pipeline = AttachmentPipeline::new(config, store.clone(), store.clone())?;

            match pipeline.prepare_oversize_text(MessageBody::new(text))? {
                PreparedText::Inline(body) => println!("Inline body, {} bytes", body.text.len()),
                PreparedText::Oversize {
                    truncated,
                    attachment,
                } => {
                    store.commit_attachment(&attachment)?;
                    println!("Inline body truncated to {} bytes", truncated.text.len());
                    print_pending(&attachment);
                }
            }
        }

        Commands::Reclaim { grace_secs } => {
            let storage = secure_attachments::AttachmentStorage::new(&config.storage_root);
            let grace = grace_secs.unwrap_or(config.orphan_grace_period_secs);
            let report = OrphanReclaimer::new(&store, &storage, grace).reclaim()?;
            println!("Ledger rows cleared: {}", report.rows_cleared);
            println!("Files deleted:       {}", report.files_deleted);
        }

        Commands::Sweep { max_age_secs } => {
            let scratch_dir = config.scratch_dir();
            if !scratch_dir.is_dir() {
                bail!("scratch dir {} does not exist", scratch_dir.display());
            }
            let removed = sweep_scratch_dir(&scratch_dir, Duration::from_secs(max_age_secs))?;
            println!("Removed {} scratch files", removed);
        }
    }

    Ok(())
}
