use crate::messenger::Messenger;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use helios_db::sqlx::{self, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const FILE_PREFIX: &str = "helios-";
const FILE_SUFFIX: &str = ".db";
const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
/// Snapshots older than this are pruned on every run.
const RETENTION_DAYS: i64 = 7;

/// Periodic database snapshots shipped to the operator chat. Uses
/// SQLite's `VACUUM INTO`, which produces a consistent copy without
/// blocking writers.
pub struct BackupService {
    pool: SqlitePool,
    messenger: Arc<dyn Messenger>,
    backup_dir: PathBuf,
    admin_chat_id: i64,
}

impl BackupService {
    pub fn new(
        pool: SqlitePool,
        messenger: Arc<dyn Messenger>,
        backup_dir: PathBuf,
        admin_chat_id: i64,
    ) -> Self {
        Self {
            pool,
            messenger,
            backup_dir,
            admin_chat_id,
        }
    }

    /// Takes one snapshot, ships it, prunes old ones. Shipping failures
    /// are logged; the snapshot stays on disk either way.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.backup_dir)
            .with_context(|| format!("Failed to create {}", self.backup_dir.display()))?;

        let path = self.snapshot_path(now);
        // VACUUM INTO refuses to overwrite.
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to replace {}", path.display()))?;
        }

        sqlx::query("VACUUM INTO ?")
            .bind(path.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await
            .context("VACUUM INTO failed")?;
        // Some SQLite builds accept VACUUM INTO as a no-op; never ship
        // or report a snapshot that is not actually on disk.
        if !path.exists() {
            anyhow::bail!("snapshot {} was not created", path.display());
        }
        info!(path = %path.display(), "Database snapshot written");

        if let Err(e) = self.messenger.send_document(self.admin_chat_id, &path).await {
            warn!("Failed to ship snapshot to operator chat: {:#}", e);
        }

        self.prune(now);
        Ok(path)
    }

    fn snapshot_path(&self, now: DateTime<Utc>) -> PathBuf {
        self.backup_dir.join(format!(
            "{}{}{}",
            FILE_PREFIX,
            now.format(TIMESTAMP_FORMAT),
            FILE_SUFFIX
        ))
    }

    /// Deletes snapshots whose filename timestamp fell out of the
    /// retention window. Unrelated files are left alone.
    fn prune(&self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::days(RETENTION_DAYS);
        let entries = match std::fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to scan backup dir: {}", e);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(taken_at) = Self::parse_timestamp(&path) else {
                continue;
            };
            if taken_at < cutoff {
                match std::fs::remove_file(&path) {
                    Ok(()) => info!(path = %path.display(), "Pruned old snapshot"),
                    Err(e) => warn!(path = %path.display(), "Prune failed: {}", e),
                }
            }
        }
    }

    fn parse_timestamp(path: &Path) -> Option<DateTime<Utc>> {
        let name = path.file_name()?.to_str()?;
        let stamp = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
        NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}
