use crate::error::StoreError;
use crate::models::{Key, NotifyThreshold};
use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// Single source of truth for issued keys. Lifecycle decisions are
/// always made against this registry, never against the panel.
#[derive(Debug, Clone)]
pub struct KeyRepository {
    pool: SqlitePool,
}

impl KeyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a new key record. The (server, email) pair is unique per
    /// panel, so a collision surfaces as `DuplicateLabel` for the user
    /// to pick another name.
    pub async fn create_key(
        &self,
        tg_id: i64,
        client_id: &str,
        server_id: &str,
        email: &str,
        expiry_time: i64,
        connection_uri: &str,
    ) -> Result<Key, StoreError> {
        sqlx::query_as::<_, Key>(
            r#"
            INSERT INTO keys (client_id, tg_id, server_id, email, expiry_time, connection_uri)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(client_id)
        .bind(tg_id)
        .bind(server_id)
        .bind(email)
        .bind(expiry_time)
        .bind(connection_uri)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_unique_violation)
    }

    pub async fn get(&self, client_id: &str) -> Result<Option<Key>> {
        sqlx::query_as::<_, Key>("SELECT * FROM keys WHERE client_id = ?")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch key")
    }

    pub async fn list_by_user(&self, tg_id: i64) -> Result<Vec<Key>> {
        sqlx::query_as::<_, Key>(
            "SELECT * FROM keys WHERE tg_id = ? ORDER BY created_at ASC",
        )
        .bind(tg_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list keys for user")
    }

    pub async fn count_on_server(&self, server_id: &str) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM keys WHERE server_id = ?")
            .bind(server_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count keys on server")
    }

    /// Advances expiry to `max(current, new_expiry)` — a key is never
    /// shortened — and clears both notification flags plus the
    /// inconsistency marker, so the renewed key re-enters the
    /// notification pipeline from scratch.
    pub async fn extend_key(&self, client_id: &str, new_expiry: i64) -> Result<()> {
        sqlx::query(
            "UPDATE keys
             SET expiry_time = MAX(expiry_time, ?),
                 notified_10h = 0,
                 notified_24h = 0,
                 inconsistent = 0
             WHERE client_id = ?",
        )
        .bind(new_expiry)
        .bind(client_id)
        .execute(&self.pool)
        .await
        .context("Failed to extend key")?;
        Ok(())
    }

    /// Idempotent: deleting an absent key is a no-op, not an error.
    pub async fn delete_key(&self, client_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM keys WHERE client_id = ?")
            .bind(client_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete key")?;
        Ok(())
    }

    /// Keys with expiry in `(low, high]` whose given notification flag
    /// is still unset, earliest-expiring first.
    pub async fn list_expiring_between(
        &self,
        low: i64,
        high: i64,
        threshold: NotifyThreshold,
    ) -> Result<Vec<Key>> {
        let query = format!(
            "SELECT * FROM keys
             WHERE expiry_time > ? AND expiry_time <= ? AND {} = 0
             ORDER BY expiry_time ASC",
            threshold.column()
        );
        sqlx::query_as::<_, Key>(&query)
            .bind(low)
            .bind(high)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list expiring keys")
    }

    pub async fn list_expired(&self, now: i64) -> Result<Vec<Key>> {
        sqlx::query_as::<_, Key>(
            "SELECT * FROM keys WHERE expiry_time <= ? ORDER BY expiry_time ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list expired keys")
    }

    pub async fn mark_notified(
        &self,
        client_id: &str,
        threshold: NotifyThreshold,
    ) -> Result<()> {
        let query = format!(
            "UPDATE keys SET {} = 1 WHERE client_id = ?",
            threshold.column()
        );
        sqlx::query(&query)
            .bind(client_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark key notified")?;
        Ok(())
    }

    /// Flags a key whose registry state advanced but whose panel update
    /// failed, for operator follow-up.
    pub async fn mark_inconsistent(&self, client_id: &str) -> Result<()> {
        sqlx::query("UPDATE keys SET inconsistent = 1 WHERE client_id = ?")
            .bind(client_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark key inconsistent")?;
        Ok(())
    }
}
