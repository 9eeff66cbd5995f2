//! Durable endpoint-side persistence: device id, E2EE sessions (derived key
//! + both sequence counters), paired device display names, and the
//! `settings` key/value table used for ad-hoc single-row state such as the
//! mobile's saved `relay_config`.
//!
//! SQLite in WAL mode, a single connection pool shared by every caller.
//! Counters MUST survive a restart or replay protection would self-DoS: a
//! session whose `last_inbound_seq` resets to -1 after a crash would reject
//! the peer's next legitimate frame only if the peer also replayed an old
//! seq — but more importantly `outbound_seq` resetting to 0 would make the
//! *next* local encrypt reuse a seq the peer already saw, triggering the
//! peer's own replay rejection.

use anyhow::Result;
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

use crate::crypto::Session as CryptoSession;

const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SessionRow {
    peer_device_id: String,
    derived_key_hex: String,
    outbound_seq: i64,
    last_inbound_seq: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PairedDeviceRow {
    pub device_id: String,
    pub device_name: Option<String>,
    pub role: String,
    pub paired_at: String,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("endpoint.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        with_timeout(async {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT value FROM settings WHERE key = ?")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.map(|(v,)| v))
        })
        .await
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO settings (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    // ─── E2EE sessions ──────────────────────────────────────────────────────

    /// Persists (or replaces) the session for `peer_device_id`. Called after
    /// a successful pairing, on intentional disconnect, on revocation, and
    /// periodically every 5 sent frames.
    pub async fn save_session(&self, peer_device_id: &str, session: &CryptoSession) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO e2ee_sessions (peer_device_id, derived_key_hex, outbound_seq, last_inbound_seq, updated_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(peer_device_id) DO UPDATE SET
                     derived_key_hex = excluded.derived_key_hex,
                     outbound_seq = excluded.outbound_seq,
                     last_inbound_seq = excluded.last_inbound_seq,
                     updated_at = excluded.updated_at",
            )
            .bind(peer_device_id)
            .bind(session.derived_key_hex())
            .bind(session.outbound_seq as i64)
            .bind(session.last_inbound_seq)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn load_session(&self, peer_device_id: &str) -> Result<Option<CryptoSession>> {
        let row: Option<SessionRow> = with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT peer_device_id, derived_key_hex, outbound_seq, last_inbound_seq
                 FROM e2ee_sessions WHERE peer_device_id = ?",
            )
            .bind(peer_device_id)
            .fetch_optional(&self.pool)
            .await?)
        })
        .await?;

        row.map(|r| CryptoSession::from_parts(&r.derived_key_hex, r.outbound_seq as u64, r.last_inbound_seq))
            .transpose()
            .map_err(|e| anyhow::anyhow!("corrupt session row for {peer_device_id}: {e}"))
    }

    pub async fn delete_session(&self, peer_device_id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM e2ee_sessions WHERE peer_device_id = ?")
                .bind(peer_device_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    // ─── Paired devices ─────────────────────────────────────────────────────

    pub async fn upsert_paired_device(
        &self,
        device_id: &str,
        device_name: Option<&str>,
        role: &str,
    ) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO paired_devices (device_id, device_name, role, paired_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(device_id) DO UPDATE SET
                     device_name = excluded.device_name,
                     role = excluded.role",
            )
            .bind(device_id)
            .bind(device_name)
            .bind(role)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn list_paired_devices(&self) -> Result<Vec<PairedDeviceRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT device_id, device_name, role, paired_at FROM paired_devices")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    pub async fn remove_paired_device(&self, device_id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM paired_devices WHERE device_id = ?")
                .bind(device_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }
}
