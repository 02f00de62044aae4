use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use sqlx::sqlite::SqlitePool;
use tracing::{info, warn};

use crate::error::AccessError;

#[derive(FromRow)]
struct WhitelistRow {
    ip_address: String,
    description: String,
    added_by: String,
    is_active: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WhitelistEntry {
    pub ip_address: String,
    pub description: String,
    pub added_by: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<WhitelistRow> for WhitelistEntry {
    fn from(r: WhitelistRow) -> Self {
        Self {
            ip_address: r.ip_address,
            description: r.description,
            added_by: r.added_by,
            is_active: r.is_active != 0,
            created_at: r.created_at,
        }
    }
}

/// Operator-managed set of IPs exempt from quota metering. Entries are
/// soft-deleted to keep the audit trail.
#[derive(Clone)]
pub struct Whitelist {
    pool: SqlitePool,
}

impl Whitelist {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Active-entry lookup. Store failures fail CLOSED: a whitelist we cannot
    /// read grants nobody unlimited access.
    pub async fn is_whitelisted(&self, ip: &str) -> Option<WhitelistEntry> {
        let result = sqlx::query_as::<_, WhitelistRow>(
            "SELECT ip_address, description, added_by, is_active, created_at
             FROM ip_whitelist WHERE ip_address = ? AND is_active = 1",
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(row) => row.map(WhitelistEntry::from),
            Err(e) => {
                warn!("Whitelist lookup failed for {}, treating as not whitelisted: {}", ip, e);
                None
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<WhitelistEntry>, AccessError> {
        let rows = sqlx::query_as::<_, WhitelistRow>(
            "SELECT ip_address, description, added_by, is_active, created_at
             FROM ip_whitelist WHERE is_active = 1 ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(WhitelistEntry::from).collect())
    }

    /// Adds an IP, reactivating a soft-deleted entry in place rather than
    /// duplicating it. An already-active entry is a conflict.
    pub async fn add(
        &self,
        ip: &str,
        description: &str,
        added_by: &str,
    ) -> Result<WhitelistEntry, AccessError> {
        if ip.parse::<std::net::IpAddr>().is_err() {
            return Err(AccessError::Validation(format!(
                "Invalid IP address: {}",
                ip
            )));
        }

        let existing = sqlx::query_as::<_, WhitelistRow>(
            "SELECT ip_address, description, added_by, is_active, created_at
             FROM ip_whitelist WHERE ip_address = ?",
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(row) if row.is_active != 0 => {
                Err(AccessError::Conflict(format!("Whitelist entry for {}", ip)))
            }
            Some(_) => {
                sqlx::query(
                    "UPDATE ip_whitelist
                     SET is_active = 1, description = ?, added_by = ?
                     WHERE ip_address = ?",
                )
                .bind(description)
                .bind(added_by)
                .bind(ip)
                .execute(&self.pool)
                .await?;
                info!("Reactivated whitelist entry for {}", ip);
                self.fetch(ip).await
            }
            None => {
                sqlx::query(
                    "INSERT INTO ip_whitelist (ip_address, description, added_by, is_active, created_at)
                     VALUES (?, ?, ?, 1, ?)",
                )
                .bind(ip)
                .bind(description)
                .bind(added_by)
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
                info!("Whitelisted {}", ip);
                self.fetch(ip).await
            }
        }
    }

    /// Soft delete. `NotFound` when no active entry exists for the IP.
    pub async fn remove(&self, ip: &str) -> Result<(), AccessError> {
        let result = sqlx::query(
            "UPDATE ip_whitelist SET is_active = 0 WHERE ip_address = ? AND is_active = 1",
        )
        .bind(ip)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AccessError::NotFound(format!(
                "Whitelist entry for {}",
                ip
            )));
        }
        info!("Deactivated whitelist entry for {}", ip);
        Ok(())
    }

    async fn fetch(&self, ip: &str) -> Result<WhitelistEntry, AccessError> {
        let row = sqlx::query_as::<_, WhitelistRow>(
            "SELECT ip_address, description, added_by, is_active, created_at
             FROM ip_whitelist WHERE ip_address = ?",
        )
        .bind(ip)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }
}
