use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info};

use crate::access::whitelist::Whitelist;
use crate::error::AccessError;
use crate::identity::{Identity, derive_tracking_key};

pub const FREE_QUERY_LIMIT: i64 = 10;
pub const RESET_WINDOW_HOURS: i64 = 24;
/// Sentinel "remaining" for whitelisted callers; never decremented.
pub const UNLIMITED_REMAINING: i64 = 999_999;

/// Stored user agents are bounded; anything longer is noise.
const STORED_UA_MAX: usize = 255;

#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub has_access: bool,
    pub queries_used: i64,
    pub queries_remaining: i64,
    pub query_limit: i64,
    pub whitelisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whitelist_description: Option<String>,
    pub reset_at: DateTime<Utc>,
    pub resets_in: String,
}

impl QuotaStatus {
    fn unlimited(description: Option<String>) -> Self {
        let window = Duration::hours(RESET_WINDOW_HOURS);
        Self {
            has_access: true,
            queries_used: 0,
            queries_remaining: UNLIMITED_REMAINING,
            query_limit: FREE_QUERY_LIMIT,
            whitelisted: true,
            whitelist_description: description,
            // Nothing is metered, so nothing ever "resets"; a full window
            // out avoids reading as an imminent cutoff on the wire.
            reset_at: Utc::now() + window,
            resets_in: format_countdown(window),
        }
    }
}

/// Free-tier quota engine over the append-only usage ledger.
///
/// Usage is read through three independent lenses (session token, client IP,
/// tracking key) and the most restrictive one wins, so neither clearing
/// cookies nor hopping session tokens on the same device resets the count.
#[derive(Clone)]
pub struct FreeQuota {
    pool: SqlitePool,
    whitelist: Whitelist,
}

impl FreeQuota {
    pub fn new(pool: SqlitePool, whitelist: Whitelist) -> Self {
        Self { pool, whitelist }
    }

    /// Computes the caller's quota state. Whitelisted IPs short-circuit to an
    /// unlimited status without touching the ledger.
    pub async fn check_access(
        &self,
        identity: &Identity,
        ip: &str,
        user_agent: &str,
    ) -> Result<QuotaStatus, AccessError> {
        if let Some(entry) = self.whitelist.is_whitelisted(ip).await {
            return Ok(QuotaStatus::unlimited(Some(entry.description)));
        }

        let now = Utc::now();
        let cutoff = now - Duration::hours(RESET_WINDOW_HOURS);
        let tracking_key = derive_tracking_key(ip, user_agent);

        let session_used = match identity.session_token() {
            Some(token) => {
                self.sum_dimension("session_token", token, cutoff).await?
            }
            None => 0,
        };
        let ip_used = self.sum_dimension("ip_address", ip, cutoff).await?;
        let key_used = self
            .sum_dimension("tracking_key", &tracking_key, cutoff)
            .await?;

        // Most-restrictive-wins across the three lenses.
        let used = session_used.max(ip_used).max(key_used);
        let remaining = (FREE_QUERY_LIMIT - used).max(0);

        let reset_at = self
            .oldest_counted_event(identity.session_token(), ip, &tracking_key, cutoff)
            .await?
            .map(|oldest| oldest + Duration::hours(RESET_WINDOW_HOURS))
            .unwrap_or(now + Duration::hours(RESET_WINDOW_HOURS));

        debug!(
            "Quota for {}: session={} ip={} key={} -> used={}",
            ip, session_used, ip_used, key_used, used
        );

        Ok(QuotaStatus {
            has_access: remaining > 0,
            queries_used: used,
            queries_remaining: remaining,
            query_limit: FREE_QUERY_LIMIT,
            whitelisted: false,
            whitelist_description: None,
            reset_at,
            resets_in: format_countdown(reset_at - now),
        })
    }

    /// Records one quota-consuming action and returns the fresh status.
    ///
    /// The ledger append and the daily-summary upsert share one transaction;
    /// if either fails the caller sees the error rather than an action that
    /// silently escaped metering. Whitelisted usage is not metered at all.
    pub async fn log_query(
        &self,
        identity: &Identity,
        ip: &str,
        user_agent: &str,
        model: &str,
    ) -> Result<QuotaStatus, AccessError> {
        if let Some(entry) = self.whitelist.is_whitelisted(ip).await {
            return Ok(QuotaStatus::unlimited(Some(entry.description)));
        }

        let now = Utc::now();
        let stored_ua: String = user_agent.chars().take(STORED_UA_MAX).collect();
        let tracking_key = derive_tracking_key(ip, user_agent);
        let session_token = identity.session_token().unwrap_or_default();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO usage_events
             (id, session_token, ip_address, user_agent, tracking_key, model, query_count, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(session_token)
        .bind(ip)
        .bind(&stored_ua)
        .bind(&tracking_key)
        .bind(model)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO daily_usage (ip_address, usage_date, total_queries, last_user_agent, last_activity)
             VALUES (?, ?, 1, ?, ?)
             ON CONFLICT (ip_address, usage_date) DO UPDATE SET
                 total_queries = total_queries + 1,
                 last_user_agent = excluded.last_user_agent,
                 last_activity = excluded.last_activity",
        )
        .bind(ip)
        .bind(now.date_naive().to_string())
        .bind(&stored_ua)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!("Logged free-tier query from {} for model {}", ip, model);

        self.check_access(identity, ip, user_agent).await
    }

    async fn sum_dimension(
        &self,
        column: &str,
        value: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<i64, AccessError> {
        // Column names come from a fixed internal set, never from input.
        let sql = format!(
            "SELECT COALESCE(SUM(query_count), 0) FROM usage_events
             WHERE {} = ? AND created_at > ?",
            column
        );
        let (sum,): (i64,) = sqlx::query_as(&sql)
            .bind(value)
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await?;
        Ok(sum)
    }

    async fn oldest_counted_event(
        &self,
        session_token: Option<&str>,
        ip: &str,
        tracking_key: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, AccessError> {
        let (oldest,): (Option<DateTime<Utc>>,) = sqlx::query_as(
            "SELECT MIN(created_at) FROM usage_events
             WHERE (session_token = ? OR ip_address = ? OR tracking_key = ?)
               AND created_at > ?",
        )
        .bind(session_token.unwrap_or_default())
        .bind(ip)
        .bind(tracking_key)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(oldest)
    }
}

/// Human-readable countdown for denial responses, e.g. "3h 12m".
fn format_countdown(until: Duration) -> String {
    let minutes = until.num_minutes().max(0);
    format!("{}h {}m", minutes / 60, minutes % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_formatting() {
        assert_eq!(format_countdown(Duration::minutes(192)), "3h 12m");
        assert_eq!(format_countdown(Duration::minutes(59)), "0h 59m");
        assert_eq!(format_countdown(Duration::minutes(-5)), "0h 0m");
    }
}
