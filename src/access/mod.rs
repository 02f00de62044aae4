pub mod auth;
pub mod quota;
pub mod whitelist;

use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::error::AccessError;
use crate::identity::ResolvedIdentity;
use auth::AuthService;
use quota::{FreeQuota, QuotaStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTier {
    Authenticated,
    FreeTier,
    NoAuth,
    NoAccess,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessVerdict {
    pub allowed: bool,
    pub tier: AccessTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaStatus>,
}

/// Single allow/deny decision point combining auth state, the whitelist and
/// the free-tier quota.
pub struct AccessGate {
    auth: Arc<AuthService>,
    quota: FreeQuota,
}

impl AccessGate {
    pub fn new(auth: Arc<AuthService>, quota: FreeQuota) -> Self {
        Self { auth, quota }
    }

    pub fn quota(&self) -> &FreeQuota {
        &self.quota
    }

    pub async fn has_access(
        &self,
        resolved: &ResolvedIdentity,
    ) -> Result<AccessVerdict, AccessError> {
        if resolved.identity.is_authenticated() {
            return Ok(AccessVerdict {
                allowed: true,
                tier: AccessTier::Authenticated,
                quota: None,
            });
        }

        if !self.auth.is_enabled() {
            return Ok(AccessVerdict {
                allowed: true,
                tier: AccessTier::NoAuth,
                quota: None,
            });
        }

        let status = self
            .quota
            .check_access(&resolved.identity, &resolved.ip, &resolved.user_agent)
            .await?;
        let allowed = status.has_access;
        Ok(AccessVerdict {
            allowed,
            tier: if allowed {
                AccessTier::FreeTier
            } else {
                AccessTier::NoAccess
            },
            quota: Some(status),
        })
    }

    /// Soft gate: any tier may pass as long as the verdict allows. Denials
    /// carry the quota countdown so clients can render a wait message.
    pub async fn require_access(
        &self,
        resolved: &ResolvedIdentity,
    ) -> Result<AccessVerdict, AccessError> {
        let verdict = self.has_access(resolved).await?;
        if verdict.allowed {
            return Ok(verdict);
        }

        warn!("Free-tier quota exhausted for {}", resolved.ip);
        let message = match &verdict.quota {
            Some(status) => format!(
                "Free query limit reached. Resets in {}.",
                status.resets_in
            ),
            None => "Access denied".to_string(),
        };
        Err(AccessError::Denied {
            message,
            quota: verdict.quota,
        })
    }

    /// Hard gate: authenticated callers only, regardless of quota. Trivially
    /// passes when auth is disabled server-wide.
    pub fn require_authenticated(
        &self,
        resolved: &ResolvedIdentity,
    ) -> Result<(), AccessError> {
        if resolved.identity.is_authenticated() || !self.auth.is_enabled() {
            Ok(())
        } else {
            Err(AccessError::Unauthorized)
        }
    }
}
