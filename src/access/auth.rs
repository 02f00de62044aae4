use std::collections::HashSet;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::AccessError;

/// Single-password authentication, demo-grade on purpose.
///
/// Issued tokens live in memory only; a restart revokes every login. When no
/// password is configured the service runs with auth disabled and nobody is
/// ever considered authenticated (callers fall through to the `no_auth`
/// tier at the gate).
pub struct AuthService {
    password: Option<String>,
    tokens: Mutex<HashSet<String>>,
}

impl AuthService {
    pub fn new(password: Option<String>) -> Self {
        Self {
            password,
            tokens: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.password.is_some()
    }

    /// True iff auth is enabled and the presented token was issued by us.
    pub fn is_authenticated(&self, token: Option<&str>) -> bool {
        if self.password.is_none() {
            return false;
        }
        match token {
            Some(token) => self.tokens.lock().unwrap().contains(token),
            None => false,
        }
    }

    /// Verifies the password and mints an auth token. Returns `Ok(None)` when
    /// auth is disabled (login trivially succeeds, nothing to issue).
    pub fn login(&self, password: &str) -> Result<Option<String>, AccessError> {
        let Some(expected) = &self.password else {
            return Ok(None);
        };
        if password != expected {
            warn!("Rejected login attempt with invalid password");
            return Err(AccessError::Unauthorized);
        }

        let token = uuid::Uuid::new_v4().to_string();
        self.tokens.lock().unwrap().insert(token.clone());
        info!("Login successful, auth token issued");
        Ok(Some(token))
    }

    pub fn logout(&self, token: Option<&str>) {
        if let Some(token) = token {
            self.tokens.lock().unwrap().remove(token);
        }
    }
}
