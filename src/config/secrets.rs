// dbvault/src/config/secrets.rs
use std::env;

use crate::errors::{AppError, Result};

/// Where a target's credentials come from. A literal value wins over the
/// named environment variable.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub username_var: Option<String>,
    pub password_var: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("username_var", &self.username_var)
            .field("password_var", &self.password_var)
            .finish()
    }
}

/// Resolves named secrets. Called once, when a target is registered.
pub trait SecretResolver: Send + Sync {
    fn lookup(&self, name: &str) -> Option<String>;

    /// Returns `(username, password)`.
    fn resolve(&self, target_id: &str, credentials: &Credentials) -> Result<(String, String)> {
        let pick = |literal: &Option<String>, var: &Option<String>, what: &str| {
            literal
                .clone()
                .or_else(|| var.as_deref().and_then(|name| self.lookup(name)))
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    AppError::Configuration(format!(
                        "missing {} for target '{}'",
                        what, target_id
                    ))
                })
        };
        let username = pick(&credentials.username, &credentials.username_var, "username")?;
        let password = pick(&credentials.password, &credentials.password_var, "password")?;
        Ok((username, password))
    }
}

/// Reads secrets from process environment variables (after `.env` loading).
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecretResolver;

impl SecretResolver for EnvSecretResolver {
    fn lookup(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }
}
