use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chats_core::secret_store::SecretStore;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

pub const TOKEN_SERVICE: &str = "chats_archive";
pub const TOKEN_ACCOUNT: &str = "chatgpt_auth_token";
pub const TOKEN_ENV_VAR: &str = "CHATGPT_AUTH_TOKEN";
pub const MIN_TOKEN_LEN: usize = 20;

/// Where a retrieved token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    SecretStore,
    Environment,
}

/// Session bearer token management. Tokens are never logged; only [`token_hash`] is.
pub struct TokenManager {
    secrets: Arc<dyn SecretStore>,
    env_var: String,
}

impl TokenManager {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            secrets,
            env_var: TOKEN_ENV_VAR.to_string(),
        }
    }

    pub fn with_env_var(mut self, name: impl Into<String>) -> Self {
        self.env_var = name.into();
        self
    }

    pub fn store_token(&self, token: &str) -> Result<()> {
        let token = token.trim();
        if !validate_format(token) {
            bail!("token too short (expected a session bearer token of {MIN_TOKEN_LEN}+ chars)");
        }
        self.secrets
            .set(TOKEN_SERVICE, TOKEN_ACCOUNT, token)
            .context("failed to store token in the OS credential store")?;
        info!(token = %token_hash(token), "stored auth token");
        Ok(())
    }

    /// Secret store first, then the environment variable.
    pub fn retrieve_token(&self) -> Result<Option<(String, TokenSource)>> {
        match self.secrets.get(TOKEN_SERVICE, TOKEN_ACCOUNT) {
            Ok(Some(token)) if !token.is_empty() => {
                return Ok(Some((token, TokenSource::SecretStore)))
            }
            Ok(_) => {}
            Err(err) => warn!("credential store unavailable: {err}"),
        }
        match std::env::var(&self.env_var) {
            Ok(token) if !token.is_empty() => {
                warn!(var = %self.env_var, "using token from environment (less secure)");
                Ok(Some((token, TokenSource::Environment)))
            }
            _ => Ok(None),
        }
    }

    pub fn delete_token(&self) -> Result<()> {
        self.secrets
            .delete(TOKEN_SERVICE, TOKEN_ACCOUNT)
            .context("failed to delete token from the OS credential store")
    }
}

pub fn validate_format(token: &str) -> bool {
    token.len() >= MIN_TOKEN_LEN
}

/// First 16 hex chars of SHA-256; safe to display.
pub fn token_hash(token: &str) -> String {
    let digest = hex::encode(Sha256::digest(token.as_bytes()));
    digest[..16].to_string()
}
