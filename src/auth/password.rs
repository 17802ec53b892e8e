use std::sync::Arc;

use anyhow::Context;
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use tracing::error;

use crate::config::PasswordConfig;

// Prefixes of the bcrypt hashes written by the previous Node service.
const BCRYPT_PREFIXES: &[&str] = &["$2a$", "$2b$", "$2y$"];

/// Argon2id hashing with the configured cost. Stored bcrypt hashes still
/// verify. Hash and verify run on the blocking pool since both are CPU bound.
#[derive(Clone)]
pub struct PasswordService {
    argon2: Argon2<'static>,
    // Verified against when the email is unknown. It uses the configured cost,
    // so it matches the timing of current hashes only; bcrypt hashes and hashes
    // made under older costs still take a different time to verify.
    dummy_hash: Arc<str>,
}

impl PasswordService {
    pub fn new(cfg: &PasswordConfig) -> anyhow::Result<Self> {
        let params = Params::new(cfg.memory_kib, cfg.iterations, cfg.parallelism, None)
            .map_err(|e| anyhow::anyhow!("invalid argon2 parameters: {e}"))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let dummy_hash = hash_with(&argon2, "dummy-password-for-timing")?;
        Ok(Self {
            argon2,
            dummy_hash: dummy_hash.into(),
        })
    }

    pub fn hash_password(&self, plain: &str) -> anyhow::Result<String> {
        hash_with(&self.argon2, plain)
    }

    /// `Ok(false)` on mismatch, `Err` only when `hash` is malformed.
    pub fn verify_password(&self, plain: &str, hash: &str) -> anyhow::Result<bool> {
        if is_bcrypt(hash) {
            return bcrypt::verify(plain, hash).map_err(|e| {
                error!(error = %e, "bcrypt verify error");
                anyhow::anyhow!("stored bcrypt hash is malformed: {e}")
            });
        }
        let parsed = PasswordHash::new(hash).map_err(|e| {
            error!(error = %e, "argon2 parse hash error");
            anyhow::anyhow!("stored password hash is malformed: {e}")
        })?;
        Ok(self
            .argon2
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok())
    }

    pub async fn hash(&self, plain: String) -> anyhow::Result<String> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.hash_password(&plain))
            .await
            .context("password hash task failed")?
    }

    pub async fn verify(&self, plain: String, hash: String) -> anyhow::Result<bool> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.verify_password(&plain, &hash))
            .await
            .context("password verify task failed")?
    }

    /// Burns one verification against the dummy hash. The result is ignored.
    pub async fn verify_dummy(&self, plain: String) {
        let hash = self.dummy_hash.to_string();
        let _ = self.verify(plain, hash).await;
    }
}

fn is_bcrypt(hash: &str) -> bool {
    BCRYPT_PREFIXES.iter().any(|p| hash.starts_with(p))
}

fn hash_with(argon2: &Argon2<'_>, plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

#[cfg(test)]
pub(crate) fn cheap_config() -> PasswordConfig {
    PasswordConfig {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    }
}
