//! At-rest handling of `[portal].password`.
//!
//! In memory the password is always plaintext; on disk it carries the
//! `ENC:` prefix whenever `[secrets].encrypt` is on.

use super::Config;
use crate::security::SecretStore;
use anyhow::{Context, Result};
use std::path::Path;

impl Config {
    /// Secret store keyed next to `config.toml`; the file store shares it.
    pub fn secret_store(&self) -> SecretStore {
        let root = self.config_path.parent().unwrap_or_else(|| Path::new("."));
        SecretStore::new(root, self.secrets.encrypt)
    }

    /// Opens a sealed password in place. Returns `true` when the file held a
    /// plaintext password that should be rewritten sealed.
    pub(super) fn open_password_in_place(&mut self) -> Result<bool> {
        let Some(stored) = self.portal.password.as_deref().map(str::trim) else {
            return Ok(false);
        };
        if stored.is_empty() {
            return Ok(false);
        }
        let was_plaintext = !SecretStore::is_encrypted(stored);
        let opened = self
            .secret_store()
            .decrypt(stored)
            .context("Failed to open [portal].password")?;
        self.portal.password = Some(opened);
        Ok(self.secrets.encrypt && was_plaintext)
    }

    /// Copy of the config as it should be written to disk.
    pub(super) fn config_for_persistence(&self) -> Result<Self> {
        let mut persisted = self.clone();
        if !persisted.secrets.encrypt {
            return Ok(persisted);
        }
        if let Some(password) = persisted.portal.password.as_deref().map(str::trim)
            && !password.is_empty()
            && !SecretStore::is_encrypted(password)
        {
            let sealed = self.secret_store().encrypt(password)?;
            persisted.portal.password = Some(sealed);
        }
        Ok(persisted)
    }
}
