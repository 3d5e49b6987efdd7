//! At-rest encryption for portal secrets.
//!
//! Values are sealed with ChaCha20-Poly1305 under a per-install key kept in
//! `.secret_key` (hex, mode 0600) beside `config.toml`, and stored as
//! `ENC:<hex(nonce || ciphertext)>`. Anything without the prefix is treated
//! as plaintext, so hand-edited configs keep working.

use anyhow::{Context, Result, bail};
use chacha20poly1305::{
    ChaCha20Poly1305, KeyInit, Nonce,
    aead::{Aead, OsRng, rand_core::RngCore},
};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const KEY_FILE: &str = ".secret_key";
const KEY_LEN: usize = 32;
const ENC_PREFIX: &str = "ENC:";
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct SecretStore {
    key_path: PathBuf,
    encrypt: bool,
}

impl SecretStore {
    pub fn new(root: &Path, encrypt: bool) -> Self {
        Self {
            key_path: root.join(KEY_FILE),
            encrypt,
        }
    }

    #[must_use]
    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENC_PREFIX)
    }

    /// Seals `plaintext`. A no-op when encryption is disabled or the value is
    /// already sealed.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if !self.encrypt || plaintext.is_empty() || Self::is_encrypted(plaintext) {
            return Ok(plaintext.to_string());
        }

        let cipher = self.cipher()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(format!("{ENC_PREFIX}{}", hex::encode(sealed)))
    }

    /// Opens an `ENC:` value; plaintext passes through unchanged.
    pub fn decrypt(&self, value: &str) -> Result<String> {
        let Some(hex_str) = value.strip_prefix(ENC_PREFIX) else {
            return Ok(value.to_string());
        };

        let sealed = hex::decode(hex_str).context("invalid hex in encrypted value")?;
        if sealed.len() <= NONCE_LEN {
            bail!("encrypted value too short");
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);

        let plaintext = Zeroizing::new(
            self.cipher()?
                .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
                .map_err(|_| anyhow::anyhow!("decryption failed: wrong key or corrupted value"))?,
        );
        String::from_utf8(plaintext.to_vec()).context("decrypted value is not valid UTF-8")
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        let key = self.load_or_create_key()?;
        ChaCha20Poly1305::new_from_slice(&key).context("invalid key length")
    }

    fn load_or_create_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        if self.key_path.exists() {
            return self.read_key();
        }

        let mut key = Zeroizing::new(vec![0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key);
        match self.write_new_key(&key) {
            Ok(()) => Ok(key),
            // Another process created it first.
            Err(err) if err.kind() == ErrorKind::AlreadyExists => self.read_key(),
            Err(err) => Err(err).context("failed to create key file"),
        }
    }

    fn read_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        restrict_permissions(&self.key_path)?;
        let hex_key = Zeroizing::new(fs::read_to_string(&self.key_path).context("failed to read key file")?);
        let key = Zeroizing::new(hex::decode(hex_key.trim()).context("invalid hex in key file")?);
        if key.len() != KEY_LEN {
            bail!("key file has invalid length (expected {KEY_LEN} bytes)");
        }
        Ok(key)
    }

    fn write_new_key(&self, key: &[u8]) -> std::io::Result<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.key_path)?;
        file.write_all(hex::encode(key).as_bytes())?;
        file.sync_all()
    }
}

fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("failed to set key file permissions")?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
