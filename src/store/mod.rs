//! Filesystem persistence collaborator.
//!
//! Everything lives under the workspace directory as pretty-printed JSON:
//! `bills.json`, `identity.json`, `credentials.json` (password sealed with
//! the config's secret store) and the run ledger `ledger.json`.

mod fs;
pub mod ledger;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use self::fs::{read_json, write_json};
use crate::portal::harvest::{CredentialSource, PersistSummary, Persistence};
use crate::portal::model::{CanonicalBill, CanonicalIdentity, Credentials};
use crate::security::SecretStore;

pub use ledger::{LedgerEntry, RunLedger};

const BILLS_FILE: &str = "bills.json";
const IDENTITY_FILE: &str = "identity.json";
const CREDENTIALS_FILE: &str = "credentials.json";
const LEDGER_FILE: &str = "ledger.json";

#[derive(Debug, Serialize, Deserialize)]
struct StoredCredentials {
    login: String,
    /// `ENC:`-sealed unless encryption is disabled
    password: String,
    saved_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredIdentity {
    updated_at: DateTime<Utc>,
    identity: CanonicalIdentity,
}

fn dedup_value(bill: &CanonicalBill, dedup_key: &str) -> Result<String> {
    let value = serde_json::to_value(bill).context("Failed to serialize bill")?;
    match value.get(dedup_key) {
        Some(serde_json::Value::String(key)) if !key.is_empty() => Ok(key.clone()),
        Some(serde_json::Value::Number(key)) => Ok(key.to_string()),
        _ => bail!("bill has no usable '{dedup_key}' field"),
    }
}

pub struct FileStore {
    root: PathBuf,
    secrets: SecretStore,
    configured: Option<Credentials>,
}

impl FileStore {
    pub fn new(root: &Path, secrets: SecretStore) -> Self {
        Self {
            root: root.to_path_buf(),
            secrets,
            configured: None,
        }
    }

    /// Credentials from config or environment take precedence over stored ones.
    pub fn with_configured_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.configured = credentials;
        self
    }

    pub fn ledger(&self) -> RunLedger {
        RunLedger::new(self.root.join(LEDGER_FILE))
    }

    pub async fn bills(&self) -> Result<Vec<CanonicalBill>> {
        Ok(read_json(&self.root.join(BILLS_FILE))
            .await?
            .unwrap_or_default())
    }

    pub async fn identity(&self) -> Result<Option<CanonicalIdentity>> {
        let stored: Option<StoredIdentity> = read_json(&self.root.join(IDENTITY_FILE)).await?;
        Ok(stored.map(|s| s.identity))
    }

    /// Removes stored credentials. Returns whether any were present.
    pub async fn clear_credentials(&self) -> Result<bool> {
        let path = self.root.join(CREDENTIALS_FILE);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    async fn load_stored_credentials(&self) -> Result<Option<Credentials>> {
        let stored: Option<StoredCredentials> =
            read_json(&self.root.join(CREDENTIALS_FILE)).await?;
        let Some(stored) = stored else {
            return Ok(None);
        };
        let password = self
            .secrets
            .decrypt(&stored.password)
            .context("Failed to open stored password")?;
        Ok(Some(Credentials::new(stored.login.clone(), password)))
    }
}

#[async_trait]
impl Persistence for FileStore {
    async fn persist_bills(
        &self,
        records: &[CanonicalBill],
        dedup_key: &str,
    ) -> Result<PersistSummary> {
        let path = self.root.join(BILLS_FILE);
        let mut existing: Vec<CanonicalBill> = read_json(&path).await?.unwrap_or_default();
        let mut known = existing
            .iter()
            .map(|bill| dedup_value(bill, dedup_key))
            .collect::<Result<HashSet<_>>>()?;

        let mut summary = PersistSummary::default();
        for record in records {
            if known.insert(dedup_value(record, dedup_key)?) {
                existing.push(record.clone());
                summary.saved += 1;
            } else {
                summary.already_known += 1;
            }
        }

        if summary.saved > 0 {
            existing.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.vendor_ref.cmp(&b.vendor_ref)));
            write_json(&path, &existing).await?;
        }
        info!(saved = summary.saved, already_known = summary.already_known, "bills persisted");
        Ok(summary)
    }

    async fn persist_identity(&self, identity: &CanonicalIdentity) -> Result<()> {
        let stored = StoredIdentity {
            updated_at: Utc::now(),
            identity: identity.clone(),
        };
        write_json(&self.root.join(IDENTITY_FILE), &stored).await?;
        debug!("identity persisted");
        Ok(())
    }

    async fn persist_credentials(&self, credentials: &Credentials) -> Result<()> {
        let stored = StoredCredentials {
            login: credentials.login.clone(),
            password: self
                .secrets
                .encrypt(&credentials.password)
                .context("Failed to seal password")?,
            saved_at: Utc::now(),
        };
        write_json(&self.root.join(CREDENTIALS_FILE), &stored).await?;
        info!(login = %credentials.login, "credentials stored");
        Ok(())
    }
}

#[async_trait]
impl CredentialSource for FileStore {
    async fn stored_credentials(&self) -> Result<Option<Credentials>> {
        if let Some(configured) = self.configured.as_ref() {
            return Ok(Some(configured.clone()));
        }
        self.load_stored_credentials().await
    }
}
