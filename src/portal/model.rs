use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ── Credentials ─────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ── Money ───────────────────────────────────────────────────────────────────

/// Monetary amount in hundredths of the currency unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "f64", try_from = "f64")]
pub struct Amount(i64);

impl Amount {
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn from_decimal(value: f64) -> Option<Self> {
        value
            .is_finite()
            .then(|| Self((value * 100.0).round() as i64))
    }

    pub const fn cents(self) -> i64 {
        self.0
    }
}

impl From<Amount> for f64 {
    #[allow(clippy::cast_precision_loss)]
    fn from(amount: Amount) -> Self {
        amount.0 as f64 / 100.0
    }
}

impl TryFrom<f64> for Amount {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::from_decimal(value).ok_or_else(|| format!("not a finite amount: {value}"))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

// ── Bills ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillCategory {
    Phone,
    Isp,
    Other,
}

/// Enough for the download collaborator to fetch the bytes later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDescriptor {
    pub url: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillMetadata {
    pub classification: String,
    pub sub_classification: String,
    pub datetime_label: String,
    pub content_author: String,
    pub issue_date: NaiveDate,
    pub invoice_number: String,
    pub contract_reference: Option<String>,
    pub is_subscription: bool,
    pub import_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalBill {
    pub vendor: String,
    pub date: NaiveDate,
    pub amount: Amount,
    pub currency: String,
    /// Vendor invoice id; unique within one run, used as the dedup key.
    pub vendor_ref: String,
    pub category: BillCategory,
    pub line_number: Option<String>,
    pub download: DownloadDescriptor,
    pub metadata: BillMetadata,
}

/// Field name persistence collaborators deduplicate bills on.
pub const BILL_DEDUP_KEY: &str = "vendorRef";

// ── Identity ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonName {
    pub given: Option<String>,
    pub family: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub address: String,
    pub principal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PhoneKind {
    Mobile,
    Home,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneNumber {
    pub number: String,
    pub kind: PhoneKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostalAddress {
    pub street: Option<String>,
    pub postcode: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub formatted: String,
}

/// Opportunistically assembled; any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalIdentity {
    pub name: Option<PersonName>,
    pub emails: Vec<EmailAddress>,
    pub phones: Vec<PhoneNumber>,
    pub addresses: Vec<PostalAddress>,
}

impl CanonicalIdentity {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.emails.is_empty()
            && self.phones.is_empty()
            && self.addresses.is_empty()
    }
}
