//! Per-portal knobs: where to go, what to look for, how payloads look.
//!
//! The state machine, pagination driver and reconciliation engine only ever
//! talk to a portal through a [`SiteProfile`], so a layout change on the
//! vendor side is a profile change rather than new control flow.

use super::intercept::PayloadKind;

#[derive(Debug, Clone)]
pub struct PortalUrls {
    pub home: String,
    pub bills: String,
    /// Personal-information page, visited on full syncs to trigger the contact payload.
    pub identity: String,
    pub login: String,
    /// Base for relative download links found in payloads.
    pub api_base: String,
    /// Substring of the URL the portal lands on after a successful login.
    pub logged_in_pattern: String,
}

#[derive(Debug, Clone)]
pub struct StorageKeys {
    /// Access-token expiry, epoch milliseconds or RFC 3339.
    pub token_expiry: String,
    pub user_id: String,
}

#[derive(Debug, Clone)]
pub struct Selectors {
    pub login_iframe: String,
    pub username: String,
    pub password: String,
    pub lastname: String,
    pub submit: String,
    pub bad_credentials: String,
    pub vendor_down: String,
    pub otp_input: String,
    pub otp_confirmed: String,
    pub otp_confirm_button: String,
    pub disconnect: String,
    pub logout_confirm: String,
    pub load_more: String,
    pub bill_rows: String,
    pub line_numbers: String,
}

/// Structural recognizer for one payload kind.
///
/// A body matches when any anchor (a JSON pointer) resolves, and the value
/// found there carries every `item_keys` entry: directly if it is an object,
/// on each element if it is an array.
#[derive(Debug, Clone)]
pub struct ShapeSignature {
    pub kind: PayloadKind,
    pub anchors: Vec<String>,
    pub item_keys: Vec<String>,
}

impl ShapeSignature {
    pub fn new(kind: PayloadKind, anchors: &[&str], item_keys: &[&str]) -> Self {
        Self {
            kind,
            anchors: anchors.iter().map(|a| (*a).to_string()).collect(),
            item_keys: item_keys.iter().map(|k| (*k).to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SiteProfile {
    pub vendor: String,
    pub currency: String,
    pub file_suffix: String,
    pub content_author: String,
    pub urls: PortalUrls,
    pub storage: StorageKeys,
    pub selectors: Selectors,
    pub bad_credentials_text: String,
    pub signatures: Vec<ShapeSignature>,
}

impl SiteProfile {
    pub fn bouygues() -> Self {
        Self {
            vendor: "Bouygues Telecom".into(),
            currency: "EUR".into(),
            file_suffix: "bouyguestelecom".into(),
            content_author: "bouygues".into(),
            urls: PortalUrls {
                home: "https://www.bouyguestelecom.fr/mon-compte".into(),
                bills: "https://www.bouyguestelecom.fr/mon-compte/mes-factures".into(),
                identity: "https://www.bouyguestelecom.fr/mon-compte/infos-perso".into(),
                login: "https://www.mon-compte.bouyguestelecom.fr/cas/login".into(),
                api_base: "https://api.bouyguestelecom.fr".into(),
                logged_in_pattern: "/mon-compte/tableau-de-bord".into(),
            },
            storage: StorageKeys {
                token_expiry: "bytel_tokenExpiry".into(),
                user_id: "bytel_idPersonne".into(),
            },
            selectors: Selectors {
                login_iframe: "iframe[src*=\"mon-compte.bouyguestelecom.fr/cas\"]".into(),
                username: "#username".into(),
                password: "#password".into(),
                lastname: "#lastname".into(),
                submit: "button[type=\"submit\"]".into(),
                bad_credentials: ".error-icon".into(),
                vendor_down: ".txt-indispo".into(),
                otp_input: "input[name=\"otpCode\"]".into(),
                otp_confirmed: "[data-otp-state=\"validated\"]".into(),
                otp_confirm_button: "button[data-action=\"otp-continue\"]".into(),
                disconnect: "a[data-tracking-label=\"Se déconnecter\"]".into(),
                logout_confirm: "button[data-action=\"logout-confirm\"]".into(),
                load_more: "button[data-action=\"more-bills\"]".into(),
                bill_rows: "[data-bill-row]".into(),
                line_numbers: "[data-bill-row] .line-number".into(),
            },
            bad_credentials_text: "Votre identifiant ou votre mot de passe est incorrect".into(),
            signatures: vec![
                ShapeSignature::new(
                    PayloadKind::BillingData,
                    &["/comptesFacturation", "/data/comptesFacturation"],
                    &["id", "factures"],
                ),
                ShapeSignature::new(
                    PayloadKind::OtherDocuments,
                    &["/documents", "/data/autresDocuments"],
                    &["montantTTC", "dateCreation"],
                ),
                ShapeSignature::new(
                    PayloadKind::ContactData,
                    &["/personne", "/data/personne"],
                    &["nom"],
                ),
            ],
        }
    }
}
