//! Reconciliation: intercepted payloads in, canonical records out.
//!
//! Billing payloads are cumulative (each page response carries every bill
//! loaded so far), so only the latest one is reconciled. Bills and "other
//! documents" are sorted independently, most recent first, ties broken by
//! vendor ref.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, warn};

use super::auth::resolve_link;
use super::model::{
    Amount, BillCategory, BillMetadata, CanonicalBill, CanonicalIdentity, DownloadDescriptor,
    EmailAddress, PersonName, PhoneKind, PhoneNumber, PostalAddress,
};
use super::profile::SiteProfile;
use crate::error::{HarvestError, Result};

const STAGE: &str = "reconcile";

// ── Raw payload shapes ──────────────────────────────────────────────────────

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected id, got {other}"))),
    }
}

#[derive(Debug, Deserialize)]
struct RawHref {
    href: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBillingPayload {
    comptes_facturation: Vec<RawAccount>,
    #[serde(default)]
    contrats_signes: Option<RawContracts>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    #[serde(default)]
    factures: Vec<RawInvoice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInvoice {
    #[serde(deserialize_with = "string_or_number")]
    id_facture: String,
    date_facturation: String,
    mnt_tot_facture: Value,
    #[serde(default)]
    numero_ligne: Option<String>,
    #[serde(default, rename = "_links")]
    links: RawInvoiceLinks,
}

#[derive(Debug, Default, Deserialize)]
struct RawInvoiceLinks {
    #[serde(rename = "facturePDF")]
    facture_pdf: Option<RawHref>,
    #[serde(rename = "facturePDFDF")]
    facture_pdf_df: Option<RawHref>,
}

#[derive(Debug, Deserialize)]
struct RawContracts {
    #[serde(default)]
    items: Vec<RawContract>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawContract {
    #[serde(default)]
    type_ligne: Option<String>,
    #[serde(default, rename = "_links")]
    links: RawContractLinks,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawContractLinks {
    compte_facturation: Option<RawHref>,
}

#[derive(Debug, Deserialize)]
struct RawOtherPayload {
    #[serde(alias = "autresDocuments")]
    documents: Vec<RawOtherDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOtherDocument {
    #[serde(alias = "numeroFacture", deserialize_with = "string_or_number")]
    id_document: String,
    date_creation: String,
    #[serde(rename = "montantTTC")]
    montant_ttc: Value,
    #[serde(default, rename = "_links")]
    links: RawOtherLinks,
}

#[derive(Debug, Default, Deserialize)]
struct RawOtherLinks {
    telechargement: Option<RawHref>,
}

/// GraphQL-style responses wrap their result in `data`.
fn unwrap_data(body: &Value) -> &Value {
    match body.get("data") {
        Some(inner @ Value::Object(_)) => inner,
        _ => body,
    }
}

/// Whether a billing payload lists no invoice at all. Such an account never
/// renders a bill row.
pub fn billing_is_empty(body: &Value) -> bool {
    unwrap_data(body)
        .get("comptesFacturation")
        .and_then(Value::as_array)
        .is_some_and(|accounts| {
            accounts.iter().all(|account| {
                account
                    .get("factures")
                    .and_then(Value::as_array)
                    .is_none_or(Vec::is_empty)
            })
        })
}

// ── Field helpers ───────────────────────────────────────────────────────────

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(day, "%d/%m/%Y"))
        .ok()
}

/// Accepts JSON numbers and portal strings such as `"12,50 €"`.
pub fn parse_amount(value: &Value) -> Option<Amount> {
    match value {
        Value::Number(n) => n.as_f64().and_then(Amount::from_decimal),
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .trim_end_matches('€')
                .trim()
                .replace(['\u{a0}', ' '], "")
                .replace(',', ".");
            cleaned.parse::<f64>().ok().and_then(Amount::from_decimal)
        }
        _ => None,
    }
}

/// Digits of a French line number, international prefix folded to `0`.
fn normalize_line_number(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if let Some(rest) = digits.strip_prefix("0033") {
        return format!("0{rest}");
    }
    match digits.strip_prefix("33") {
        Some(rest) if raw.trim_start().starts_with('+') => format!("0{rest}"),
        _ => digits,
    }
}

/// `06`/`07` numbers are mobile lines; any other two-digit prefix is a fixed
/// (ISP) line. Fewer than two digits yields nothing.
pub fn category_from_line_number(raw: &str) -> Option<BillCategory> {
    let digits = normalize_line_number(raw);
    match digits.get(..2)? {
        "06" | "07" => Some(BillCategory::Phone),
        _ => Some(BillCategory::Isp),
    }
}

fn category_from_line_type(line_type: &str) -> Option<BillCategory> {
    match line_type {
        "MOBILE" => Some(BillCategory::Phone),
        "FIXE" => Some(BillCategory::Isp),
        other => {
            warn!(line_type = other, "unknown line type");
            None
        }
    }
}

// ── Output ──────────────────────────────────────────────────────────────────

/// Signals about the DOM position fallback, which assumes the n-th visible
/// line-number cell belongs to the n-th bill of the sorted list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataQuality {
    pub dom_line_numbers: usize,
    pub sorted_bills: usize,
    /// Bills whose structured number disagrees with the DOM cell at the same position.
    pub position_disagreements: usize,
    pub fallback_used: usize,
}

impl DataQuality {
    pub fn length_mismatch(&self) -> bool {
        self.dom_line_numbers != 0 && self.dom_line_numbers != self.sorted_bills
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedBill {
    pub vendor_ref: String,
    pub position: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub bills: Vec<CanonicalBill>,
    pub skipped: Vec<SkippedBill>,
    pub quality: DataQuality,
}

impl Reconciliation {
    pub fn skipped_docs(&self) -> usize {
        self.skipped.len()
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

struct PendingBill {
    account_id: String,
    vendor_ref: String,
    date: NaiveDate,
    amount: Amount,
    line_number: Option<String>,
    link: Option<String>,
}

pub struct Reconciler<'a> {
    profile: &'a SiteProfile,
    imported_at: DateTime<Utc>,
}

impl<'a> Reconciler<'a> {
    pub fn new(profile: &'a SiteProfile, imported_at: DateTime<Utc>) -> Self {
        Self {
            profile,
            imported_at,
        }
    }

    /// Reconciles the latest billing payload and the latest "other documents"
    /// payload. `dom_line_numbers` are the visible line-number cells in page
    /// order, used only for bills without a structured number.
    pub fn reconcile(
        &self,
        billing: Option<&Value>,
        other: Option<&Value>,
        dom_line_numbers: &[String],
    ) -> Result<Reconciliation> {
        let mut out = Reconciliation::default();

        if let Some(body) = billing {
            self.reconcile_subscriptions(body, dom_line_numbers, &mut out)?;
        }
        if let Some(body) = other {
            let mut others = self.reconcile_other_documents(body)?;
            out.bills.append(&mut others);
        }

        let mut seen = HashSet::new();
        for bill in &out.bills {
            if !seen.insert(bill.vendor_ref.as_str()) {
                return Err(HarvestError::unknown(
                    STAGE,
                    format!("vendorRef {} appears more than once", bill.vendor_ref),
                ));
            }
        }

        debug!(
            bills = out.bills.len(),
            skipped = out.skipped_docs(),
            "reconciliation finished"
        );
        Ok(out)
    }

    fn reconcile_subscriptions(
        &self,
        body: &Value,
        dom_line_numbers: &[String],
        out: &mut Reconciliation,
    ) -> Result<()> {
        let payload: RawBillingPayload = serde_json::from_value(unwrap_data(body).clone())
            .map_err(|e| HarvestError::unknown(STAGE, format!("billing payload: {e}")))?;

        let line_types: HashMap<&str, BillCategory> = payload
            .comptes_facturation
            .iter()
            .filter_map(|account| {
                let contracts = payload.contrats_signes.as_ref()?;
                let contract = contracts.items.iter().find(|c| {
                    c.links
                        .compte_facturation
                        .as_ref()
                        .is_some_and(|h| h.href.contains(&account.id))
                })?;
                let category = category_from_line_type(contract.type_ligne.as_deref()?)?;
                Some((account.id.as_str(), category))
            })
            .collect();

        let mut pending = Vec::new();
        for account in &payload.comptes_facturation {
            for invoice in &account.factures {
                pending.push(self.pending_bill(account, invoice)?);
            }
        }
        pending.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.vendor_ref.cmp(&b.vendor_ref)));

        out.quality.sorted_bills = pending.len();
        out.quality.dom_line_numbers = dom_line_numbers.len();
        if out.quality.length_mismatch() {
            warn!(
                dom = dom_line_numbers.len(),
                bills = pending.len(),
                "visible line numbers do not line up with bills, position fallback is unreliable"
            );
        }

        for (position, bill) in pending.into_iter().enumerate() {
            let dom_number = dom_line_numbers
                .get(position)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty());

            if let (Some(structured), Some(dom)) = (bill.line_number.as_deref(), dom_number)
                && normalize_line_number(structured) != normalize_line_number(dom)
            {
                out.quality.position_disagreements += 1;
                warn!(position, vendor_ref = %bill.vendor_ref, "DOM line number disagrees with payload");
            }

            let structured = bill
                .line_number
                .as_deref()
                .and_then(category_from_line_number);
            let category = structured
                .or_else(|| line_types.get(bill.account_id.as_str()).copied())
                .or_else(|| {
                    let fallback = dom_number.and_then(category_from_line_number);
                    if fallback.is_some() {
                        out.quality.fallback_used += 1;
                    }
                    fallback
                });

            let Some(category) = category else {
                warn!(position, vendor_ref = %bill.vendor_ref, "no line type derivable, skipping bill");
                out.skipped.push(SkippedBill {
                    vendor_ref: bill.vendor_ref,
                    position,
                });
                continue;
            };

            let line_number = bill
                .line_number
                .clone()
                .or_else(|| dom_number.map(ToOwned::to_owned));
            out.bills
                .push(self.canonical(bill, category, line_number, true)?);
        }
        Ok(())
    }

    fn pending_bill(&self, account: &RawAccount, invoice: &RawInvoice) -> Result<PendingBill> {
        let date = parse_date(&invoice.date_facturation).ok_or_else(|| {
            HarvestError::unknown(
                STAGE,
                format!("bill {}: bad date {}", invoice.id_facture, invoice.date_facturation),
            )
        })?;
        let amount = parse_amount(&invoice.mnt_tot_facture).ok_or_else(|| {
            HarvestError::unknown(
                STAGE,
                format!("bill {}: bad amount {}", invoice.id_facture, invoice.mnt_tot_facture),
            )
        })?;
        let link = invoice
            .links
            .facture_pdf
            .as_ref()
            .or(invoice.links.facture_pdf_df.as_ref())
            .map(|h| h.href.clone());
        Ok(PendingBill {
            account_id: account.id.clone(),
            vendor_ref: invoice.id_facture.clone(),
            date,
            amount,
            line_number: invoice
                .numero_ligne
                .clone()
                .filter(|n| !n.trim().is_empty()),
            link,
        })
    }

    fn reconcile_other_documents(&self, body: &Value) -> Result<Vec<CanonicalBill>> {
        let payload: RawOtherPayload = serde_json::from_value(unwrap_data(body).clone())
            .map_err(|e| HarvestError::unknown(STAGE, format!("other documents payload: {e}")))?;

        let mut pending = Vec::with_capacity(payload.documents.len());
        for doc in payload.documents {
            let date = parse_date(&doc.date_creation).ok_or_else(|| {
                HarvestError::unknown(
                    STAGE,
                    format!("document {}: bad date {}", doc.id_document, doc.date_creation),
                )
            })?;
            let amount = parse_amount(&doc.montant_ttc).ok_or_else(|| {
                HarvestError::unknown(
                    STAGE,
                    format!("document {}: bad amount {}", doc.id_document, doc.montant_ttc),
                )
            })?;
            pending.push(PendingBill {
                account_id: String::new(),
                vendor_ref: doc.id_document,
                date,
                amount,
                line_number: None,
                link: doc.links.telechargement.map(|h| h.href),
            });
        }
        pending.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.vendor_ref.cmp(&b.vendor_ref)));

        pending
            .into_iter()
            .map(|doc| self.canonical(doc, BillCategory::Other, None, false))
            .collect()
    }

    fn canonical(
        &self,
        bill: PendingBill,
        category: BillCategory,
        line_number: Option<String>,
        is_subscription: bool,
    ) -> Result<CanonicalBill> {
        let profile = self.profile;
        let href = bill.link.ok_or_else(|| {
            HarvestError::unknown(STAGE, format!("bill {} has no download link", bill.vendor_ref))
        })?;
        let url = resolve_link(&profile.urls.api_base, &href).ok_or_else(|| {
            HarvestError::unknown(STAGE, format!("bill {}: bad link {href}", bill.vendor_ref))
        })?;
        let filename = format!(
            "{}_{}_{}.pdf",
            bill.date.format("%Y%m"),
            profile.file_suffix,
            bill.vendor_ref
        );

        Ok(CanonicalBill {
            vendor: profile.vendor.clone(),
            date: bill.date,
            amount: bill.amount,
            currency: profile.currency.clone(),
            category,
            line_number,
            download: DownloadDescriptor { url, filename },
            metadata: BillMetadata {
                classification: "invoicing".into(),
                sub_classification: "invoice".into(),
                datetime_label: "issueDate".into(),
                content_author: profile.content_author.clone(),
                issue_date: bill.date,
                invoice_number: bill.vendor_ref.clone(),
                contract_reference: (!bill.account_id.is_empty()).then_some(bill.account_id),
                is_subscription,
                import_date: self.imported_at,
            },
            vendor_ref: bill.vendor_ref,
        })
    }
}

// ── Identity ────────────────────────────────────────────────────────────────

/// Identity hints available without any payload, e.g. the login itself.
#[derive(Debug, Clone, Default)]
pub struct IdentityFragments {
    pub login: Option<String>,
    pub lastname: Option<String>,
}

fn str_field<'v>(obj: &'v Value, keys: &[&str]) -> Option<&'v str> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn phone_kind(number: &str, declared: Option<&str>) -> PhoneKind {
    match declared {
        Some("MOBILE") => PhoneKind::Mobile,
        Some("FIXE") => PhoneKind::Home,
        _ => match category_from_line_number(number) {
            Some(BillCategory::Phone) => PhoneKind::Mobile,
            _ => PhoneKind::Home,
        },
    }
}

/// Builds an identity from the latest contact payload plus session fragments.
/// Missing pieces are simply left out.
pub fn reconcile_identity(contact: Option<&Value>, fragments: &IdentityFragments) -> CanonicalIdentity {
    let mut identity = CanonicalIdentity::default();
    let person = contact
        .map(unwrap_data)
        .and_then(|root| root.get("personne"));

    if let Some(person) = person {
        let given = str_field(person, &["prenom"]).map(ToOwned::to_owned);
        let family = str_field(person, &["nom"]).map(ToOwned::to_owned);
        if given.is_some() || family.is_some() {
            identity.name = Some(PersonName { given, family });
        }

        for email in person.get("emails").and_then(Value::as_array).into_iter().flatten() {
            if let Some(address) = str_field(email, &["email", "adresse"]) {
                let principal = ["principal", "estPrincipal"]
                    .iter()
                    .any(|k| email.get(*k).and_then(Value::as_bool).unwrap_or(false));
                identity.emails.push(EmailAddress {
                    address: address.to_owned(),
                    principal,
                });
            }
        }

        for phone in person.get("telephones").and_then(Value::as_array).into_iter().flatten() {
            if let Some(number) = str_field(phone, &["numero", "number"]) {
                identity.phones.push(PhoneNumber {
                    number: number.to_owned(),
                    kind: phone_kind(number, str_field(phone, &["type"])),
                });
            }
        }

        for address in person
            .get("adressesPostales")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let number = str_field(address, &["numero"]);
            let street = str_field(address, &["rue", "voie"]);
            let street = match (number, street) {
                (Some(n), Some(s)) => Some(format!("{n} {s}")),
                (None, Some(s)) => Some(s.to_owned()),
                _ => None,
            };
            let postcode = str_field(address, &["codePostal"]).map(ToOwned::to_owned);
            let city = str_field(address, &["ville"]).map(ToOwned::to_owned);
            let country = str_field(address, &["pays"]).map(ToOwned::to_owned);
            let formatted = [street.as_deref(), postcode.as_deref(), city.as_deref(), country.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            if !formatted.is_empty() {
                identity.addresses.push(PostalAddress {
                    street,
                    postcode,
                    city,
                    country,
                    formatted,
                });
            }
        }
    }

    merge_fragments(&mut identity, fragments);
    identity
}

fn merge_fragments(identity: &mut CanonicalIdentity, fragments: &IdentityFragments) {
    if let Some(lastname) = fragments.lastname.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let name = identity.name.get_or_insert_with(PersonName::default);
        if name.family.is_none() {
            name.family = Some(lastname.to_owned());
        }
    }

    let Some(login) = fragments.login.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
        return;
    };
    if login.contains('@') {
        if !identity.emails.iter().any(|e| e.address.eq_ignore_ascii_case(login)) {
            let principal = identity.emails.is_empty();
            identity.emails.push(EmailAddress {
                address: login.to_owned(),
                principal,
            });
        }
    } else if login.chars().filter(char::is_ascii_digit).count() >= 10 {
        let normalized = normalize_line_number(login);
        if !identity
            .phones
            .iter()
            .any(|p| normalize_line_number(&p.number) == normalized)
        {
            identity.phones.push(PhoneNumber {
                number: login.to_owned(),
                kind: phone_kind(login, None),
            });
        }
    }
}
