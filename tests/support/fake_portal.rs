#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use bytel_harvester::portal::harvest::{CredentialSource, PersistSummary, Persistence};
use bytel_harvester::portal::pagination::PaginationLimits;
use bytel_harvester::portal::wait::{HumanGate, WaitPolicy};
use bytel_harvester::portal::{
    CanonicalBill, CanonicalIdentity, Credentials, DriverError, DriverResult, HarvestSettings,
    InterceptionBuffer, PortalPage, SiteProfile,
};

// ── Scripted page ───────────────────────────────────────────────────────────

/// Mutable DOM, storage and network state of the fake portal.
pub struct PortalState {
    pub url: String,
    present: HashSet<String>,
    counts: HashMap<String, usize>,
    texts: HashMap<String, Vec<String>>,
    attributes: HashMap<(String, String), String>,
    storage: HashMap<String, String>,
    filled: HashMap<String, String>,
    hung: HashSet<String>,
    log: Vec<String>,
    buffer: Arc<InterceptionBuffer>,
    sequence: u64,
}

impl PortalState {
    pub fn show(&mut self, selector: &str) {
        self.present.insert(selector.to_string());
    }

    pub fn hide(&mut self, selector: &str) {
        self.present.remove(selector);
    }

    pub fn set_count(&mut self, selector: &str, count: usize) {
        self.counts.insert(selector.to_string(), count);
    }

    pub fn add_count(&mut self, selector: &str, extra: usize) {
        *self.counts.entry(selector.to_string()).or_default() += extra;
    }

    pub fn set_texts(&mut self, selector: &str, texts: &[&str]) {
        self.texts
            .insert(selector.to_string(), texts.iter().map(|t| (*t).to_string()).collect());
    }

    pub fn set_attribute(&mut self, selector: &str, name: &str, value: &str) {
        self.attributes
            .insert((selector.to_string(), name.to_string()), value.to_string());
    }

    pub fn set_storage(&mut self, key: &str, value: &str) {
        self.storage.insert(key.to_string(), value.to_string());
    }

    /// Reading the texts of `selector` never completes, like a wedged backend.
    pub fn hang_texts(&mut self, selector: &str) {
        self.hung.insert(selector.to_string());
    }

    pub fn clear_storage(&mut self) {
        self.storage.clear();
    }

    pub fn filled(&self, selector: &str) -> Option<&str> {
        self.filled.get(selector).map(String::as_str)
    }

    /// Delivers a response body through the network hook.
    pub fn emit(&mut self, body: Value) {
        self.sequence += 1;
        let url = self.url.clone();
        self.buffer.record_value(self.sequence, Some(&url), body);
    }

    /// Puts the page in a logged-in state: live token, landing URL, disconnect link.
    pub fn log_in(&mut self, profile: &SiteProfile) {
        let expiry = (Utc::now() + chrono::Duration::hours(1)).timestamp_millis();
        self.set_storage(&profile.storage.token_expiry, &expiry.to_string());
        self.set_storage(&profile.storage.user_id, "123456");
        self.url = format!("https://www.bouyguestelecom.fr{}", profile.urls.logged_in_pattern);
        self.show(&profile.selectors.disconnect);
    }

    fn is_present(&self, selector: &str) -> bool {
        self.present.contains(selector) || self.counts.get(selector).is_some_and(|n| *n > 0)
    }
}

type Reaction = Box<dyn FnMut(&mut PortalState) + Send>;

/// In-memory [`PortalPage`] whose navigations and clicks run scripted reactions.
pub struct FakePortal {
    state: Mutex<PortalState>,
    on_goto: Mutex<Vec<(String, Reaction)>>,
    on_click: Mutex<HashMap<String, Reaction>>,
}

impl FakePortal {
    pub fn new(buffer: Arc<InterceptionBuffer>) -> Self {
        Self {
            state: Mutex::new(PortalState {
                url: "about:blank".into(),
                present: HashSet::new(),
                counts: HashMap::new(),
                texts: HashMap::new(),
                attributes: HashMap::new(),
                storage: HashMap::new(),
                filled: HashMap::new(),
                hung: HashSet::new(),
                log: Vec::new(),
                buffer,
                sequence: 0,
            }),
            on_goto: Mutex::new(Vec::new()),
            on_click: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&mut PortalState) -> T) -> T {
        f(&mut *self.state.lock().unwrap())
    }

    /// Runs `reaction` after every navigation whose URL contains `pattern`.
    pub fn on_goto(&self, pattern: &str, reaction: impl FnMut(&mut PortalState) + Send + 'static) {
        self.on_goto
            .lock()
            .unwrap()
            .push((pattern.to_string(), Box::new(reaction)));
    }

    pub fn on_click(&self, selector: &str, reaction: impl FnMut(&mut PortalState) + Send + 'static) {
        self.on_click
            .lock()
            .unwrap()
            .insert(selector.to_string(), Box::new(reaction));
    }

    pub fn clicks(&self, selector: &str) -> usize {
        let needle = format!("click {selector}");
        self.with_state(|s| s.log.iter().filter(|l| **l == needle).count())
    }

    pub fn visits(&self, pattern: &str) -> usize {
        self.with_state(|s| {
            s.log
                .iter()
                .filter(|l| l.starts_with("goto ") && l.contains(pattern))
                .count()
        })
    }
}

#[async_trait]
impl PortalPage for FakePortal {
    async fn goto(&self, url: &str) -> DriverResult<()> {
        let mut reactions = self.on_goto.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        state.url = url.to_string();
        state.log.push(format!("goto {url}"));
        for (pattern, reaction) in reactions.iter_mut() {
            if url.contains(pattern.as_str()) {
                reaction(&mut *state);
            }
        }
        Ok(())
    }

    async fn current_url(&self) -> DriverResult<String> {
        Ok(self.with_state(|s| s.url.clone()))
    }

    async fn is_element_present(&self, selector: &str) -> DriverResult<bool> {
        Ok(self.with_state(|s| s.is_present(selector)))
    }

    async fn count_elements(&self, selector: &str) -> DriverResult<usize> {
        Ok(self.with_state(|s| {
            s.counts
                .get(selector)
                .copied()
                .unwrap_or_else(|| usize::from(s.present.contains(selector)))
        }))
    }

    async fn click(&self, selector: &str) -> DriverResult<()> {
        let mut reactions = self.on_click.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        if !state.is_present(selector) {
            return Err(DriverError::ElementNotFound {
                selector: selector.to_string(),
            });
        }
        state.log.push(format!("click {selector}"));
        if let Some(reaction) = reactions.get_mut(selector) {
            reaction(&mut *state);
        }
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> DriverResult<()> {
        self.with_state(|s| {
            if !s.is_present(selector) {
                return Err(DriverError::ElementNotFound {
                    selector: selector.to_string(),
                });
            }
            s.log.push(format!("fill {selector}"));
            s.filled.insert(selector.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn attribute(&self, selector: &str, name: &str) -> DriverResult<Option<String>> {
        Ok(self.with_state(|s| {
            s.attributes
                .get(&(selector.to_string(), name.to_string()))
                .cloned()
        }))
    }

    async fn inner_texts(&self, selector: &str) -> DriverResult<Vec<String>> {
        let (hung, texts) = self.with_state(|s| {
            (s.hung.contains(selector), s.texts.get(selector).cloned().unwrap_or_default())
        });
        if hung {
            std::future::pending::<()>().await;
        }
        Ok(texts)
    }

    async fn storage_item(&self, key: &str) -> DriverResult<Option<String>> {
        Ok(self.with_state(|s| s.storage.get(key).cloned()))
    }

    async fn evaluate(&self, _script: &str) -> DriverResult<Value> {
        Ok(Value::Null)
    }
}

// ── Portal scripts ──────────────────────────────────────────────────────────

/// Login form on the login URL; submitting `password` logs in, anything
/// else shows the bad-credentials marker.
pub fn script_login(portal: &FakePortal, profile: &SiteProfile, password: &str) {
    let selectors = profile.selectors.clone();
    portal.on_goto(&profile.urls.login, move |s| {
        s.show(&selectors.username);
        s.show(&selectors.password);
        s.show(&selectors.submit);
    });

    let expected = password.to_string();
    let submit = profile.selectors.submit.clone();
    let profile = profile.clone();
    portal.on_click(&submit, move |s| {
        if s.filled(&profile.selectors.password) == Some(expected.as_str()) {
            s.log_in(&profile);
        } else {
            s.show(&profile.selectors.bad_credentials);
        }
    });
}

/// Clicking disconnect clears the session immediately.
pub fn script_logout(portal: &FakePortal, profile: &SiteProfile) {
    let disconnect = profile.selectors.disconnect.clone();
    portal.on_click(&profile.selectors.disconnect, move |s| {
        s.clear_storage();
        s.hide(&disconnect);
        s.url = "https://www.bouyguestelecom.fr/".into();
    });
}

/// Bills page serving one cumulative billing payload per page cycle,
/// `rows_per_page` more rows each time, load-more hidden after the last page.
pub fn script_bills(portal: &FakePortal, profile: &SiteProfile, pages: Vec<Value>, rows_per_page: usize) {
    let pages = Arc::new(pages);
    let next = Arc::new(Mutex::new(0usize));
    let selectors = profile.selectors.clone();

    let serve = {
        let pages = Arc::clone(&pages);
        let next = Arc::clone(&next);
        move |s: &mut PortalState| {
            let mut next = next.lock().unwrap();
            let Some(body) = pages.get(*next).cloned() else {
                return;
            };
            *next += 1;
            s.emit(body);
            s.add_count(&selectors.bill_rows, rows_per_page);
            if *next >= pages.len() {
                s.hide(&selectors.load_more);
            } else {
                s.show(&selectors.load_more);
            }
        }
    };
    let on_open = serve.clone();
    let rows = profile.selectors.bill_rows.clone();
    let next_on_open = Arc::clone(&next);
    portal.on_goto(&profile.urls.bills, move |s| {
        *next_on_open.lock().unwrap() = 0;
        s.set_count(&rows, 0);
        on_open(s);
    });
    portal.on_click(&profile.selectors.load_more, serve);
}

// ── Payload builders ────────────────────────────────────────────────────────

pub fn invoice(id: &str, date: &str, amount: f64, line: Option<&str>) -> Value {
    let mut value = json!({
        "idFacture": id,
        "dateFacturation": date,
        "mntTotFacture": amount,
        "_links": { "facturePDF": { "href": format!("/factures/{id}/pdf") } },
    });
    if let Some(line) = line {
        value["numeroLigne"] = json!(line);
    }
    value
}

pub fn billing(accounts: &[(&str, Vec<Value>)]) -> Value {
    let accounts: Vec<Value> = accounts
        .iter()
        .map(|(id, invoices)| json!({ "id": id, "factures": invoices }))
        .collect();
    json!({ "comptesFacturation": accounts })
}

pub fn other_documents(docs: &[(&str, &str, f64)]) -> Value {
    let docs: Vec<Value> = docs
        .iter()
        .map(|(id, date, amount)| {
            json!({
                "idDocument": id,
                "dateCreation": date,
                "montantTTC": amount,
                "_links": { "telechargement": { "href": format!("/documents/{id}") } },
            })
        })
        .collect();
    json!({ "documents": docs })
}

pub fn contact(family: &str, given: &str) -> Value {
    json!({
        "personne": {
            "nom": family,
            "prenom": given,
            "emails": [{ "email": "marie.dupont@example.fr", "principal": true }],
            "telephones": [{ "numero": "0612345678", "type": "MOBILE" }],
        }
    })
}

/// Cumulative pages: page `k` carries the `2k` most recent invoices of one mobile line.
pub fn cumulative_pages(count: usize) -> Vec<Value> {
    (1..=count)
        .map(|page| {
            let invoices: Vec<Value> = (0..page * 2)
                .map(|i| {
                    invoice(
                        &format!("F{i:03}"),
                        &format!("2024-{:02}-05", 12 - (i % 12)),
                        30.0 + i as f64,
                        Some("0612345678"),
                    )
                })
                .collect();
            billing(&[("CF1", invoices)])
        })
        .collect()
}

// ── Collaborators ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    pub bills: Mutex<Vec<CanonicalBill>>,
    pub identity: Mutex<Option<CanonicalIdentity>>,
    pub saved_credentials: Mutex<Option<Credentials>>,
    stored: Option<Credentials>,
}

impl MemoryStore {
    pub fn with_stored(credentials: Credentials) -> Self {
        Self {
            stored: Some(credentials),
            ..Self::default()
        }
    }

    pub fn bill(&self, vendor_ref: &str) -> Option<CanonicalBill> {
        self.bills
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.vendor_ref == vendor_ref)
            .cloned()
    }

    pub fn bill_count(&self) -> usize {
        self.bills.lock().unwrap().len()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn persist_bills(
        &self,
        records: &[CanonicalBill],
        dedup_key: &str,
    ) -> anyhow::Result<PersistSummary> {
        let key_of = |bill: &CanonicalBill| -> anyhow::Result<Value> {
            Ok(serde_json::to_value(bill)?[dedup_key].clone())
        };
        let mut bills = self.bills.lock().unwrap();
        let mut known: HashSet<String> = HashSet::new();
        for bill in bills.iter() {
            known.insert(key_of(bill)?.to_string());
        }
        let mut summary = PersistSummary::default();
        for record in records {
            if known.insert(key_of(record)?.to_string()) {
                bills.push(record.clone());
                summary.saved += 1;
            } else {
                summary.already_known += 1;
            }
        }
        Ok(summary)
    }

    async fn persist_identity(&self, identity: &CanonicalIdentity) -> anyhow::Result<()> {
        *self.identity.lock().unwrap() = Some(identity.clone());
        Ok(())
    }

    async fn persist_credentials(&self, credentials: &Credentials) -> anyhow::Result<()> {
        *self.saved_credentials.lock().unwrap() = Some(credentials.clone());
        Ok(())
    }
}

#[async_trait]
impl CredentialSource for MemoryStore {
    async fn stored_credentials(&self) -> anyhow::Result<Option<Credentials>> {
        Ok(self.stored.clone())
    }
}

// ── Settings ────────────────────────────────────────────────────────────────

pub fn buffer(profile: &SiteProfile) -> Arc<InterceptionBuffer> {
    Arc::new(InterceptionBuffer::new(profile.signatures.clone()))
}

pub fn fast_wait() -> WaitPolicy {
    WaitPolicy::new(Duration::from_secs(2), Duration::from_millis(10))
}

pub fn settings() -> HarvestSettings {
    HarvestSettings {
        wait: fast_wait(),
        human: HumanGate::new(Duration::from_millis(50)),
        pagination: PaginationLimits {
            per_page_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            max_pages: 20,
        },
        run_timeout: Duration::from_secs(120),
        freshness_days: 30,
        force_full: false,
        lastname: None,
    }
}
