//! Portal harvesting core.
//!
//! Everything here talks to the portal through [`page::PortalPage`] and to
//! storage through [`harvest::Persistence`], so the whole pipeline runs
//! unchanged against a real browser or a scripted page.

pub mod auth;
pub mod bridge;
pub mod harvest;
pub mod intercept;
pub mod model;
pub mod page;
pub mod pagination;
pub mod profile;
pub mod reconcile;
pub mod sync_policy;
pub mod wait;

pub use auth::{AuthState, AuthStateMachine, Challenge};
pub use bridge::{Bridge, BridgeMessage, BridgeSender, CapturedCredentials};
pub use harvest::{CredentialSource, HarvestReport, HarvestSettings, Harvester, Persistence, PersistSummary};
pub use intercept::{InterceptionBuffer, PayloadKind};
pub use model::{CanonicalBill, CanonicalIdentity, Credentials};
pub use page::{DriverError, DriverResult, PortalPage};
pub use profile::SiteProfile;
pub use sync_policy::{SyncContext, SyncDecision, SyncMode};
