//! Page-to-orchestrator message channel.
//!
//! The page side (network hook, credential capture) pushes [`BridgeMessage`]s;
//! [`Bridge::pump`] applies them to the run's interception buffer and
//! credential slot. Delivery is at-least-once, so applying a message twice must
//! leave the same state as applying it once.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::intercept::InterceptionBuffer;
use super::model::Credentials;

#[derive(Debug, Clone)]
pub enum BridgeMessage {
    NetworkResponse {
        sequence: u64,
        url: Option<String>,
        body: String,
    },
    Credentials(Credentials),
}

const BRIDGE_CAPACITY: usize = 256;

pub type BridgeSender = mpsc::Sender<BridgeMessage>;

/// Receiving half of the bridge plus the state it feeds.
pub struct Bridge {
    rx: mpsc::Receiver<BridgeMessage>,
    buffer: Arc<InterceptionBuffer>,
    credentials_tx: watch::Sender<Option<Credentials>>,
}

/// Read side of the credential slot, filled when a human types credentials
/// into the portal's own form.
#[derive(Clone)]
pub struct CapturedCredentials {
    rx: watch::Receiver<Option<Credentials>>,
}

impl CapturedCredentials {
    pub fn current(&self) -> Option<Credentials> {
        self.rx.borrow().clone()
    }
}

impl Bridge {
    pub fn new(buffer: Arc<InterceptionBuffer>) -> (Self, BridgeSender, CapturedCredentials) {
        let (tx, rx) = mpsc::channel(BRIDGE_CAPACITY);
        let (credentials_tx, credentials_rx) = watch::channel(None);
        (
            Self {
                rx,
                buffer,
                credentials_tx,
            },
            tx,
            CapturedCredentials { rx: credentials_rx },
        )
    }

    pub fn apply(&self, message: BridgeMessage) {
        match message {
            BridgeMessage::NetworkResponse {
                sequence,
                url,
                body,
            } => {
                self.buffer.record(sequence, url.as_deref(), &body);
            }
            BridgeMessage::Credentials(credentials) => {
                let changed = self.credentials_tx.send_if_modified(|slot| {
                    if slot.as_ref() == Some(&credentials) {
                        false
                    } else {
                        *slot = Some(credentials);
                        true
                    }
                });
                if changed {
                    info!("credentials captured from portal form");
                } else {
                    debug!("duplicate credential delivery ignored");
                }
            }
        }
    }

    /// Drains messages until every sender is dropped.
    pub async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            self.apply(message);
        }
        debug!("bridge closed");
    }

    pub fn pump(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
