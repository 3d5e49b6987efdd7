use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Low-level failure raised by a page implementation.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("element not found: {selector}")]
    ElementNotFound { selector: String },

    #[error("navigation to {url} timed out")]
    NavigationTimeout { url: String },

    #[error("page script failed: {0}")]
    Script(String),

    #[error("browser backend: {0}")]
    Backend(String),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Navigation and DOM capability supplied by the host automation backend.
///
/// Selectors are CSS selectors. Implementations must be cheap to query
/// repeatedly: the state machine re-derives state on every transition instead
/// of trusting earlier observations.
#[async_trait]
pub trait PortalPage: Send + Sync {
    /// Navigate the top-level frame.
    async fn goto(&self, url: &str) -> DriverResult<()>;

    /// URL of the top-level frame.
    async fn current_url(&self) -> DriverResult<String>;

    async fn is_element_present(&self, selector: &str) -> DriverResult<bool>;

    /// Number of elements matching `selector`.
    async fn count_elements(&self, selector: &str) -> DriverResult<usize>;

    async fn click(&self, selector: &str) -> DriverResult<()>;

    async fn fill(&self, selector: &str, value: &str) -> DriverResult<()>;

    /// Attribute of the first element matching `selector`.
    async fn attribute(&self, selector: &str, name: &str) -> DriverResult<Option<String>>;

    /// Trimmed inner text of every element matching `selector`, in document order.
    async fn inner_texts(&self, selector: &str) -> DriverResult<Vec<String>>;

    /// Reads a `localStorage` entry of the current origin.
    async fn storage_item(&self, key: &str) -> DriverResult<Option<String>>;

    /// Evaluates `script` in page context and returns its JSON result.
    async fn evaluate(&self, script: &str) -> DriverResult<Value>;
}
