//! agent-browser backend for the portal core.

pub mod cli;
pub mod hook;
pub mod page;

pub use cli::AgentBrowser;
pub use hook::spawn_pump;
pub use page::AgentBrowserPage;
