use clap::{Parser, Subcommand};

/// `bytel-harvester` - bill and identity harvester for the Bouygues Telecom portal.
#[derive(Parser, Debug)]
#[command(name = "bytel-harvester")]
#[command(version)]
#[command(about = "Harvests bills and account identity from the Bouygues Telecom portal.", long_about = None)]
pub struct Cli {
    /// Log at debug level regardless of config
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one harvest (incremental or full, decided from the run ledger)
    Run {
        /// Force an exhaustive pass over the whole bill history
        #[arg(long)]
        full: bool,

        /// Show the browser window (needed to type a one-time code)
        #[arg(long)]
        headed: bool,
    },

    /// Show the run ledger and what is stored
    Status,

    /// Log the browser session out of the portal
    Logout,

    /// Manage stored portal credentials
    Credentials {
        #[command(subcommand)]
        credentials_command: CredentialsCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum CredentialsCommands {
    /// Prompt for login and password and store them encrypted
    Set {
        /// Login (phone number or e-mail); prompted when omitted
        #[arg(long)]
        login: Option<String>,
    },
    /// Remove stored credentials
    Clear,
}
