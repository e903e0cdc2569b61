//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Switchboard - real-time chat gateway and mailbox delivery.
#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "Switchboard chat gateway and diagnostic tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a gateway instance
    Start(StartArgs),

    /// Parse and validate a configuration file without starting anything
    Validate(ValidateArgs),

    /// Open a client session and print every frame received
    Connect(ConnectArgs),

    /// Append an envelope to a mailbox through a push plane
    Append(AppendArgs),
}

// -----------------------------------------------------------------------------
// Start command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/switchboard.toml")]
    pub config: PathBuf,
}

// -----------------------------------------------------------------------------
// Validate command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct ValidateArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/switchboard.toml")]
    pub config: PathBuf,
}

// -----------------------------------------------------------------------------
// Connect command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct ConnectArgs {
    /// Gateway client address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:7400")]
    pub addr: String,

    /// Access token sent in the authenticate frame
    #[arg(short, long)]
    pub token: String,

    /// Exit after this many application frames (0 = run until closed)
    #[arg(long, default_value_t = 0)]
    pub count: usize,
}

// -----------------------------------------------------------------------------
// Append command
// -----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum MailboxKindArg {
    User,
    Group,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OpArg {
    Private,
    Group,
    Count,
    Roster,
    Online,
    Offline,
}

#[derive(Args)]
pub struct AppendArgs {
    /// Push plane address of any gateway instance (host:port)
    #[arg(long, default_value = "127.0.0.1:7401")]
    pub push_plane: String,

    /// Mailbox kind
    #[arg(long, value_enum)]
    pub kind: MailboxKindArg,

    /// Mailbox owner (user or group id)
    #[arg(long)]
    pub id: u64,

    /// Envelope operation
    #[arg(long, value_enum)]
    pub op: OpArg,

    /// JSON payload for the operation
    #[arg(long)]
    pub payload: String,

    /// Request timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
}
