//! Switchboard CLI - unified command-line interface.
//!
//! Provides a single binary entry point for:
//! - `switchboard start` - Start a gateway instance
//! - `switchboard validate` - Check a configuration file
//! - `switchboard connect` - Open a client session and print frames
//! - `switchboard append` - Append an envelope to a mailbox

mod args;
pub mod commands;

pub use args::{
    AppendArgs, Cli, Commands, ConnectArgs, MailboxKindArg, OpArg, StartArgs, ValidateArgs,
};
