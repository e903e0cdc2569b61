//! Append command - write one envelope to a mailbox via a push plane.

use crate::cli::args::{AppendArgs, MailboxKindArg, OpArg};
use crate::gateway::{AppendRequest, RemotePushClient};
use crate::mailbox::{MailboxId, OpCode};
use anyhow::{Context, Result};
use std::time::Duration;

pub async fn run_append(args: AppendArgs) -> Result<()> {
    let mailbox = match args.kind {
        MailboxKindArg::User => MailboxId::user(args.id),
        MailboxKindArg::Group => MailboxId::group(args.id),
    };
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("payload must be JSON")?;
    let client = RemotePushClient::new(
        args.push_plane.clone(),
        &args.push_plane,
        Duration::from_millis(args.timeout_ms),
    );
    let response = client
        .append(&AppendRequest {
            mailbox,
            op: op_code(args.op),
            payload,
        })
        .await?;
    println!("{}", response.position);
    Ok(())
}

fn op_code(op: OpArg) -> OpCode {
    match op {
        OpArg::Private => OpCode::PrivateMessage,
        OpArg::Group => OpCode::GroupMessage,
        OpArg::Count => OpCode::GroupCount,
        OpArg::Roster => OpCode::GroupRoster,
        OpArg::Online => OpCode::PresenceOnline,
        OpArg::Offline => OpCode::PresenceOffline,
    }
}
