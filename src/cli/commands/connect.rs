//! Connect command - a minimal line-oriented client for manual testing.

use crate::cli::args::ConnectArgs;
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub async fn run_connect(args: ConnectArgs) -> Result<()> {
    let stream = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("failed to connect to {}", args.addr))?;
    let (read_half, mut write_half) = stream.into_split();
    let hello = json!({ "control": "authenticate", "accessToken": args.token });
    write_half
        .write_all(format!("{hello}\n").as_bytes())
        .await
        .context("failed to send credentials")?;

    let mut lines = BufReader::new(read_half).lines();
    let mut received = 0usize;
    while let Some(line) = lines.next_line().await? {
        let frame: Value = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(_) => {
                eprintln!("unparseable frame: {line}");
                continue;
            }
        };
        match frame.get("control").and_then(Value::as_str) {
            Some("ping") => {
                write_half.write_all(b"{\"control\":\"pong\"}\n").await?;
            }
            Some("rejected") => {
                let reason = frame.get("reason").and_then(Value::as_str).unwrap_or("");
                bail!("session rejected: {reason}");
            }
            Some(_) => eprintln!("{line}"),
            None => {
                println!("{line}");
                received += 1;
                if args.count > 0 && received >= args.count {
                    break;
                }
            }
        }
    }
    Ok(())
}
