//! Validate command - parse a configuration file and report what it describes.

use crate::cli::args::ValidateArgs;
use crate::config::{AuthConfig, Config};
use anyhow::Result;

pub fn run_validate(args: ValidateArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    config.validate()?;
    let auth = match &config.auth {
        AuthConfig::Local { tokens } => format!("local ({} tokens)", tokens.len()),
        AuthConfig::Http { endpoint, .. } => format!("http ({endpoint})"),
    };
    println!("{}: ok", args.config.display());
    println!("  instance     {}", config.gateway.instance_id);
    println!("  clients      {}", config.gateway.bind);
    println!(
        "  push plane   {} (advertised as {})",
        config.push_plane.bind,
        config.push_plane_advertise()
    );
    println!("  buckets      {}", config.gateway.bucket_count);
    println!("  peers        {}", config.push_plane.peers.len());
    println!("  auth         {auth}");
    Ok(())
}
