// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! orgsync-relay: WebSocket fan-out relay for orgsync devices.
//!
//! Devices join organization channels and publish sync messages; the relay
//! forwards each message to the other members of that organization. It
//! keeps no sync state and makes no ordering decisions.

mod server;
mod state;

use clap::Parser;
use std::net::SocketAddr;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// orgsync-relay: organization message relay
#[derive(Parser, Debug)]
#[command(name = "orgsync-relay")]
#[command(about = "WebSocket relay forwarding sync messages between devices of an organization")]
struct Args {
    /// Address to bind the server to
    #[arg(short, long, default_value = "0.0.0.0:7890")]
    bind: SocketAddr,

    /// Per-organization channel capacity before slow members lag
    #[arg(long, default_value_t = state::DEFAULT_CHANNEL_CAPACITY)]
    capacity: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting orgsync-relay");
    info!("  Bind address: {}", args.bind);
    info!("  Channel capacity: {}", args.capacity);

    let state = state::RelayState::new(args.capacity);
    server::run(args.bind, state).await?;

    Ok(())
}
