//! Minimal edge runner: relay traffic from a relay server to a local service.
//!
//! Usage:
//!   cargo run --example edge -- <server_addr:port> <token> <forward_to>

use edge_client::connect_to_server;
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();

    if args.len() != 4 {
        eprintln!("Usage: {} <server_addr:port> <token> <forward_to>", args[0]);
        std::process::exit(1);
    }

    let client = connect_to_server(args[1].clone(), args[2].clone(), args[3].clone()).await?;

    tokio::signal::ctrl_c().await?;
    client.disconnect().await;

    Ok(())
}
