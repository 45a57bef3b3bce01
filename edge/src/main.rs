use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use backstream_edge::serve::{router, EdgeConfig, EdgeState};
use backstream_shared::codec::WireFormat;

#[derive(Parser)]
#[command(name = "backstream-edge")]
#[command(about = "Reverse-tunnel HTTP edge proxy", long_about = None)]
struct Cli {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: SocketAddr,

    /// Route serving tunnel upgrades
    #[arg(long, default_value = "/ws")]
    ws_path: String,

    /// Wire format shared with the agents (binary or json)
    #[arg(long, default_value = "binary")]
    format: WireFormat,

    /// Accept tunnel upgrades without a client id
    #[arg(long)]
    allow_anonymous: bool,

    /// Exchange bound for requests without a timeout header
    #[arg(long, default_value = "3s", value_parser = humantime::parse_duration)]
    default_timeout: Duration,

    /// Try every tunnel matching the client id instead of just one
    #[arg(long)]
    retry: bool,

    /// With --retry, advance past any error rather than only closed tunnels
    #[arg(long)]
    retry_all_errors: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let config = EdgeConfig {
        ws_path: cli.ws_path,
        require_client_id: !cli.allow_anonymous,
        default_timeout: cli.default_timeout,
        retry: cli.retry,
        retry_all_errors: cli.retry_all_errors,
    };
    let state = EdgeState::new(cli.format, config, CancellationToken::new());
    let app = router(state);

    info!("backstream edge on {} ({:?} frames)", cli.addr, cli.format);
    let listener = tokio::net::TcpListener::bind(cli.addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
