use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use http::{Request, Response, StatusCode};
use tracing::{error, info};

use backstream_agent::client::{Agent, AgentConfig};
use backstream_agent::handler::{HttpEventHandler, HttpHandler, RecoveryHandler};
use backstream_shared::codec::WireFormat;

#[derive(Parser)]
#[command(name = "backstream-agent")]
#[command(about = "Backend agent exposing a local HTTP service through a backstream edge", long_about = None)]
struct Cli {
    /// Edge tunnel endpoint
    #[arg(long, default_value = "ws://localhost:8080/ws")]
    url: String,

    /// Tenant identifier presented to the edge
    #[arg(long)]
    client_id: String,

    /// Wire format shared with the edge (binary or json)
    #[arg(long, default_value = "binary")]
    format: WireFormat,

    /// Local HTTP service requests are forwarded to
    #[arg(long, default_value = "http://127.0.0.1:8081")]
    forward: String,

    /// Bound for handlers without a timeout header
    #[arg(long, default_value = "3s", value_parser = humantime::parse_duration)]
    default_timeout: Duration,

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

    let forward = ForwardHandler::new(cli.forward.clone());
    let handler = Arc::new(RecoveryHandler::new(Arc::new(
        HttpEventHandler::new(Arc::new(forward), cli.format)
            .with_default_timeout(cli.default_timeout),
    )));

    let agent = Agent::new(
        cli.url,
        handler,
        AgentConfig {
            client_id: cli.client_id,
            format: cli.format,
            tls: None,
        },
    );
    agent.start();
    info!("backstream agent forwarding to {}", cli.forward);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    agent.shutdown();
    Ok(())
}

/// Forwards each tunneled request to a local HTTP service.
struct ForwardHandler {
    base: String,
    client: reqwest::Client,
}

impl ForwardHandler {
    fn new(base: String) -> Self {
        Self {
            base: base.trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
        }
    }

    async fn forward(&self, request: Request<Bytes>) -> anyhow::Result<Response<Bytes>> {
        let (parts, body) = request.into_parts();
        let mut url = format!("{}{}", self.base, parts.uri.path());
        if let Some(query) = parts.uri.query() {
            url.push('?');
            url.push_str(query);
        }

        let mut headers = parts.headers;
        headers.remove(http::header::HOST);

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body.to_vec())
            .send()
            .await?;

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = upstream.bytes().await?;

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

#[async_trait]
impl HttpHandler for ForwardHandler {
    async fn handle(&self, request: Request<Bytes>) -> Response<Bytes> {
        match self.forward(request).await {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "local forward failed");
                let mut response = Response::new(Bytes::from(err.to_string()));
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
            }
        }
    }
}
