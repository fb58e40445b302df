//! Representation similarity worker: JSON-lines requests on STDIN, responses on STDOUT

mod logging;
mod prometheus;
mod stdio;

pub use logging::init_logging;
pub use stdio::{serve, shutdown_signal};

use anyhow::{Context, Result};
use repr_similarity_backend::{Backend, BackendConfig, DType};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::BufReader;

pub async fn run(
    dtype: DType,
    allow_file_urls: bool,
    user_agent: Option<String>,
    max_pending_requests: usize,
    hostname: Option<String>,
    prometheus_port: Option<u16>,
) -> Result<()> {
    let mut config = BackendConfig {
        dtype,
        allow_file_urls,
        ..Default::default()
    };
    if let Some(user_agent) = user_agent {
        config.user_agent = user_agent;
    }

    if let Some(port) = prometheus_port {
        let addr = match hostname.unwrap_or("0.0.0.0".to_string()).parse() {
            Ok(ip) => SocketAddr::new(ip, port),
            Err(_) => {
                tracing::warn!("Invalid hostname, defaulting to 0.0.0.0");
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port)
            }
        };
        prometheus::prometheus_builder(addr)
            .context("Could not configure prometheus exporter")?
            .install()
            .context("Could not start prometheus exporter")?;
        tracing::info!("Serving metrics on {addr}");
    }

    // Initialization runs in the background, requests queue until it is done
    let backend = Backend::new(config).context("Could not create backend")?;

    tracing::info!("Reading requests from STDIN");
    serve(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        backend,
        max_pending_requests,
        shutdown_signal(),
    )
    .await?;

    tracing::info!("Stopped");
    Ok(())
}
