//! vsock2http2 binary.
//!
//! Loads the configuration file (if any), applies command-line overrides,
//! then runs the proxy until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use vsock2http2::config::loader::read_config;
use vsock2http2::config::schema::LogFormat;
use vsock2http2::config::{ProxyConfig, TrustConfig, TrustMode};
use vsock2http2::lifecycle::signals::wait_for_shutdown_signal;
use vsock2http2::observability::{logging, metrics};
use vsock2http2::routing::BackendScheme;
use vsock2http2::Proxy;

#[derive(Debug, Parser)]
#[command(name = "vsock2http2", version, about = "gRPC proxy from vsock to an HTTP/2 backend")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "VSOCK2HTTP2_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. `vsock://any:8443` or `tcp://127.0.0.1:8443`.
    #[arg(long)]
    listen: Option<String>,

    /// Backend address, e.g. `https://10.0.0.5:50051`.
    #[arg(long)]
    backend: Option<String>,

    /// Server certificate chain (PEM).
    #[arg(long)]
    cert: Option<String>,

    /// Server private key (PEM).
    #[arg(long)]
    key: Option<String>,

    /// CA bundle used to verify the backend.
    #[arg(long, conflicts_with = "insecure_skip_verify")]
    ca: Option<String>,

    /// Do not verify the backend certificate.
    #[arg(long)]
    insecure_skip_verify: bool,

    /// Seconds in-flight streams get to finish on shutdown.
    #[arg(long)]
    grace_period_secs: Option<u64>,

    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(self, config: &mut ProxyConfig) {
        if let Some(listen) = self.listen {
            config.listener.bind_address = listen;
        }
        if let Some(backend) = self.backend {
            // An unknown scheme is left in the address for validation to reject.
            match backend.split_once("://") {
                Some((scheme, authority)) => match scheme.parse::<BackendScheme>() {
                    Ok(scheme) => {
                        config.backend.scheme = scheme;
                        config.backend.address = authority.to_string();
                    }
                    Err(_) => config.backend.address = backend,
                },
                None => config.backend.address = backend,
            }
        }
        if let Some(cert) = self.cert {
            config.tls.cert_path = cert;
        }
        if let Some(key) = self.key {
            config.tls.key_path = key;
        }
        if let Some(ca) = self.ca {
            config.backend.trust = Some(TrustConfig {
                mode: TrustMode::Verify,
                ca_path: Some(ca),
            });
        }
        if self.insecure_skip_verify {
            config.backend.trust = Some(TrustConfig {
                mode: TrustMode::SkipVerify,
                ca_path: None,
            });
        }
        if let Some(secs) = self.grace_period_secs {
            config.shutdown.grace_period_ms = secs.saturating_mul(1000);
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
        if self.json_logs {
            config.observability.log_format = LogFormat::Json;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match read_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("vsock2http2: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => ProxyConfig::default(),
    };
    cli.apply(&mut config);

    if let Err(e) = logging::init_logging(
        &config.observability.log_level,
        config.observability.log_format,
    ) {
        eprintln!("vsock2http2: failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "vsock2http2 starting");

    let proxy = match Proxy::from_config(config.clone()) {
        Ok(proxy) => proxy,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                    return ExitCode::FAILURE;
                }
            }
            Err(e) => {
                tracing::error!(
                    metrics_address = %config.observability.metrics_address,
                    error = %e,
                    "Failed to parse metrics address"
                );
                return ExitCode::FAILURE;
            }
        }
    }

    let handle = match proxy.start().await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start proxy");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        signal = wait_for_shutdown_signal() => match signal {
            Ok(name) => tracing::info!(signal = name, "Received shutdown signal"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for signals, shutting down"),
        },
        _ = handle.wait() => {}
    }

    handle.stop().await;
    ExitCode::SUCCESS
}
