use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use bytes::Bytes;
use clap::Parser;
use envoy_types::pb::envoy::service::ext_proc::v3::external_processor_server::ExternalProcessorServer;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, UnixListener};
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{error, info, warn};

use tollgate::metrics::Metrics;
use tollgate::server::ExtProcService;
use tollgate::watcher::{start_config_watcher, DEFAULT_POLL_INTERVAL};

#[derive(Parser, Debug)]
#[command(name = "tollgate", about = "External processor routing and metering LLM API traffic")]
struct Flags {
    /// Path to the YAML configuration file. The file is watched for changes.
    #[arg(long = "configPath")]
    config_path: PathBuf,

    /// gRPC listen address, e.g. ":1063" or "unix:///tmp/ext_proc.sock".
    #[arg(long = "extProcAddr", default_value = ":1063")]
    ext_proc_addr: String,

    /// Log level. One of 'debug', 'info', 'warn', or 'error'.
    #[arg(long = "logLevel", default_value = "info")]
    log_level: String,

    /// Listen address for Prometheus metrics.
    #[arg(long = "promPort", default_value = ":9190")]
    prom_port: String,
}

enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

fn parse_listen_addr(addr: &str) -> Result<ListenAddr, String> {
    if let Some(path) = addr.strip_prefix("unix://") {
        return Ok(ListenAddr::Unix(PathBuf::from(path)));
    }
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    normalized
        .parse()
        .map(ListenAddr::Tcp)
        .map_err(|e| format!("invalid listen address {addr:?}: {e}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let flags = Flags::parse();

    let level: tracing::Level = match flags.log_level.parse() {
        Ok(level) => level,
        Err(_) => {
            eprintln!("invalid log level {:?}", flags.log_level);
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!(
        address = flags.ext_proc_addr.as_str(),
        config_path = %flags.config_path.display(),
        prom_port = flags.prom_port.as_str(),
        "starting external processor"
    );

    let ext_proc_addr = match parse_listen_addr(&flags.ext_proc_addr) {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = e.as_str(), "failed to parse extProcAddr");
            return ExitCode::FAILURE;
        }
    };
    let prom_addr = match parse_listen_addr(&flags.prom_port) {
        Ok(ListenAddr::Tcp(addr)) => addr,
        _ => {
            error!(prom_port = flags.prom_port.as_str(), "promPort must be a TCP address");
            return ExitCode::FAILURE;
        }
    };

    let service = ExtProcService::new();
    if let Err(e) = start_config_watcher(
        flags.config_path.clone(),
        service.clone(),
        DEFAULT_POLL_INTERVAL,
    ) {
        error!(error = %e, "failed to load initial configuration");
        return ExitCode::FAILURE;
    }

    tokio::spawn(serve_metrics(prom_addr));

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<ExternalProcessorServer<ExtProcService>>()
        .await;

    let router = Server::builder()
        .add_service(health_service)
        .add_service(ExternalProcessorServer::new(service));

    let served = match ext_proc_addr {
        ListenAddr::Tcp(addr) => router.serve_with_shutdown(addr, shutdown_signal()).await,
        ListenAddr::Unix(path) => {
            let listener = match UnixListener::bind(&path) {
                Ok(listener) => listener,
                Err(e) => {
                    error!(error = %e, path = %path.display(), "failed to bind unix socket");
                    return ExitCode::FAILURE;
                }
            };
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown_signal())
                .await
        }
    };

    match served {
        Ok(()) => {
            info!("external processor stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "gRPC server failed");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutdown signal received, draining streams");
}

/// Prometheus text exposition on `GET /metrics`.
async fn serve_metrics(addr: SocketAddr) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind metrics listener");
            return;
        }
    };
    info!(%addr, "serving metrics");
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "metrics accept error");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                let response = if req.uri().path() == "/metrics" {
                    Response::builder()
                        .status(StatusCode::OK)
                        .header("content-type", "text/plain; version=0.0.4")
                        .body(Full::new(Bytes::from(Metrics::get_or_create().render())))
                } else {
                    Response::builder()
                        .status(StatusCode::NOT_FOUND)
                        .body(Full::new(Bytes::new()))
                };
                Ok::<_, Infallible>(response.unwrap_or_default())
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                warn!(error = %e, "metrics connection error");
            }
        });
    }
}
