use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use slipstream::engine::Engine;
use slipstream::settings::Settings;
use slipstream::shutdown::install_shutdown_handler;
use slipstream::{http, rpc, watch};

#[derive(Parser, Debug)]
#[command(name = "slipstream")]
#[command(about = "A lightweight continuous integration scheduler")]
struct Args {
    /// Home directory holding cfg/, run/ and archive/ (absolute path)
    #[arg(long, default_value = "/var/lib/slipstream")]
    home: PathBuf,

    /// URL prefix under which archived artifacts are served
    #[arg(long, default_value = "/archive/")]
    archive_url: String,

    /// Listen address for the web front-end
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind_http: SocketAddr,

    /// Listen address for the control endpoint
    #[arg(long, default_value = "127.0.0.1:9997")]
    bind_rpc: SocketAddr,

    /// PostgreSQL connection string
    #[arg(long, default_value = "postgres://localhost/slipstream")]
    database: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::new(
        args.home,
        args.archive_url,
        args.bind_http,
        args.bind_rpc,
        args.database,
    );

    tracing::info!(
        home = %settings.home.display(),
        bind_http = %settings.bind_http,
        bind_rpc = %settings.bind_rpc,
        "Starting slipstream"
    );

    let engine = Engine::new(settings.clone()).await?;

    let _watcher = watch::watch_configuration(engine.clone())?;

    let http_engine = engine.clone();
    tokio::spawn(async move {
        http::run_http(settings.bind_http, http_engine).await;
    });
    let rpc_engine = engine.clone();
    tokio::spawn(async move {
        rpc::run_rpc(settings.bind_rpc, rpc_engine).await;
    });

    let shutdown = install_shutdown_handler();
    shutdown.cancelled().await;

    // Give supervisors a moment to reap signalled children.
    engine.abort_all().await;
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    Ok(())
}
