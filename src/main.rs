use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courtside::config::Config;
use courtside::engine::{Engine, EngineOptions};
use courtside::server::{self, ServeOptions};
use courtside::sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("courtside=info")),
        )
        .init();

    let config = Config::from_env()?;
    courtside::observability::init(config.metrics_port)?;

    let tls_acceptor =
        server::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;

    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(Engine::new(
        config.data_dir.join("courtside.wal"),
        EngineOptions {
            unit_minutes: config.unit_minutes,
        },
    )?);

    tokio::spawn(sweeper::run_sweeper(
        engine.clone(),
        config.sweep_interval,
        config.payment_grace,
    ));
    tokio::spawn(sweeper::run_compactor(engine.clone(), config.compact_threshold));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("courtside listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {}", config.max_connections);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  sweeper: every {}s, grace {}s",
        config.sweep_interval.as_secs(),
        config.payment_grace.as_secs()
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    server::serve(
        listener,
        engine,
        ServeOptions {
            password: config.password.clone(),
            tls: tls_acceptor,
            max_connections: config.max_connections,
        },
        server::shutdown_signal(),
    )
    .await;

    info!("courtside stopped");
    Ok(())
}
