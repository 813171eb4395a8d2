use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use holdfast::app::{App, Collaborators};
use holdfast::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    holdfast::observability::init(config.metrics_port)?;

    let deps = Collaborators::from_config(&config)?;
    let app = App::start(&config, deps)?;

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("holdfast listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  hold: {}s, sweep every {}s", config.hold_duration.as_secs(), config.sweep_interval.as_secs());
    info!("  gateway: {}", config.gateway.as_ref().map_or("in-memory", |g| g.url.as_str()));
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    app.serve(listener, shutdown_signal()).await?;
    info!("holdfast stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("cannot register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received");
}
