use clap::Parser;
use server::Server;
use tracing_subscriber::EnvFilter;

mod config;
mod connection;
mod protocol;
mod server;
mod shutdown;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::Config::parse();

    // connect tracing to stdout, RUST_LOG takes precedence over --log-level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let server = Server::bind(&config).await?;
    tracing::info!("Server listening on: {}", server.local_addr()?);

    server.run(shutdown_signal()).await;

    Ok(())
}

/// Resolves once the process receives an interrupt request.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install the interrupt handler: {err}");
        // without a signal handler there is no shutdown request to wait for
        std::future::pending::<()>().await
    }
}
