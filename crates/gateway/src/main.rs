use taskline_gateway::config::{GatewayConfig, StartupError};
use taskline_gateway::http;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run().await {
        eprintln!("STARTUP_ERROR {}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = GatewayConfig::load()?;
    let bind_addr = config.bind_addr;
    let app = http::router(config).await?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|err| StartupError {
            code: "ERR_BIND_FAILED",
            message: format!("failed to bind {}: {}", bind_addr, err),
        })?;

    tracing::info!(bind_addr = %bind_addr, "taskline-gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| StartupError {
            code: "ERR_SERVER_FAILED",
            message: err.to_string(),
        })
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested; draining connections");
}
