use std::time::Duration;

use extproc::{admin, build_processor, serve, AppConfig};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Reads RUST_LOG, defaults to info.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env()?;
    let processor = build_processor(&config);
    let shutdown = CancellationToken::new();

    let admin_task = match config.admin_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await?;
            tracing::info!("admin listening on {}", addr);
            let app = admin::router(processor.clone());
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { token.cancelled().await })
                    .await
            }))
        }
        None => {
            tracing::info!("admin server disabled");
            None
        }
    };

    let mut grpc = tokio::spawn(serve(processor, config.grpc_addr.clone(), shutdown.clone()));

    // a server that fails to start ends the process without waiting for a signal
    let early = tokio::select! {
        _ = shutdown_signal() => None,
        res = &mut grpc => Some(res),
    };
    shutdown.cancel();

    // in-flight streams get a bounded amount of time to finish
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let result = match early {
        Some(res) => res,
        None => match tokio::time::timeout(grace, grpc).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!(
                    grace_secs = config.shutdown_grace_secs,
                    "gRPC server did not stop within the grace period"
                );
                Ok(Ok(()))
            }
        },
    };
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(format!("{err:#}").into()),
        Err(err) => return Err(err.into()),
    }
    if let Some(task) = admin_task {
        if let Ok(Ok(Err(err))) = tokio::time::timeout(grace, task).await {
            tracing::warn!(error = %err, "admin server stopped with an error");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
