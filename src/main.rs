use std::process::ExitCode;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ponder_engine::config::Config;
use ponder_engine::engine::Engine;
use ponder_engine::handler::HandlerRegistry;
use ponder_engine::store::schema::{TableSchema, UserSchema};

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ponder.config.json".to_string());
    let config = match Config::from_file(&config_path) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, path = %config_path, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    // The compiled schema normally arrives from the schema builder; the
    // standalone binary reads its JSON form when present.
    let schema = match std::fs::read_to_string("ponder.schema.json") {
        Ok(raw) => match serde_json::from_str::<Vec<TableSchema>>(&raw)
            .map_err(|e| e.to_string())
            .and_then(|tables| UserSchema::new(tables).map_err(|e| e.to_string()))
        {
            Ok(schema) => schema,
            Err(error) => {
                error!(%error, "invalid ponder.schema.json");
                return ExitCode::from(1);
            }
        },
        Err(_) => UserSchema::default(),
    };

    let handlers = HandlerRegistry::new("standalone");
    let engine = match Engine::new(config, schema, handlers) {
        Ok(engine) => engine,
        Err(error) => {
            error!(%error, "engine construction failed");
            return ExitCode::from(1);
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    match engine.run(shutdown).await {
        Ok(()) => {
            info!("clean stop");
            ExitCode::from(0)
        }
        Err(error) => {
            let code = error.exit_code();
            error!(%error, code, "engine stopped with an error");
            ExitCode::from(code as u8)
        }
    }
}
