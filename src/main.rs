use std::path::PathBuf;
use std::sync::Arc;

use hearth_engine::push::{NoopPushNotifier, PushNotifier, WebhookPushNotifier};
use hearth_server::auth::SqliteAuthVerifier;
use hearth_server::ServerConfig;
use hearth_store::Database;
use hearth_telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() {
    init_telemetry(&TelemetryConfig {
        json: std::env::var("HEARTH_LOG_JSON").is_ok(),
        ..Default::default()
    });

    tracing::info!("starting hearth server");

    let data_dir = dirs_home().join(".hearth").join("database");
    std::fs::create_dir_all(&data_dir).expect("failed to create database directory");
    let db_path = data_dir.join("hearth.db");

    let db = Database::open(&db_path).expect("failed to open database");
    tracing::info!(path = %db_path.display(), "database opened");

    let verifier = Arc::new(SqliteAuthVerifier::new(db.clone()));

    let push: Arc<dyn PushNotifier> = match std::env::var("HEARTH_PUSH_ENDPOINT") {
        Ok(endpoint) => {
            tracing::info!(endpoint = %endpoint, "push notifications enabled");
            Arc::new(WebhookPushNotifier::new(endpoint))
        }
        Err(_) => Arc::new(NoopPushNotifier),
    };

    let mut config = ServerConfig::default();
    if let Ok(port) = std::env::var("HEARTH_PORT") {
        config.port = port.parse().expect("HEARTH_PORT must be a port number");
    }
    let port = config.port;

    let _handle = hearth_server::start(config, db, verifier, push)
        .await
        .expect("failed to start server");

    tracing::info!(port = port, "hearth server ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
