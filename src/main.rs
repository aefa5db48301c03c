use tracing::{error, info};

use keyrelay::lifecycle::{self, shutdown_signal};
use keyrelay::logger;
use keyrelay::Config;

#[tokio::main]
async fn main() {
    // Initialize tracing
    let directives = std::env::var("RUST_LOG").ok();
    tracing_subscriber::fmt()
        .with_env_filter(logger::diagnostic_filter(directives.as_deref()))
        .json()
        .init();

    info!("Starting keyrelay {}", keyrelay::VERSION);

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };
    info!(
        port = config.port,
        state = %config.rotation_state_path.display(),
        cert_dir = %config.cert_dir.display(),
        "Configuration loaded"
    );

    let runtime = match lifecycle::startup(&config).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Startup failed: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    runtime
        .run(async {
            shutdown_signal().await;
            info!("Shutdown signal received");
        })
        .await;
}
