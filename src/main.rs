use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use agent_bus::config::{Config, LogFormat};

// Exit codes: 0 clean shutdown, 1 fatal config error, 2 persistence init
// failure, 130 SIGINT.

#[rocket::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal config error: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config);

    let rocket = match agent_bus::rocket_with_config(config) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("persistence init failed: {e}");
            std::process::exit(2);
        }
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::SeqCst);
            }
        });
    }

    match rocket.launch().await {
        Ok(_) => {
            if interrupted.load(Ordering::SeqCst) {
                std::process::exit(130);
            }
        }
        Err(e) => {
            tracing::error!("launch failed: {e}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
