pub mod auth;
pub mod broker;
pub mod config;
pub mod db;
pub mod decisions;
pub mod error;
pub mod fanout;
pub mod metrics;
pub mod models;
pub mod protocol;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod routes;
pub mod ttl;

use std::sync::Arc;

use broker::Broker;
use config::Config;
use db::DbError;
use rocket_cors::{AllowedOrigins, CorsOptions};

/// Seconds allowed for in-flight work to settle on graceful shutdown.
const SHUTDOWN_FLUSH_SECS: u64 = 30;

pub fn rocket() -> Result<rocket::Rocket<rocket::Build>, DbError> {
    let config = Config::from_env().unwrap_or_default();
    rocket_with_config(config)
}

pub fn rocket_with_config(config: Config) -> Result<rocket::Rocket<rocket::Build>, DbError> {
    let broker = Broker::init(config.clone())?;

    let allowed_origins = if config.cors_allowed_origins.iter().any(|o| o == "*") {
        AllowedOrigins::all()
    } else {
        AllowedOrigins::some_exact(&config.cors_allowed_origins)
    };
    let cors = CorsOptions {
        allowed_origins,
        ..CorsOptions::default()
    }
    .to_cors()
    .expect("Failed to create CORS");

    // Room-op bodies carry base64 file payloads: 10 MiB binary is ~13.4 MiB
    // of base64 plus the JSON wrapper.
    let figment = rocket::Config::figment()
        .merge(("address", config.bind_addr.clone()))
        .merge(("port", config.port))
        .merge(("limits.json", 16 * 1024 * 1024))
        .merge(("limits.string", 16 * 1024 * 1024))
        .merge(("shutdown.grace", 15u32))
        .merge(("shutdown.mercy", 15u32))
        .merge(("shutdown.signals", vec!["term"]));

    Ok(rocket::custom(figment)
        .manage(broker)
        .attach(cors)
        .register(
            "/",
            rocket::catchers![
                routes::bad_request,
                routes::unprocessable,
                routes::payload_too_large,
                routes::too_many_requests,
                routes::not_found,
            ],
        )
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::status,
                routes::metrics_exposition,
                routes::llms_txt,
                routes::socket::socket,
                routes::send_message,
                routes::fetch_messages,
                routes::ack_message,
                routes::room_op,
                routes::download_file,
                routes::room_summary,
                routes::channel_messages,
                routes::decision_view,
                routes::decision_debate,
                routes::issue_token,
                routes::revoke_token,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Broker Workers",
            |rocket| {
                Box::pin(async move {
                    let broker = rocket
                        .state::<Arc<Broker>>()
                        .expect("broker state")
                        .clone();
                    router::spawn_router(broker.core.clone(), broker.shutdown.subscribe());
                    router::spawn_retry_scheduler(
                        broker.core.clone(),
                        broker.shutdown.subscribe(),
                    );
                    ttl::spawn_cleanup_tasks(
                        broker.config.db_path(),
                        broker.expiry.clone(),
                        broker.shutdown.subscribe(),
                    );
                    tracing::info!("broker workers started");
                })
            },
        ))
        .attach(rocket::fairing::AdHoc::on_shutdown(
            "Graceful Shutdown",
            |rocket| {
                Box::pin(async move {
                    if let Some(broker) = rocket.state::<Arc<Broker>>() {
                        tracing::info!("shutting down: notifying sessions, flushing lanes");
                        broker.begin_shutdown();
                        let flush = broker.fanout.flush();
                        if tokio::time::timeout(
                            std::time::Duration::from_secs(SHUTDOWN_FLUSH_SECS),
                            flush,
                        )
                        .await
                        .is_err()
                        {
                            tracing::warn!("fan-out flush did not finish before the deadline");
                        }
                    }
                })
            },
        )))
}
