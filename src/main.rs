#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]
use banter::db::init_db;
use banter::logging::turn_id_middleware;
use banter::provider::ProviderClient;
use banter::*;

use axum::{middleware, routing::get, routing::post, Router};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "banter=debug".into(),
    };

    // File logging alongside the console
    let file_appender = tracing_appender::rolling::daily(".", "banter.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_error::ErrorLayer::default())
        .init();

    banter::logging::setup_panic_hook();

    let args = Arc::new(Args::parse());

    let db = match init_db(&args.database).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let api_key = match std::env::var("BANTER_API_KEY") {
        Ok(k) if !k.is_empty() => k,
        _ => {
            eprintln!("Error: BANTER_API_KEY environment variable is missing or empty.");
            eprintln!("Please set it in your .env file or environment.");
            std::process::exit(1);
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(std::time::Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(std::time::Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let provider = ProviderClient::new(
        client,
        api_key,
        args.provider_base_url.clone(),
        args.model.clone(),
    );

    let (tx_realtime, _) = broadcast::channel(256);

    let state = Arc::new(AppState::new(provider, db, tx_realtime, args.clone()));

    // Browser clients sit on other origins; the relay is the CORS boundary.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/v1/chat", post(banter::relay::chat_handler))
        .route(
            "/v1/sessions",
            get(banter::sessions::list_sessions_handler)
                .post(banter::sessions::create_session_handler),
        )
        .route(
            "/v1/sessions/:id",
            axum::routing::patch(banter::sessions::update_session_handler)
                .delete(banter::sessions::delete_session_handler),
        )
        .route(
            "/v1/sessions/:id/messages",
            get(banter::sessions::list_messages_handler),
        )
        .route(
            "/v1/sessions/:id/metadata",
            post(banter::metadata::metadata_handler),
        )
        .route(
            "/v1/profiles/:id",
            get(banter::sessions::get_profile_handler).put(banter::sessions::put_profile_handler),
        )
        .route("/v1/realtime", get(banter::realtime::realtime_handler))
        .route("/health", get(banter::health::liveness))
        .route("/readyz", get(banter::health::readiness))
        .route("/admin/session/:id", get(banter::health::admin_session))
        .layer(axum::extract::DefaultBodyLimit::max(args.max_body_size))
        .layer(middleware::from_fn(turn_id_middleware))
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Banter listening on {}", addr);
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    {
        tracing::error!("Server error: {}", e);
    }
}
