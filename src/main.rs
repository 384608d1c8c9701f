mod config;
mod db;
mod errors;
mod models;
mod routes;
mod store;
mod sync;
mod youtube;

use std::error::Error;

use axum::routing::{get, post};
use axum::Router;
use axum_prometheus::PrometheusMetricLayer;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::YoutubeConfig;
use crate::db::init_db;
use crate::routes::{health_check, process_video, run_channel_sync, sync_history, video_status};
use crate::youtube::YoutubeClient;

#[derive(Clone)]
pub struct InnerState {
    pub db: PgPool,
    pub youtube: YoutubeClient,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api_creatorhub=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let youtube_config = YoutubeConfig::from_env()?;
    let db = init_db().await?;

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let app_state = InnerState {
        db,
        youtube: YoutubeClient::new(youtube_config),
    };

    let app = Router::new()
        .route("/sync/channels", post(run_channel_sync))
        .route("/sync/history", get(sync_history))
        .route("/videos/process", post(process_video).get(process_video))
        .route("/videos/:video_id", get(video_status))
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .route("/health", get(health_check))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(prometheus_layer)
        .with_state(app_state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3001".to_string());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("Could not initialize TcpListener");

    tracing::debug!(
        "listening on {}",
        listener
            .local_addr()
            .expect("Could not convert listener address to local address")
    );

    axum::serve(listener, app)
        .await
        .expect("Could not successfully connect");

    Ok(())
}
