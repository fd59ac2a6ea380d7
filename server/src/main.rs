//! chunkkv-server: RPC adapter for the chunked key-value store. Terminates
//! the wire protocol and invokes the engine's four operations; the engine
//! itself is a single-owning-thread state machine, serialized here behind
//! a mutex.

mod config;
mod handlers;

use axum::routing::post;
use axum::Router;
use chunkkv_engine::Engine;
use clap::Parser;
use std::sync::{Arc, Mutex};
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_target(false).compact().init();

    let config = config::Config::parse();

    info!("=== chunkkv server ===");
    info!("data dir:   {}", config.data_dir.display());
    info!("cache size: {}", config.cache_size);
    info!("wrt op:     {}", config.wrt_op);

    let engine = Engine::open(&config.data_dir, config.cache_size, config.wrt_op)
        .expect("failed to open engine (corrupt store or I/O failure)");
    let state: handlers::SharedEngine = Arc::new(Mutex::new(engine));

    let app = Router::new()
        .route("/get", post(handlers::get))
        .route("/put", post(handlers::put))
        .route("/cput", post(handlers::cput))
        .route("/delete", post(handlers::delete))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    info!("listening on http://{}", config.listen);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .expect("failed to bind listen address");
    axum::serve(listener, app).await.expect("server error");
}
