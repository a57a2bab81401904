use axum::{routing::get, Json, Router};
use serde_json::json;
use tracing::info;

/// Start the health check HTTP server.
pub async fn start_health_server(bind: &str, port: u16) -> anyhow::Result<()> {
    let app = Router::new().route("/health", get(health_handler));

    let addr: std::net::SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("health server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}
