use axum::{http::StatusCode, routing::get, Router};
use mailrelay_utils::fetch;
use std::io;
use tokio::net::TcpListener;
use tracing::info;

/// Builds the liveness router, every path answers with the same response.
pub fn router() -> Router {
    Router::new().route("/", get(liveness)).fallback(liveness)
}

async fn liveness() -> (StatusCode, &'static str) {
    let response = fetch();
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    (status, response.body)
}

/// Serves the liveness endpoint on `address` until the process exits.
pub async fn serve(address: String) -> io::Result<()> {
    let listener = TcpListener::bind(&address).await?;
    info!(address = %address, "Mailrelay HTTP liveness endpoint running");
    axum::serve(listener, router()).await
}
