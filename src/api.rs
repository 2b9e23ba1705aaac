use std::net::SocketAddr;

use anyhow::Context;
use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) fn api_router() -> Router {
    Router::new()
        .route("/", get(index))
        .nest("/channels", crate::handler::channel::channel_router())
}

pub(crate) async fn start_api_server(
    addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding api server on {}", addr))?;
    log::info!("API server started on {}", addr);
    Ok(tokio::spawn(serve(listener, cancel)))
}

async fn serve(listener: TcpListener, cancel: CancellationToken) {
    if let Err(e) = axum::serve(listener, api_router())
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
    {
        log::error!("API server error: {}", e);
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}

async fn index() -> &'static str {
    "geomux"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_routes() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, cancel.clone()));

        let base = format!("http://{}", addr);
        let list: Vec<serde_json::Value> = reqwest::get(format!("{}/channels", base))
            .await?
            .json()
            .await?;
        // other tests in this binary may have channels registered
        assert!(list.iter().all(|channel| channel["id"].is_string()));

        let missing = reqwest::get(format!("{}/channels/video9_9", base)).await?;
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        cancel.cancel();
        server.await?;
        Ok(())
    }
}
