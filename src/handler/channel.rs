use axum::{Json, Router, extract::Path, routing::get};

use crate::{
    channel::ChannelStatus,
    handler::{ApiError, ApiJsonResult},
    manager,
};

pub fn channel_router() -> Router {
    Router::new()
        .route("/", get(list_channels))
        .route("/{id}", get(get_channel))
}

async fn list_channels() -> Json<Vec<ChannelStatus>> {
    Json(manager::list_status().await)
}

async fn get_channel(Path(id): Path<String>) -> ApiJsonResult<ChannelStatus> {
    manager::channel_status(&id)
        .await
        .map(Json)
        .ok_or(ApiError::NotFound(format!("channel {}", id)))
}
