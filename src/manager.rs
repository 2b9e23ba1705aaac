use std::{collections::HashMap, sync::LazyLock};

use tokio::sync::RwLock;

use crate::channel::{ChannelStatus, VideoChannel};

static CHANNEL_MANAGER: LazyLock<RwLock<HashMap<String, VideoChannel>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Registers a running channel. An existing channel under the same id is
/// shut down first.
pub(crate) async fn add_channel(channel: VideoChannel) {
    let previous = CHANNEL_MANAGER.write().await.insert(channel.id(), channel);
    if let Some(previous) = previous {
        log::warn!("channel {} replaced", previous.id());
        previous.shutdown().await;
    }
}

pub(crate) async fn remove_channel(id: &str) -> bool {
    let removed = CHANNEL_MANAGER.write().await.remove(id);
    match removed {
        Some(channel) => {
            channel.shutdown().await;
            true
        }
        None => false,
    }
}

pub(crate) async fn contains_channel(id: &str) -> bool {
    CHANNEL_MANAGER.read().await.contains_key(id)
}

pub(crate) async fn list_status() -> Vec<ChannelStatus> {
    let channels = CHANNEL_MANAGER.read().await;
    let mut status: Vec<_> = channels.values().map(|c| c.status()).collect();
    status.sort_by(|a, b| a.id.cmp(&b.id));
    status
}

pub(crate) async fn channel_status(id: &str) -> Option<ChannelStatus> {
    CHANNEL_MANAGER.read().await.get(id).map(|c| c.status())
}

/// Channels whose source or pipeline has stopped, with the pipeline's fatal
/// error if it recorded one.
pub(crate) async fn unhealthy_channels() -> Vec<(String, Option<String>)> {
    CHANNEL_MANAGER
        .read()
        .await
        .values()
        .filter(|c| !c.is_healthy())
        .map(|c| (c.id(), c.status().fatal_error))
        .collect()
}

pub(crate) async fn shutdown_all() {
    let channels: Vec<_> = CHANNEL_MANAGER.write().await.drain().collect();
    for (_, channel) in channels {
        channel.shutdown().await;
    }
}
