//! Channel failure tracking and auto-disable

use crate::config::HealthConfig;
use crate::model::{Channel, ChannelStatus};
use crate::store::ChannelStore;
use std::sync::Arc;
use tracing::{error, warn};

pub struct ChannelHealth {
    store: Arc<dyn ChannelStore>,
    config: HealthConfig,
}

impl ChannelHealth {
    pub fn new(store: Arc<dyn ChannelStore>, config: HealthConfig) -> Self {
        Self { store, config }
    }

    /// Count a channel-local failure. Returns `true` if this call disabled the channel.
    ///
    /// Store errors are logged rather than returned: health bookkeeping never
    /// changes the outcome of the request that triggered it.
    pub async fn record_failure(&self, channel: &Channel) -> bool {
        let failures = match self.store.record_failure(channel.id).await {
            Ok(failures) => failures,
            Err(e) => {
                error!("Failed to record failure of channel {}: {}", channel.id, e);
                return false;
            }
        };

        if !self.config.auto_disable || failures < self.config.failure_threshold {
            return false;
        }

        match self
            .store
            .compare_and_set_status(channel.id, ChannelStatus::Enabled, ChannelStatus::AutoDisabled)
            .await
        {
            Ok(true) => {
                warn!(
                    "Channel {} ({}) auto-disabled after {} consecutive failures",
                    channel.id, channel.name, failures
                );
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!("Failed to auto-disable channel {}: {}", channel.id, e);
                false
            }
        }
    }

    pub async fn record_success(&self, channel: &Channel) {
        if let Err(e) = self.store.reset_failures(channel.id).await {
            error!("Failed to reset failures of channel {}: {}", channel.id, e);
        }
    }
}

impl std::fmt::Debug for ChannelHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHealth")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelDraft, ProviderType};
    use crate::store::MemoryStore;

    async fn setup(config: HealthConfig) -> (Arc<MemoryStore>, ChannelHealth, Channel) {
        let store = Arc::new(MemoryStore::new());
        let ids = store
            .insert_channels(vec![
                ChannelDraft::new("a", ProviderType::OpenAI, "sk-a").with_models(["m"]),
            ])
            .await
            .unwrap();
        let channel = store.get_channel(ids[0]).await.unwrap().unwrap();
        (store.clone(), ChannelHealth::new(store, config), channel)
    }

    #[tokio::test]
    async fn test_threshold_disables_once() {
        let (store, health, channel) = setup(HealthConfig {
            auto_disable: true,
            failure_threshold: 2,
        })
        .await;

        assert!(!health.record_failure(&channel).await);
        assert!(health.record_failure(&channel).await);
        assert!(!health.record_failure(&channel).await);

        let stored = store.get_channel(channel.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChannelStatus::AutoDisabled);
        assert!(store.channels_for_capability("m").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let (store, health, channel) = setup(HealthConfig {
            auto_disable: true,
            failure_threshold: 2,
        })
        .await;

        health.record_failure(&channel).await;
        health.record_success(&channel).await;
        assert!(!health.record_failure(&channel).await);
        let stored = store.get_channel(channel.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChannelStatus::Enabled);
        assert_eq!(stored.failure_count, 1);
    }

    #[tokio::test]
    async fn test_manual_disable_is_not_overwritten() {
        let (store, health, channel) = setup(HealthConfig {
            auto_disable: true,
            failure_threshold: 1,
        })
        .await;
        store
            .set_status(channel.id, ChannelStatus::ManuallyDisabled)
            .await
            .unwrap();

        assert!(!health.record_failure(&channel).await);
        let stored = store.get_channel(channel.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChannelStatus::ManuallyDisabled);
    }

    #[tokio::test]
    async fn test_auto_disable_off() {
        let (store, health, channel) = setup(HealthConfig {
            auto_disable: false,
            failure_threshold: 1,
        })
        .await;
        assert!(!health.record_failure(&channel).await);
        let stored = store.get_channel(channel.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChannelStatus::Enabled);
    }
}
