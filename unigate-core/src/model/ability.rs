//! Ability records: which channel may serve which capability

use super::channel::{Channel, ChannelId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ability {
    pub channel_id: ChannelId,

    /// Capability (model) name as requested by callers
    pub capability: String,
}

impl Ability {
    /// Abilities asserted by a channel's model list
    pub fn for_channel(channel: &Channel) -> Vec<Ability> {
        channel
            .models
            .iter()
            .map(|model| Ability {
                channel_id: channel.id,
                capability: model.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelDraft, ProviderType};
    use chrono::Utc;

    #[test]
    fn test_abilities_follow_model_list() {
        let channel = ChannelDraft::new("c", ProviderType::OpenAI, "k")
            .with_models(["gpt-4o", "gpt-4o", " ", "gpt-4o-mini"])
            .into_channel(3, Utc::now());
        let abilities = Ability::for_channel(&channel);
        assert_eq!(abilities.len(), 2);
        assert!(abilities.iter().all(|a| a.channel_id == 3));
        assert_eq!(abilities[1].capability, "gpt-4o-mini");
    }
}
