//! Ability lookup and channel choice
//!
//! Candidates are split into priority tiers; the highest tier that still has a
//! channel not yet tried in this request wins, and inside a tier channels are
//! drawn with probability proportional to their weight.

use super::error::RelayError;
use crate::model::{Channel, ChannelId};
use crate::store::ChannelStore;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Pick from the best tier of `candidates` that still has untried channels
pub fn select_weighted<'a, R: Rng + ?Sized>(
    candidates: &'a [Channel],
    excluded: &HashSet<ChannelId>,
    rng: &mut R,
) -> Option<&'a Channel> {
    let remaining: Vec<&Channel> = candidates
        .iter()
        .filter(|channel| !excluded.contains(&channel.id))
        .collect();
    let top = remaining.iter().map(|channel| channel.priority).max()?;
    let tier: Vec<&Channel> = remaining
        .into_iter()
        .filter(|channel| channel.priority == top)
        .collect();

    tier.choose_weighted(rng, |channel| channel.effective_weight())
        .ok()
        .copied()
}

pub struct ChannelSelector {
    store: Arc<dyn ChannelStore>,
    rng: Mutex<StdRng>,
}

impl ChannelSelector {
    pub fn new(store: Arc<dyn ChannelStore>) -> Self {
        Self {
            store,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic selection for tests and replays
    pub fn with_seed(store: Arc<dyn ChannelStore>, seed: u64) -> Self {
        Self {
            store,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Enabled channels with a credential that serve `capability`, ordered by id
    pub async fn candidates_for(&self, capability: &str) -> Result<Vec<Channel>, RelayError> {
        let mut candidates: Vec<Channel> = self
            .store
            .channels_for_capability(capability)
            .await?
            .into_iter()
            .filter(Channel::is_eligible)
            .collect();

        if candidates.is_empty() {
            return Err(RelayError::no_eligible_channel(capability));
        }
        candidates.sort_by_key(|channel| channel.id);
        debug!("{} candidate channel(s) for '{}'", candidates.len(), capability);
        Ok(candidates)
    }

    pub fn select_next(
        &self,
        candidates: &[Channel],
        excluded: &HashSet<ChannelId>,
    ) -> Option<Channel> {
        let mut rng = self.rng.lock();
        select_weighted(candidates, excluded, &mut *rng).cloned()
    }
}

impl std::fmt::Debug for ChannelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSelector").finish_non_exhaustive()
    }
}
