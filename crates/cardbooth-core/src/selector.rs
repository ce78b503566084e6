//! Random player selection with a bounded no-repeat history.

use crate::catalog::{Catalog, Gender, PlayerProfile};
use crate::stats::{derive_stats, Attribute, StatBlock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;

/// Number of recent picks excluded from the next selection.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelectError {
    #[error("no players in catalog for {0}")]
    EmptyPool(String),
}

/// History key; ids are only unique within a partition.
type ProfileKey = (Gender, u32);

/// Picks profiles uniformly from the eligible pool, skipping the last
/// [`HISTORY_LIMIT`] picks until the pool runs dry.
pub struct PlayerSelector {
    catalog: Catalog,
    history: VecDeque<ProfileKey>,
    rng: StdRng,
}

impl PlayerSelector {
    pub fn new(catalog: Catalog) -> Self {
        Self::with_rng(catalog, StdRng::from_entropy())
    }

    /// Deterministic selector for tests and replays.
    pub fn seeded(catalog: Catalog, seed: u64) -> Self {
        Self::with_rng(catalog, StdRng::seed_from_u64(seed))
    }

    fn with_rng(catalog: Catalog, rng: StdRng) -> Self {
        Self {
            catalog,
            history: VecDeque::with_capacity(HISTORY_LIMIT + 1),
            rng,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Pick a profile from `gender`'s partition, or from both when unset.
    ///
    /// When every pool member is in the recent history, the history is
    /// cleared and the full pool becomes eligible again.
    pub fn select(&mut self, gender: Option<Gender>) -> Result<PlayerProfile, SelectError> {
        let partitions: Vec<Gender> = match gender {
            Some(g) => vec![g],
            None => Gender::ALL.to_vec(),
        };
        let pool: Vec<(ProfileKey, &PlayerProfile)> = partitions
            .iter()
            .flat_map(|&g| self.catalog.partition(g).iter().map(move |p| ((g, p.id), p)))
            .collect();

        if pool.is_empty() {
            let label = gender.map_or_else(|| "any gender".to_string(), |g| g.to_string());
            return Err(SelectError::EmptyPool(label));
        }

        let mut available: Vec<&(ProfileKey, &PlayerProfile)> =
            pool.iter().filter(|(key, _)| !self.history.contains(key)).collect();
        if available.is_empty() {
            tracing::debug!(
                pool = pool.len(),
                "selection history exhausted the pool; resetting"
            );
            self.history.clear();
            available = pool.iter().collect();
        }

        let &(key, profile) = *available
            .choose(&mut self.rng)
            .ok_or_else(|| SelectError::EmptyPool("pool".into()))?;
        let chosen = profile.clone();

        self.history.push_back(key);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }

        tracing::debug!(
            id = chosen.id,
            name = %chosen.name,
            gender = ?key.0,
            "player selected"
        );
        Ok(chosen)
    }

    /// Derive a fresh stat block from base attributes using the selector's
    /// random source.
    pub fn derive_stats(&mut self, base_stats: &BTreeMap<Attribute, u8>) -> StatBlock {
        derive_stats(base_stats, &mut self.rng)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}
