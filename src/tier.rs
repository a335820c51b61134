//! Cost/latency tiers for LLM providers.
//!
//! A tier is an ordered integer grouping key over providers: 0 is the
//! cheapest/local class, 4 the most expensive/batch class. Failover walks
//! tiers in ascending order, so ordering is load-bearing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Highest tier number the registry accepts.
pub const MAX_TIER: u8 = 4;

/// An ordered cost/latency class of providers.
///
/// Tiers are plain integers 0–4 rather than named variants so that failover
/// order ("this tier, then every higher tier") is a numeric range walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Tier(u8);

impl Tier {
    /// Local/free models.
    pub const LOCAL: Tier = Tier(0);
    /// Cheap hosted models.
    pub const FAST: Tier = Tier(1);
    /// Vision-capable models.
    pub const VISION: Tier = Tier(2);
    /// Premium frontier models — the conventional terminal fallback.
    pub const PREMIUM: Tier = Tier(3);
    /// Batch/offline processing.
    pub const BATCH: Tier = Tier(4);

    /// Create a tier, rejecting numbers above [`MAX_TIER`].
    pub fn new(n: u8) -> Option<Tier> {
        (n <= MAX_TIER).then_some(Tier(n))
    }

    /// The tier number.
    pub fn number(self) -> u8 {
        self.0
    }

    /// Tiers from `self` up to and including [`MAX_TIER`], ascending.
    pub fn ascending(self) -> impl Iterator<Item = Tier> {
        (self.0..=MAX_TIER).map(Tier)
    }

    /// Default invocation deadline for providers in this tier.
    ///
    /// Cheap tiers get short deadlines, batch gets minutes. Individual
    /// providers may override via [`crate::provider::ProviderSpec`].
    pub fn default_invoke_timeout(self) -> Duration {
        match self.0 {
            0 | 1 => Duration::from_secs(10),
            2 => Duration::from_secs(30),
            3 => Duration::from_secs(60),
            _ => Duration::from_secs(300),
        }
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Tier::new(n).ok_or_else(|| format!("tier {} out of range (0-{})", n, MAX_TIER))
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> u8 {
        tier.0
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tier-{}", self.0)
    }
}
