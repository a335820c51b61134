//! Provider registry and failover chain construction.
//!
//! The registry is a constructed-once value: providers are registered at
//! startup, validated, then only read at request time. Routers hold it by
//! `Arc`, so tests can build as many independently configured registries
//! as they like — there is no ambient global table.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;

use crate::cost;
use crate::provider::Provider;
use crate::tier::Tier;

/// Startup configuration errors. These fail the process before any request
/// is accepted; a tier problem must never surface at request time.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("{0} is declared serviceable but has no registered providers")]
    EmptyTier(Tier),

    #[error("no providers registered")]
    NoProviders,

    #[error("duplicate provider name '{0}'")]
    DuplicateName(String),
}

/// Builder for [`Registry`]. Registration order is preserved and used as
/// the final tie-break within a tier.
pub struct RegistryBuilder {
    providers: Vec<Arc<dyn Provider>>,
    exclude_from_failover: BTreeSet<Tier>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            exclude_from_failover: BTreeSet::new(),
        }
    }

    /// Register a provider under the tier and priority in its spec.
    pub fn register(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Keep `tier` out of failover chains built for *other* tiers.
    /// Requests targeting `tier` directly are unaffected. Used for
    /// specialized tiers (e.g. vision) that should not absorb generic
    /// overflow.
    pub fn exclude_from_failover(mut self, tier: Tier) -> Self {
        self.exclude_from_failover.insert(tier);
        self
    }

    /// Validate and freeze the registry.
    ///
    /// `serviceable_tiers` lists every tier callers are allowed to request;
    /// each must resolve to at least one provider or construction fails.
    pub fn build(self, serviceable_tiers: &[Tier]) -> Result<Registry, RegistryError> {
        if self.providers.is_empty() {
            return Err(RegistryError::NoProviders);
        }

        let mut seen = BTreeSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.spec().name.clone()) {
                return Err(RegistryError::DuplicateName(provider.spec().name.clone()));
            }
        }

        let mut tiers: BTreeMap<Tier, Vec<Arc<dyn Provider>>> = BTreeMap::new();
        for provider in self.providers {
            tiers.entry(provider.spec().tier).or_default().push(provider);
        }
        // Stable sort: equal priorities keep registration order, which
        // makes candidate order deterministic and reproducible in tests.
        for providers in tiers.values_mut() {
            providers.sort_by_key(|p| p.spec().priority);
        }

        for &tier in serviceable_tiers {
            if tiers.get(&tier).map_or(true, |p| p.is_empty()) {
                return Err(RegistryError::EmptyTier(tier));
            }
        }

        Ok(Registry {
            tiers,
            exclude_from_failover: self.exclude_from_failover,
        })
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable tier → ordered-providers mapping.
pub struct Registry {
    tiers: BTreeMap<Tier, Vec<Arc<dyn Provider>>>,
    exclude_from_failover: BTreeSet<Tier>,
}

impl Registry {
    /// Providers of one tier, ordered by (priority, registration order).
    pub fn providers_for(&self, tier: Tier) -> &[Arc<dyn Provider>] {
        self.tiers.get(&tier).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All provider names, for wiring breaker/health state.
    pub fn provider_names(&self) -> Vec<String> {
        self.tiers
            .values()
            .flatten()
            .map(|p| p.spec().name.clone())
            .collect()
    }

    /// Registered tiers in ascending order.
    pub fn tiers(&self) -> impl Iterator<Item = Tier> + '_ {
        self.tiers.keys().copied()
    }

    /// The failover candidate list for a request targeting `from`:
    /// providers of `from` first, then each higher registered tier in
    /// ascending order up to the highest configured tier. The chain never
    /// descends below `from`, and excluded tiers are skipped unless they
    /// are the originating tier.
    pub fn failover_chain(&self, from: Tier) -> Vec<Arc<dyn Provider>> {
        let mut chain = Vec::new();
        for tier in from.ascending() {
            if tier != from && self.exclude_from_failover.contains(&tier) {
                continue;
            }
            if let Some(providers) = self.tiers.get(&tier) {
                chain.extend(providers.iter().cloned());
            }
        }
        chain
    }

    /// Cheapest provider of `tier` by combined per-token rate, used as the
    /// reservation estimation basis.
    pub fn cheapest_in(&self, tier: Tier) -> Option<&Arc<dyn Provider>> {
        self.providers_for(tier)
            .iter()
            .min_by_key(|p| cost::combined_rate(p.spec()))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (tier, providers) in &self.tiers {
            let names: Vec<&str> = providers.iter().map(|p| p.spec().name.as_str()).collect();
            map.entry(&tier.to_string(), &names);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Completion, CompletionRequest, InvokeError, ProviderSpec};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Fake {
        spec: ProviderSpec,
    }

    impl Fake {
        fn arc(name: &str, tier: Tier, priority: u8, rate: Decimal) -> Arc<dyn Provider> {
            Arc::new(Fake {
                spec: ProviderSpec {
                    name: name.into(),
                    tier,
                    priority,
                    input_cost_per_token: rate,
                    output_cost_per_token: rate,
                    invoke_timeout: None,
                    privacy_compatible: false,
                },
            })
        }
    }

    #[async_trait]
    impl Provider for Fake {
        fn spec(&self) -> &ProviderSpec {
            &self.spec
        }

        async fn invoke(&self, _request: &CompletionRequest) -> Result<Completion, InvokeError> {
            unreachable!("registry tests never invoke")
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn names(providers: &[Arc<dyn Provider>]) -> Vec<&str> {
        providers.iter().map(|p| p.spec().name.as_str()).collect()
    }

    #[test]
    fn empty_serviceable_tier_fails_at_build() {
        let err = RegistryBuilder::new()
            .register(Fake::arc("a", Tier::LOCAL, 0, dec!(0)))
            .build(&[Tier::LOCAL, Tier::PREMIUM])
            .err()
            .expect("build must fail");
        assert!(matches!(err, RegistryError::EmptyTier(t) if t == Tier::PREMIUM));
    }

    #[test]
    fn no_providers_fails_at_build() {
        assert!(matches!(
            RegistryBuilder::new().build(&[]),
            Err(RegistryError::NoProviders)
        ));
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = RegistryBuilder::new()
            .register(Fake::arc("a", Tier::LOCAL, 0, dec!(0)))
            .register(Fake::arc("a", Tier::FAST, 0, dec!(0)))
            .build(&[Tier::LOCAL])
            .err()
            .expect("build must fail");
        assert!(matches!(err, RegistryError::DuplicateName(_)));
    }

    #[test]
    fn tier_order_is_priority_then_registration() {
        let registry = RegistryBuilder::new()
            .register(Fake::arc("late-high", Tier::FAST, 2, dec!(0)))
            .register(Fake::arc("first", Tier::FAST, 1, dec!(0)))
            .register(Fake::arc("second", Tier::FAST, 1, dec!(0)))
            .build(&[Tier::FAST])
            .expect("valid registry");
        assert_eq!(
            names(registry.providers_for(Tier::FAST)),
            vec!["first", "second", "late-high"]
        );
    }

    #[test]
    fn failover_chain_ascends_and_never_descends() {
        let registry = RegistryBuilder::new()
            .register(Fake::arc("local", Tier::LOCAL, 0, dec!(0)))
            .register(Fake::arc("fast", Tier::FAST, 0, dec!(0)))
            .register(Fake::arc("premium", Tier::PREMIUM, 0, dec!(0)))
            .build(&[Tier::LOCAL])
            .expect("valid registry");

        assert_eq!(
            names(&registry.failover_chain(Tier::LOCAL)),
            vec!["local", "fast", "premium"]
        );
        // Premium is the terminal fallback: it never falls further down.
        assert_eq!(names(&registry.failover_chain(Tier::PREMIUM)), vec!["premium"]);
        // And a higher-tier request never reaches lower tiers.
        assert_eq!(
            names(&registry.failover_chain(Tier::FAST)),
            vec!["fast", "premium"]
        );
    }

    #[test]
    fn excluded_tier_is_skipped_unless_originating() {
        let registry = RegistryBuilder::new()
            .register(Fake::arc("fast", Tier::FAST, 0, dec!(0)))
            .register(Fake::arc("vision", Tier::VISION, 0, dec!(0)))
            .register(Fake::arc("premium", Tier::PREMIUM, 0, dec!(0)))
            .exclude_from_failover(Tier::VISION)
            .build(&[Tier::FAST, Tier::VISION])
            .expect("valid registry");

        assert_eq!(
            names(&registry.failover_chain(Tier::FAST)),
            vec!["fast", "premium"]
        );
        assert_eq!(
            names(&registry.failover_chain(Tier::VISION)),
            vec!["vision", "premium"]
        );
    }

    #[test]
    fn cheapest_in_picks_lowest_combined_rate() {
        let registry = RegistryBuilder::new()
            .register(Fake::arc("pricey", Tier::FAST, 0, dec!(0.00001)))
            .register(Fake::arc("cheap", Tier::FAST, 1, dec!(0.000001)))
            .build(&[Tier::FAST])
            .expect("valid registry");
        let cheapest = registry.cheapest_in(Tier::FAST).expect("tier populated");
        assert_eq!(cheapest.spec().name, "cheap");
    }
}
