//! The routing core: admission, candidate selection, tiered failover.
//!
//! One `route` call is: estimate → reserve budget → walk the failover
//! chain → settle (or release) → emit one [`RouteEvent`]. The failover
//! loop is value-driven — every per-provider outcome is a tagged record,
//! and a candidate failure moves on to the next candidate instead of
//! propagating. Only the aggregate (`AllProvidersFailed`) or a definitive
//! admission rejection reaches the caller.
//!
//! Skip checks are ordered cheapest-first: the circuit breaker (a mutex
//! lookup) runs before the health monitor (a possible network probe), and
//! both run before the invocation itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::breaker::{BreakerConfig, CircuitBreakerSet, CircuitState};
use crate::cost;
use crate::error::RouteError;
use crate::events::{AttemptOutcome, AttemptRecord, EventSink, RouteEvent};
use crate::health::{HealthConfig, HealthMonitor};
use crate::ledger::{BudgetLedger, Period, ReservationGuard};
use crate::provider::{Completion, CompletionRequest, Provider};
use crate::registry::Registry;
use crate::tier::Tier;

/// Router tuning.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// The budget window admission checks run against.
    pub enforcement_period: Period,
    /// Output-token assumption for estimates when a request carries no
    /// `max_tokens` cap.
    pub output_token_allowance: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enforcement_period: Period::Daily,
            output_token_allowance: 4096,
        }
    }
}

/// One routing request: who is asking, what class of model, under what
/// constraints.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// Budget subject (user, team, or tenant key).
    pub subject: String,
    /// Requested tier; failover may serve from a higher one.
    pub tier: Tier,
    /// Restrict candidates to privacy-compatible providers.
    pub privacy: bool,
    pub completion: CompletionRequest,
}

/// A served completion with routing and billing metadata.
#[derive(Debug, Clone, Serialize)]
pub struct RouteResponse {
    pub completion: Completion,
    pub provider: String,
    pub requested_tier: Tier,
    pub served_tier: Tier,
    pub cost: Decimal,
    #[serde(skip)]
    pub latency: Duration,
}

/// Ties the admission ledger, circuit breakers, health monitor, and
/// registry into the single entry point [`Router::route`].
pub struct Router {
    registry: Arc<Registry>,
    ledger: Arc<BudgetLedger>,
    breakers: CircuitBreakerSet,
    health: HealthMonitor,
    events: Arc<dyn EventSink>,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        ledger: Arc<BudgetLedger>,
        breaker_config: BreakerConfig,
        health_config: HealthConfig,
        events: Arc<dyn EventSink>,
        config: RouterConfig,
    ) -> Self {
        let breakers = CircuitBreakerSet::new(breaker_config, registry.provider_names());
        Self {
            registry,
            ledger,
            breakers,
            health: HealthMonitor::new(health_config),
            events,
            config,
        }
    }

    /// Route one completion request through admission and failover.
    pub async fn route(&self, request: RouteRequest) -> Result<RouteResponse, RouteError> {
        let started = Instant::now();
        let requested_tier = request.tier;

        // Estimation basis: the cheapest provider of the requested tier.
        // A missing tier is a configuration gap, reported as such.
        let Some(basis) = self.registry.cheapest_in(requested_tier) else {
            let err = RouteError::UnconfiguredTier(requested_tier);
            self.emit_failure(&request, started, &err, Vec::new());
            return Err(err);
        };
        let estimated = cost::estimate_request_cost(
            basis.spec(),
            &request.completion,
            self.config.output_token_allowance,
        );

        let reservation = match self
            .ledger
            .reserve(&request.subject, self.config.enforcement_period, estimated)
            .await
        {
            Ok(reservation) => reservation,
            Err(err) => {
                let err = RouteError::Ledger(err);
                self.emit_failure(&request, started, &err, Vec::new());
                return Err(err);
            }
        };
        let guard = ReservationGuard::new(Arc::clone(&self.ledger), reservation);

        let candidates: Vec<Arc<dyn Provider>> = self
            .registry
            .failover_chain(requested_tier)
            .into_iter()
            .filter(|p| !request.privacy || p.spec().privacy_compatible)
            .collect();

        if candidates.is_empty() {
            self.release_quietly(guard).await;
            let err = RouteError::NoPrivacyCompatibleProvider { requested_tier };
            self.emit_failure(&request, started, &err, Vec::new());
            return Err(err);
        }

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        for candidate in candidates {
            let spec = candidate.spec();
            let name = spec.name.clone();

            // The permit is held across the invoke; if this future is
            // dropped mid-attempt (caller cancellation) its drop records
            // the failure, so a half-open probe can never be stranded.
            let Some(permit) = self.breakers.allow(&name) else {
                attempts.push(AttemptRecord {
                    provider: name,
                    tier: spec.tier,
                    outcome: AttemptOutcome::CircuitOpen,
                });
                continue;
            };
            if !self.health.is_healthy(candidate.as_ref()).await {
                permit.skip();
                attempts.push(AttemptRecord {
                    provider: name,
                    tier: spec.tier,
                    outcome: AttemptOutcome::Unhealthy,
                });
                continue;
            }

            debug!(provider = %name, tier = %spec.tier, "invoking candidate");
            let deadline = spec.effective_timeout();
            match tokio::time::timeout(deadline, candidate.invoke(&request.completion)).await {
                Ok(Ok(completion)) => {
                    permit.success();
                    let actual = cost::invocation_cost(
                        spec,
                        completion.input_tokens,
                        completion.output_tokens,
                    );
                    if let Err(err) = guard.settle(actual).await {
                        // The completion was served; billing drift is an
                        // operational problem, not the caller's.
                        error!(
                            provider = %name,
                            subject = %request.subject,
                            cost = %actual,
                            error = %err,
                            "failed to settle reservation for served request"
                        );
                    }
                    attempts.push(AttemptRecord {
                        provider: name.clone(),
                        tier: spec.tier,
                        outcome: AttemptOutcome::Served,
                    });
                    let latency = started.elapsed();
                    let response = RouteResponse {
                        completion,
                        provider: name.clone(),
                        requested_tier,
                        served_tier: spec.tier,
                        cost: actual,
                        latency,
                    };
                    info!(
                        provider = %name,
                        requested_tier = %requested_tier,
                        served_tier = %spec.tier,
                        cost = %actual,
                        latency_ms = latency.as_millis() as u64,
                        "request served"
                    );
                    self.events.route_completed(&RouteEvent {
                        subject: request.subject.clone(),
                        requested_tier,
                        served_tier: Some(spec.tier),
                        provider: Some(name),
                        cost: Some(actual),
                        latency_ms: latency.as_millis() as u64,
                        success: true,
                        failure: None,
                        attempts,
                    });
                    return Ok(response);
                }
                Ok(Err(err)) => {
                    permit.failure();
                    debug!(provider = %name, error = %err, "candidate failed; trying next");
                    attempts.push(AttemptRecord {
                        provider: name,
                        tier: spec.tier,
                        outcome: AttemptOutcome::Failed(err.to_string()),
                    });
                }
                Err(_) => {
                    permit.failure();
                    debug!(provider = %name, deadline_ms = deadline.as_millis() as u64, "candidate timed out; trying next");
                    attempts.push(AttemptRecord {
                        provider: name,
                        tier: spec.tier,
                        outcome: AttemptOutcome::TimedOut,
                    });
                }
            }
        }

        self.release_quietly(guard).await;
        let err = RouteError::AllProvidersFailed { attempts };
        self.emit_failure(&request, started, &err, attempt_records(&err));
        Err(err)
    }

    /// Circuit state for one provider, for the admin surface.
    pub fn circuit_state(&self, provider: &str) -> Option<CircuitState> {
        self.breakers.state(provider)
    }

    /// (provider, circuit state) for every registered provider.
    pub fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        self.registry
            .provider_names()
            .into_iter()
            .filter_map(|name| self.breakers.state(&name).map(|s| (name, s)))
            .collect()
    }

    /// Drop the cached health record so the next route re-probes
    /// `provider`. Returns false when no such provider is registered.
    pub fn invalidate_health(&self, provider: &str) -> bool {
        if self.registry.provider_names().iter().any(|n| n == provider) {
            self.health.invalidate(provider);
            true
        } else {
            false
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    async fn release_quietly(&self, guard: ReservationGuard) {
        if let Err(err) = guard.release().await {
            error!(error = %err, "failed to release reservation");
        }
    }

    fn emit_failure(
        &self,
        request: &RouteRequest,
        started: Instant,
        err: &RouteError,
        attempts: Vec<AttemptRecord>,
    ) {
        self.events.route_completed(&RouteEvent {
            subject: request.subject.clone(),
            requested_tier: request.tier,
            served_tier: None,
            provider: None,
            cost: None,
            latency_ms: started.elapsed().as_millis() as u64,
            success: false,
            failure: Some(failure_label(err)),
            attempts,
        });
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("registry", &self.registry)
            .field("breakers", &self.breakers)
            .field("config", &self.config)
            .finish()
    }
}

fn failure_label(err: &RouteError) -> String {
    match err {
        RouteError::Ledger(inner) => format!("ledger: {inner}"),
        RouteError::UnconfiguredTier(_) => "unconfigured_tier".to_string(),
        RouteError::NoPrivacyCompatibleProvider { .. } => "no_privacy_compatible".to_string(),
        RouteError::AllProvidersFailed { .. } => "all_providers_failed".to_string(),
    }
}

fn attempt_records(err: &RouteError) -> Vec<AttemptRecord> {
    match err {
        RouteError::AllProvidersFailed { attempts } => attempts.clone(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingSink;
    use crate::ledger::store::MemoryStore;
    use crate::ledger::LedgerConfig;
    use crate::provider::{InvokeError, ProviderSpec};
    use crate::registry::RegistryBuilder;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        spec: ProviderSpec,
        fail_first: u32,
        invocations: AtomicU32,
    }

    impl Scripted {
        fn arc(name: &str, tier: Tier, fail_first: u32, privacy: bool) -> Arc<Scripted> {
            Arc::new(Scripted {
                spec: ProviderSpec {
                    name: name.into(),
                    tier,
                    priority: 0,
                    input_cost_per_token: dec!(0.000001),
                    output_cost_per_token: dec!(0.000002),
                    invoke_timeout: None,
                    privacy_compatible: privacy,
                },
                fail_first,
                invocations: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for Scripted {
        fn spec(&self) -> &ProviderSpec {
            &self.spec
        }

        async fn invoke(&self, _request: &CompletionRequest) -> Result<Completion, InvokeError> {
            let n = self.invocations.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(InvokeError::Upstream {
                    provider: self.spec.name.clone(),
                    message: "scripted failure".into(),
                });
            }
            Ok(Completion {
                content: "ok".into(),
                input_tokens: 100,
                output_tokens: 50,
            })
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn router(providers: Vec<Arc<Scripted>>, serviceable: &[Tier]) -> Router {
        let mut builder = RegistryBuilder::new();
        for p in providers {
            builder = builder.register(p);
        }
        let registry = Arc::new(builder.build(serviceable).expect("valid registry"));
        let ledger = Arc::new(BudgetLedger::new(
            Arc::new(MemoryStore::new()),
            LedgerConfig::default(),
            Arc::new(TracingSink),
        ));
        Router::new(
            registry,
            ledger,
            BreakerConfig::default(),
            HealthConfig::default(),
            Arc::new(TracingSink),
            RouterConfig::default(),
        )
    }

    fn request(tier: Tier) -> RouteRequest {
        RouteRequest {
            subject: "u1".into(),
            tier,
            privacy: false,
            completion: CompletionRequest::new("hello"),
        }
    }

    #[tokio::test]
    async fn serves_from_requested_tier() {
        let p = Scripted::arc("local", Tier::LOCAL, 0, false);
        let router = router(vec![p.clone()], &[Tier::LOCAL]);

        let response = router.route(request(Tier::LOCAL)).await.expect("served");
        assert_eq!(response.provider, "local");
        assert_eq!(response.served_tier, Tier::LOCAL);
        assert_eq!(p.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fails_over_to_next_tier() {
        let broken = Scripted::arc("local", Tier::LOCAL, u32::MAX, false);
        let fallback = Scripted::arc("fast", Tier::FAST, 0, false);
        let router = router(vec![broken.clone(), fallback], &[Tier::LOCAL]);

        let response = router.route(request(Tier::LOCAL)).await.expect("served");
        assert_eq!(response.provider, "fast");
        assert_eq!(response.requested_tier, Tier::LOCAL);
        assert_eq!(response.served_tier, Tier::FAST);
        // One failure does not open the circuit.
        assert_eq!(router.circuit_state("local"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn unconfigured_tier_is_rejected_without_reservation() {
        let p = Scripted::arc("local", Tier::LOCAL, 0, false);
        let router = router(vec![p], &[Tier::LOCAL]);

        assert!(matches!(
            router.route(request(Tier::PREMIUM)).await,
            Err(RouteError::UnconfiguredTier(t)) if t == Tier::PREMIUM
        ));
    }

    #[tokio::test]
    async fn privacy_mode_with_no_compatible_provider_fails_fast() {
        let p = Scripted::arc("cloud", Tier::FAST, 0, false);
        let router = router(vec![p.clone()], &[Tier::FAST]);

        let mut req = request(Tier::FAST);
        req.privacy = true;
        assert!(matches!(
            router.route(req).await,
            Err(RouteError::NoPrivacyCompatibleProvider { .. })
        ));
        assert_eq!(p.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn privacy_mode_skips_incompatible_candidates() {
        let cloud = Scripted::arc("cloud", Tier::FAST, 0, false);
        let private = Scripted::arc("private", Tier::PREMIUM, 0, true);
        let router = router(vec![cloud.clone(), private], &[Tier::FAST]);

        let mut req = request(Tier::FAST);
        req.privacy = true;
        let response = router.route(req).await.expect("served");
        assert_eq!(response.provider, "private");
        assert_eq!(cloud.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_chain_reports_every_attempt() {
        let a = Scripted::arc("a", Tier::LOCAL, u32::MAX, false);
        let b = Scripted::arc("b", Tier::FAST, u32::MAX, false);
        let router = router(vec![a, b], &[Tier::LOCAL]);

        let err = router.route(request(Tier::LOCAL)).await.expect_err("fails");
        match err {
            RouteError::AllProvidersFailed { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert!(attempts
                    .iter()
                    .all(|a| matches!(a.outcome, AttemptOutcome::Failed(_))));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
