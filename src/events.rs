//! Observability event stream.
//!
//! One [`RouteEvent`] per `route` call outcome plus [`BudgetAlert`]s from
//! the ledger's utilization thresholds. This stream is the sole mechanism
//! downstream analytics use to reconstruct routing behavior — the core
//! persists none of it. The default sink renders events as structured
//! `tracing` records; tests plug in capturing sinks.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::ledger::Period;
use crate::tier::Tier;

/// What happened to one candidate during a route call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum AttemptOutcome {
    /// Skipped: circuit breaker refused the attempt.
    CircuitOpen,
    /// Skipped: health monitor reported unreachable.
    Unhealthy,
    /// Invoked and hit the per-tier deadline.
    TimedOut,
    /// Invoked and failed.
    Failed(String),
    /// Invoked and served the response.
    Served,
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircuitOpen => write!(f, "skipped (circuit open)"),
            Self::Unhealthy => write!(f, "skipped (unhealthy)"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
            Self::Served => write!(f, "served"),
        }
    }
}

/// One candidate's record within a route call, in attempt order.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub provider: String,
    pub tier: Tier,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl std::fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.provider, self.tier, self.outcome)
    }
}

/// Terminal record of one route call.
#[derive(Debug, Clone, Serialize)]
pub struct RouteEvent {
    pub subject: String,
    pub requested_tier: Tier,
    pub served_tier: Option<Tier>,
    pub provider: Option<String>,
    pub cost: Option<Decimal>,
    pub latency_ms: u64,
    pub success: bool,
    /// Terminal failure classification when `success` is false.
    pub failure: Option<String>,
    /// Per-candidate skip/failure chain, including the serving attempt.
    pub attempts: Vec<AttemptRecord>,
}

/// Emitted when utilization crosses an alert threshold (one-way, at most
/// once per threshold per period window).
#[derive(Debug, Clone, Serialize)]
pub struct BudgetAlert {
    pub subject: String,
    pub period: Period,
    pub threshold_pct: u8,
    pub utilization: f64,
}

/// Consumer of the observability stream.
pub trait EventSink: Send + Sync {
    fn route_completed(&self, event: &RouteEvent);
    fn budget_alert(&self, alert: &BudgetAlert);
}

/// Default sink: structured tracing records.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn route_completed(&self, event: &RouteEvent) {
        let attempts: Vec<String> = event.attempts.iter().map(|a| a.to_string()).collect();
        if event.success {
            tracing::info!(
                subject = %event.subject,
                requested_tier = %event.requested_tier,
                served_tier = ?event.served_tier.map(|t| t.number()),
                provider = ?event.provider,
                cost = ?event.cost,
                latency_ms = event.latency_ms,
                attempts = ?attempts,
                "route served"
            );
        } else {
            tracing::warn!(
                subject = %event.subject,
                requested_tier = %event.requested_tier,
                failure = ?event.failure,
                latency_ms = event.latency_ms,
                attempts = ?attempts,
                "route failed"
            );
        }
    }

    fn budget_alert(&self, alert: &BudgetAlert) {
        tracing::warn!(
            subject = %alert.subject,
            period = %alert.period,
            threshold_pct = alert.threshold_pct,
            utilization = alert.utilization,
            "budget utilization threshold crossed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_outcomes_render_for_diagnostics() {
        let record = AttemptRecord {
            provider: "openai-main".into(),
            tier: Tier::PREMIUM,
            outcome: AttemptOutcome::Failed("503 from upstream".into()),
        };
        assert_eq!(
            record.to_string(),
            "openai-main (tier-3): failed: 503 from upstream"
        );
    }

    #[test]
    fn route_event_serializes() {
        let event = RouteEvent {
            subject: "user-1".into(),
            requested_tier: Tier::LOCAL,
            served_tier: Some(Tier::FAST),
            provider: Some("fast-1".into()),
            cost: Some(rust_decimal_macros::dec!(0.01)),
            latency_ms: 42,
            success: true,
            failure: None,
            attempts: vec![AttemptRecord {
                provider: "local-1".into(),
                tier: Tier::LOCAL,
                outcome: AttemptOutcome::Unhealthy,
            }],
        };
        let json = serde_json::to_value(&event).expect("serializable");
        assert_eq!(json["requested_tier"], 0);
        assert_eq!(json["attempts"][0]["outcome"], "unhealthy");
    }
}
