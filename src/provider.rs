//! The provider seam: one trait every backend implements.
//!
//! The router never talks wire protocols; it sees `Arc<dyn Provider>`
//! handles with an immutable [`ProviderSpec`] (identity, tier, pricing,
//! capability flags) and three operations: invoke, health check, and cost
//! estimation. Every invoke outcome is an explicit `Result` value — the
//! failover loop inspects result tags, it never catches panics or maps
//! exceptions.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cost;
use crate::tier::Tier;

/// Immutable identity and pricing of a registered provider.
///
/// Owned by the registry; never mutated after registration.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    /// Unique provider name, used as the key for breaker and health state.
    pub name: String,
    /// Assigned tier (0–4).
    pub tier: Tier,
    /// Priority within the tier; lower wins ties.
    pub priority: u8,
    /// Cost per input token.
    pub input_cost_per_token: Decimal,
    /// Cost per output token.
    pub output_cost_per_token: Decimal,
    /// Per-provider invoke deadline, overriding the tier default.
    pub invoke_timeout: Option<Duration>,
    /// Whether this provider may serve privacy-mode requests.
    pub privacy_compatible: bool,
}

impl ProviderSpec {
    /// The deadline applied to a single invocation of this provider.
    pub fn effective_timeout(&self) -> Duration {
        self.invoke_timeout
            .unwrap_or_else(|| self.tier.default_invoke_timeout())
    }
}

/// A completion request as seen by the routing core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// A successful completion with billable token counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Why a single provider invocation failed.
///
/// These are absorbed by the router's failover loop and only surface in the
/// aggregate diagnostics when the whole chain is exhausted.
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    #[error("{provider} upstream error: {message}")]
    Upstream { provider: String, message: String },

    #[error("{provider} returned an unusable response: {message}")]
    InvalidResponse { provider: String, message: String },
}

/// A backend capable of serving completions.
///
/// Implementations must be cheap to call for `spec()` and side-effect-free
/// for `health_check()`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Identity, tier, and pricing. Immutable after registration.
    fn spec(&self) -> &ProviderSpec;

    /// Perform one completion. The caller applies the deadline; the
    /// implementation should not retry internally.
    async fn invoke(&self, request: &CompletionRequest) -> Result<Completion, InvokeError>;

    /// Fast reachability probe. `false` means "do not prefer me right now";
    /// the circuit breaker remains the authoritative gate.
    async fn health_check(&self) -> bool;

    /// Monetary cost of an invocation with the given token counts.
    fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> Decimal {
        cost::invocation_cost(self.spec(), input_tokens, output_tokens)
    }
}
