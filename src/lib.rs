//! Request admission and routing core for LLM traffic.
//!
//! Every completion request passes three gates before reaching a provider:
//! a budget ledger (atomic reserve / settle / release per subject and
//! period), per-provider circuit breakers, and a cached health monitor.
//! Providers are grouped into ordered cost tiers; on failure the router
//! walks the tier ladder upward until a candidate serves or the chain is
//! exhausted. A structured event stream records every outcome.

pub mod api;
pub mod backends;
pub mod breaker;
pub mod config;
pub mod cost;
pub mod error;
pub mod events;
pub mod health;
pub mod ledger;
pub mod provider;
pub mod registry;
pub mod router;
pub mod tier;

pub use breaker::{BreakerConfig, CircuitBreakerSet, CircuitState};
pub use error::RouteError;
pub use events::{EventSink, RouteEvent, TracingSink};
pub use health::{HealthConfig, HealthMonitor};
pub use ledger::{BudgetLedger, BudgetStatus, LedgerConfig, LedgerError, Period};
pub use provider::{Completion, CompletionRequest, InvokeError, Provider, ProviderSpec};
pub use registry::{Registry, RegistryBuilder, RegistryError};
pub use router::{RouteRequest, RouteResponse, Router, RouterConfig};
pub use tier::Tier;
