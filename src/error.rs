//! Route-level errors surfaced to callers of the admission core.

use thiserror::Error;

use crate::events::AttemptRecord;
use crate::ledger::LedgerError;
use crate::tier::Tier;

/// Terminal outcome of a failed route call.
///
/// Skips and per-provider failures inside the failover loop never surface
/// individually; callers only see these aggregates.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Admission denied or ledger trouble. `BudgetExceeded` inside is a
    /// definitive rejection; `Contention` is retryable.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The requested tier is not in the serviceable set.
    #[error("{0} has no registered providers")]
    UnconfiguredTier(Tier),

    /// Privacy mode filtered every candidate out before any invocation.
    #[error("no privacy-compatible provider available for {requested_tier}")]
    NoPrivacyCompatibleProvider { requested_tier: Tier },

    /// Every candidate in the failover chain was skipped or failed.
    #[error("all providers failed ({} attempted)", attempts.len())]
    AllProvidersFailed { attempts: Vec<AttemptRecord> },
}
