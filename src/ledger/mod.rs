//! Budget ledger: atomic reserve / settle / release over a KV store.
//!
//! Spend is tracked per (subject, period) pool under the key layout
//! `budget:{subject}:{period}` (committed spend), `...:reserved` (in-flight
//! holds), and `...:limit` (configured override). The correctness property
//! is `spent + reserved ≤ limit` at every observable point: reservation is
//! the admission decision, settlement converts a hold into committed spend,
//! release returns it. All three run as optimistic watch/commit
//! transactions with a bounded retry budget, so two concurrent
//! reservations that individually fit but jointly overflow can never both
//! succeed.
//!
//! Keys are written with an expiry aligned to the end of the current
//! period window (daily/weekly/monthly UTC boundaries), which gives
//! automatic rollover without a scheduled job: once the boundary passes,
//! the counters read as absent and the new window starts from zero.

pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, Months, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{BudgetAlert, EventSink};
use store::{
    transact, CasRetryPolicy, KvStore, KvWrite, StoreError, TransactError, VersionedRead,
};

/// Utilization thresholds (percent) that emit one-way alerts.
const ALERT_THRESHOLDS: [u8; 3] = [80, 90, 95];

/// Budget accounting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
        }
    }

    /// The UTC instant at which the current window ends and counters reset.
    pub fn next_reset(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let boundary = match self {
            Period::Daily => today + Days::new(1),
            Period::Weekly => {
                let days_left = 7 - u64::from(now.weekday().num_days_from_monday());
                today + Days::new(days_left)
            }
            Period::Monthly => {
                let first = today.with_day(1).expect("first of month is a valid date");
                first + Months::new(1)
            }
        };
        boundary.and_time(NaiveTime::MIN).and_utc()
    }

    /// Time remaining in the current window; used as the key expiry so the
    /// whole pool vanishes exactly at the boundary.
    pub fn until_reset(self, now: DateTime<Utc>) -> Duration {
        (self.next_reset(now) - now).to_std().unwrap_or(Duration::ZERO)
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "daily" | "day" => Ok(Period::Daily),
            "weekly" | "week" => Ok(Period::Weekly),
            "monthly" | "month" => Ok(Period::Monthly),
            _ => Err(format!(
                "invalid period '{}', expected: daily, weekly, monthly",
                s
            )),
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger failures. `BudgetExceeded` means "out of budget";
/// `Contention` means "transient, try again" — callers must not conflate
/// the two.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(
        "budget exceeded: requested {requested}, limit {limit}, spent {spent}, \
         reserved {reserved} (utilization {utilization:.2})"
    )]
    BudgetExceeded {
        limit: Decimal,
        spent: Decimal,
        reserved: Decimal,
        requested: Decimal,
        utilization: f64,
    },

    #[error("budget ledger contention: retry budget exhausted after {attempts} attempts")]
    Contention { attempts: u32 },

    #[error("budget limit must be positive, got {0}")]
    InvalidLimit(Decimal),

    #[error("corrupt ledger value for {key}: {value:?}")]
    Corrupt { key: String, value: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TransactError> for LedgerError {
    fn from(err: TransactError) -> Self {
        match err {
            TransactError::Contention { attempts } => LedgerError::Contention { attempts },
            TransactError::Store(e) => LedgerError::Store(e),
        }
    }
}

/// A provisional hold against a budget pool.
///
/// Must be settled or released exactly once; both consume the handle.
/// [`ReservationGuard`] automates release on cancellation.
#[derive(Debug, Clone, Serialize)]
pub struct Reservation {
    pub id: Uuid,
    pub subject: String,
    pub period: Period,
    pub amount: Decimal,
}

/// Read-only snapshot of a budget pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub subject: String,
    pub period: Period,
    pub limit: Decimal,
    pub spent: Decimal,
    pub reserved: Decimal,
    pub utilization: f64,
    pub reset_at: DateTime<Utc>,
}

/// Ledger tuning and default limits.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub retry: CasRetryPolicy,
    /// Limits applied when no explicit override is set for a pool.
    pub default_limits: BTreeMap<Period, Decimal>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let mut default_limits = BTreeMap::new();
        default_limits.insert(Period::Daily, dec!(10));
        default_limits.insert(Period::Weekly, dec!(50));
        default_limits.insert(Period::Monthly, dec!(150));
        Self {
            retry: CasRetryPolicy::default(),
            default_limits,
        }
    }
}

impl LedgerConfig {
    fn default_limit(&self, period: Period) -> Decimal {
        self.default_limits
            .get(&period)
            .copied()
            .unwrap_or(dec!(10))
    }
}

#[derive(Debug)]
struct AlertWindow {
    reset_at: DateTime<Utc>,
    fired: u8,
}

/// Per-subject, per-period spend accounting with atomic admission.
pub struct BudgetLedger {
    store: Arc<dyn KvStore>,
    config: LedgerConfig,
    sink: Arc<dyn EventSink>,
    alert_windows: Mutex<HashMap<(String, Period), AlertWindow>>,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn KvStore>, config: LedgerConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            config,
            sink,
            alert_windows: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically reserve `estimated` against the pool, or reject.
    ///
    /// The check `spent + reserved + estimated ≤ limit` and the increment
    /// of `reserved` happen inside one optimistic transaction, closing the
    /// classic check-then-act race between concurrent reservations.
    pub async fn reserve(
        &self,
        subject: &str,
        period: Period,
        estimated: Decimal,
    ) -> Result<Reservation, LedgerError> {
        let now = Utc::now();
        let ttl = period.until_reset(now);
        let keys = pool_keys(subject, period);
        let default_limit = self.config.default_limit(period);

        let utilization_after = transact(self.store.as_ref(), self.config.retry, &keys, |reads| {
            let spent = parse_amount(&reads[0], Decimal::ZERO)?;
            let reserved = parse_amount(&reads[1], Decimal::ZERO)?;
            let limit = parse_amount(&reads[2], default_limit)?;

            if spent + reserved + estimated > limit {
                return Err(LedgerError::BudgetExceeded {
                    limit,
                    spent,
                    reserved,
                    requested: estimated,
                    utilization: utilization(spent, reserved, limit),
                });
            }

            let new_reserved = reserved + estimated;
            let writes = vec![KvWrite::set(
                keys[1].clone(),
                new_reserved.to_string(),
                Some(ttl),
            )];
            Ok((utilization(spent, new_reserved, limit), writes))
        })
        .await
        .map_err(LedgerError::from)??;

        let reservation = Reservation {
            id: Uuid::new_v4(),
            subject: subject.to_string(),
            period,
            amount: estimated,
        };
        debug!(
            subject,
            period = %period,
            amount = %estimated,
            reservation = %reservation.id,
            "budget reserved"
        );
        self.emit_alerts(subject, period, period.next_reset(now), utilization_after);
        Ok(reservation)
    }

    /// Convert a reservation into committed spend.
    ///
    /// `actual` may differ from the estimate. If committing it pushes the
    /// pool past its limit the excess is still committed — settlement never
    /// retroactively fails a completed call — but the breach is logged for
    /// alerting.
    pub async fn settle(
        &self,
        reservation: Reservation,
        actual: Decimal,
    ) -> Result<(), LedgerError> {
        let now = Utc::now();
        let ttl = reservation.period.until_reset(now);
        let keys = pool_keys(&reservation.subject, reservation.period);
        let default_limit = self.config.default_limit(reservation.period);
        let held = reservation.amount;

        let (utilization_after, breached) =
            transact(self.store.as_ref(), self.config.retry, &keys, |reads| {
                let spent = parse_amount(&reads[0], Decimal::ZERO)?;
                let reserved = parse_amount(&reads[1], Decimal::ZERO)?;
                let limit = parse_amount(&reads[2], default_limit)?;

                let new_reserved = (reserved - held).max(Decimal::ZERO);
                let new_spent = spent + actual;
                let writes = vec![
                    KvWrite::set(keys[0].clone(), new_spent.to_string(), Some(ttl)),
                    KvWrite::set(keys[1].clone(), new_reserved.to_string(), Some(ttl)),
                ];
                let after = utilization(new_spent, new_reserved, limit);
                Ok::<_, LedgerError>(((after, new_spent + new_reserved > limit), writes))
            })
            .await
            .map_err(LedgerError::from)??;

        if breached {
            warn!(
                subject = %reservation.subject,
                period = %reservation.period,
                reservation = %reservation.id,
                actual = %actual,
                estimated = %held,
                "settlement exceeded the pool limit; excess committed"
            );
        }
        debug!(
            subject = %reservation.subject,
            reservation = %reservation.id,
            actual = %actual,
            "budget settled"
        );
        self.emit_alerts(
            &reservation.subject,
            reservation.period,
            reservation.period.next_reset(now),
            utilization_after,
        );
        Ok(())
    }

    /// Return a reservation to the pool with no spend committed.
    pub async fn release(&self, reservation: Reservation) -> Result<(), LedgerError> {
        let now = Utc::now();
        let ttl = reservation.period.until_reset(now);
        let keys = pool_keys(&reservation.subject, reservation.period);
        let held = reservation.amount;

        transact(self.store.as_ref(), self.config.retry, &keys, |reads| {
            let reserved = parse_amount(&reads[1], Decimal::ZERO)?;
            let new_reserved = (reserved - held).max(Decimal::ZERO);
            let writes = vec![KvWrite::set(
                keys[1].clone(),
                new_reserved.to_string(),
                Some(ttl),
            )];
            Ok::<_, LedgerError>(((), writes))
        })
        .await
        .map_err(LedgerError::from)??;

        debug!(
            subject = %reservation.subject,
            reservation = %reservation.id,
            amount = %held,
            "budget reservation released"
        );
        Ok(())
    }

    /// Read-only pool snapshot.
    pub async fn status(&self, subject: &str, period: Period) -> Result<BudgetStatus, LedgerError> {
        let now = Utc::now();
        let keys = pool_keys(subject, period);
        let reads = self.store.watch(&keys).await?;
        let spent = parse_amount(&reads[0], Decimal::ZERO)?;
        let reserved = parse_amount(&reads[1], Decimal::ZERO)?;
        let limit = parse_amount(&reads[2], self.config.default_limit(period))?;
        Ok(BudgetStatus {
            subject: subject.to_string(),
            period,
            limit,
            spent,
            reserved,
            utilization: utilization(spent, reserved, limit),
            reset_at: period.next_reset(now),
        })
    }

    /// Set an explicit limit override for a pool.
    pub async fn set_limit(
        &self,
        subject: &str,
        period: Period,
        limit: Decimal,
    ) -> Result<(), LedgerError> {
        if limit <= Decimal::ZERO {
            return Err(LedgerError::InvalidLimit(limit));
        }
        let ttl = period.until_reset(Utc::now());
        let keys = pool_keys(subject, period);
        transact(self.store.as_ref(), self.config.retry, &keys, |_reads| {
            Ok::<_, LedgerError>((
                (),
                vec![KvWrite::set(keys[2].clone(), limit.to_string(), Some(ttl))],
            ))
        })
        .await
        .map_err(LedgerError::from)??;
        Ok(())
    }

    /// Remove the limit override, reverting the pool to the default.
    pub async fn clear_limit(&self, subject: &str, period: Period) -> Result<(), LedgerError> {
        let keys = pool_keys(subject, period);
        transact(self.store.as_ref(), self.config.retry, &keys, |_reads| {
            Ok::<_, LedgerError>(((), vec![KvWrite::delete(keys[2].clone())]))
        })
        .await
        .map_err(LedgerError::from)??;
        Ok(())
    }

    /// Fire any alert thresholds newly crossed by `utilization_after`.
    /// Each threshold fires at most once per period window.
    fn emit_alerts(
        &self,
        subject: &str,
        period: Period,
        reset_at: DateTime<Utc>,
        utilization_after: f64,
    ) {
        let Ok(mut windows) = self.alert_windows.lock() else {
            return;
        };
        let window = windows
            .entry((subject.to_string(), period))
            .or_insert(AlertWindow { reset_at, fired: 0 });
        if window.reset_at != reset_at {
            window.reset_at = reset_at;
            window.fired = 0;
        }
        for (index, &threshold) in ALERT_THRESHOLDS.iter().enumerate() {
            let bit = 1u8 << index;
            if window.fired & bit == 0 && utilization_after * 100.0 >= f64::from(threshold) {
                window.fired |= bit;
                self.sink.budget_alert(&BudgetAlert {
                    subject: subject.to_string(),
                    period,
                    threshold_pct: threshold,
                    utilization: utilization_after,
                });
            }
        }
    }
}

impl std::fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("retry", &self.config.retry)
            .finish()
    }
}

/// Releases an unconsumed reservation when dropped, so caller cancellation
/// (dropping the route future) cannot leak a hold. `settle` and `release`
/// disarm it.
pub struct ReservationGuard {
    ledger: Arc<BudgetLedger>,
    reservation: Option<Reservation>,
}

impl ReservationGuard {
    pub fn new(ledger: Arc<BudgetLedger>, reservation: Reservation) -> Self {
        Self {
            ledger,
            reservation: Some(reservation),
        }
    }

    pub fn reservation(&self) -> Option<&Reservation> {
        self.reservation.as_ref()
    }

    /// Settle the held reservation with the actual cost.
    pub async fn settle(mut self, actual: Decimal) -> Result<(), LedgerError> {
        let Some(reservation) = self.reservation.take() else {
            return Ok(());
        };
        self.ledger.settle(reservation, actual).await
    }

    /// Release the held reservation.
    pub async fn release(mut self) -> Result<(), LedgerError> {
        let Some(reservation) = self.reservation.take() else {
            return Ok(());
        };
        self.ledger.release(reservation).await
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        let Some(reservation) = self.reservation.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let ledger = Arc::clone(&self.ledger);
                let id = reservation.id;
                handle.spawn(async move {
                    if let Err(err) = ledger.release(reservation).await {
                        warn!(reservation = %id, error = %err, "failed to release dropped reservation");
                    }
                });
            }
            Err(_) => {
                warn!(
                    reservation = %reservation.id,
                    "reservation dropped outside a runtime; hold leaks until window reset"
                );
            }
        }
    }
}

fn pool_keys(subject: &str, period: Period) -> [String; 3] {
    let base = format!("budget:{}:{}", subject, period.as_str());
    let reserved = format!("{base}:reserved");
    let limit = format!("{base}:limit");
    [base, reserved, limit]
}

fn parse_amount(read: &VersionedRead, default: Decimal) -> Result<Decimal, LedgerError> {
    match &read.value {
        None => Ok(default),
        Some(raw) => raw.parse::<Decimal>().map_err(|_| LedgerError::Corrupt {
            key: read.key.clone(),
            value: raw.clone(),
        }),
    }
}

fn utilization(spent: Decimal, reserved: Decimal, limit: Decimal) -> f64 {
    if limit <= Decimal::ZERO {
        return 1.0;
    }
    ((spent + reserved) / limit).try_into().unwrap_or(1.0)
}
