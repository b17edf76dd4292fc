//! Budget counters, ceilings and alert latching
//!
//! Spend is bucketed per (provider, model, day) and aggregated per day, per
//! month and per (caller, day). Rolling over into a new period simply starts
//! new keys; old buckets stay around for reporting.
//!
//! Admission reserves a request's estimate under one lock, so concurrent
//! requests cannot all pass against the same remaining headroom. The
//! reservation is a [`BudgetHold`] that gives the estimate back when dropped,
//! after the actual cost has been recorded.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Default fraction of a ceiling at which an alert fires
pub const DEFAULT_ALERT_THRESHOLD: f64 = 0.8;

/// How a crossed ceiling is enforced
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetMode {
    /// Reject requests whose estimate would cross a ceiling
    #[default]
    Hard,
    /// Log and proceed
    Soft,
}

impl FromStr for BudgetMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hard" => Ok(Self::Hard),
            "soft" => Ok(Self::Soft),
            other => Err(format!("unknown budget mode '{other}' (expected hard or soft)")),
        }
    }
}

impl fmt::Display for BudgetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hard => f.write_str("hard"),
            Self::Soft => f.write_str("soft"),
        }
    }
}

/// Budget ceilings; an unset ceiling is unlimited
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub mode: BudgetMode,
    pub daily_limit: Option<f64>,
    pub monthly_limit: Option<f64>,
    pub per_caller_daily_limit: Option<f64>,
    pub alert_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            mode: BudgetMode::Hard,
            daily_limit: None,
            monthly_limit: None,
            per_caller_daily_limit: None,
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
        }
    }
}

impl BudgetConfig {
    /// True when no ceiling is configured
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.daily_limit.is_none() && self.monthly_limit.is_none() && self.per_caller_daily_limit.is_none()
    }
}

/// What a ceiling applies to
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    Daily,
    Monthly,
    CallerDaily(String),
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => f.write_str("daily"),
            Self::Monthly => f.write_str("monthly"),
            Self::CallerDaily(caller) => write!(f, "daily for caller '{caller}'"),
        }
    }
}

/// Calendar period a counter belongs to (UTC)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeriodKey {
    Day(NaiveDate),
    Month { year: i32, month: u32 },
}

impl PeriodKey {
    #[must_use]
    pub fn day(at: DateTime<Utc>) -> Self {
        Self::Day(at.date_naive())
    }

    #[must_use]
    pub fn month(at: DateTime<Utc>) -> Self {
        Self::Month {
            year: at.year(),
            month: at.month(),
        }
    }

    /// Period the scope is counted in at `at`
    #[must_use]
    pub fn for_scope(scope: &BudgetScope, at: DateTime<Utc>) -> Self {
        match scope {
            BudgetScope::Monthly => Self::month(at),
            BudgetScope::Daily | BudgetScope::CallerDaily(_) => Self::day(at),
        }
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Day(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            Self::Month { year, month } => write!(f, "{year:04}-{month:02}"),
        }
    }
}

/// A ceiling the next request would cross
#[derive(Clone, Debug, PartialEq)]
pub struct BudgetViolation {
    pub scope: BudgetScope,
    pub spent: f64,
    pub estimate: f64,
    pub ceiling: f64,
}

/// A scope whose spend just crossed the alert threshold in its period
#[derive(Clone, Debug, PartialEq)]
pub struct BudgetCrossing {
    pub scope: BudgetScope,
    pub period: PeriodKey,
    pub spent: f64,
    pub ceiling: f64,
    pub threshold: f64,
}

/// Budget state for one scope in its current period
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScopeStatus {
    pub scope: BudgetScope,
    pub period: String,
    pub spent: f64,
    /// Estimates held by requests still in flight
    pub reserved: f64,
    pub ceiling: Option<f64>,
    pub remaining: Option<f64>,
    pub alerted: bool,
}

/// Budget state across all scopes
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub mode: BudgetMode,
    pub alert_threshold: f64,
    pub scopes: Vec<ScopeStatus>,
}

impl BudgetStatus {
    /// Status of the given scope, if reported
    pub fn scope(&self, scope: &BudgetScope) -> Option<&ScopeStatus> {
        self.scopes.iter().find(|s| &s.scope == scope)
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Spend counters for the current and past periods
#[derive(Debug, Default)]
pub struct BudgetLedger {
    config: BudgetConfig,
    buckets: DashMap<(String, String, NaiveDate), f64>,
    daily: DashMap<NaiveDate, f64>,
    monthly: DashMap<(i32, u32), f64>,
    caller_daily: DashMap<(String, NaiveDate), f64>,
    reserved_daily: DashMap<NaiveDate, f64>,
    reserved_monthly: DashMap<(i32, u32), f64>,
    reserved_caller_daily: DashMap<(String, NaiveDate), f64>,
    alerted: DashSet<(BudgetScope, PeriodKey)>,
    // Serializes check-and-reserve across scopes
    admission: Mutex<()>,
}

impl BudgetLedger {
    #[must_use]
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    fn ceiling(&self, scope: &BudgetScope) -> Option<f64> {
        match scope {
            BudgetScope::Daily => self.config.daily_limit,
            BudgetScope::Monthly => self.config.monthly_limit,
            BudgetScope::CallerDaily(_) => self.config.per_caller_daily_limit,
        }
    }

    /// Scopes with a ceiling that apply to a request from `caller`
    fn scopes_for(&self, caller: Option<&str>) -> Vec<BudgetScope> {
        let mut scopes = Vec::with_capacity(3);
        if self.config.daily_limit.is_some() {
            scopes.push(BudgetScope::Daily);
        }
        if self.config.monthly_limit.is_some() {
            scopes.push(BudgetScope::Monthly);
        }
        if let (Some(caller), Some(_)) = (caller, self.config.per_caller_daily_limit) {
            scopes.push(BudgetScope::CallerDaily(caller.to_string()));
        }
        scopes
    }

    /// Spend in `scope` for the period containing `at`
    pub fn spent(&self, scope: &BudgetScope, at: DateTime<Utc>) -> f64 {
        let day = at.date_naive();
        match scope {
            BudgetScope::Daily => self.daily.get(&day).map_or(0.0, |v| *v),
            BudgetScope::Monthly => self
                .monthly
                .get(&(at.year(), at.month()))
                .map_or(0.0, |v| *v),
            BudgetScope::CallerDaily(caller) => self
                .caller_daily
                .get(&(caller.clone(), day))
                .map_or(0.0, |v| *v),
        }
    }

    /// Estimates reserved in `scope` for the period containing `at`
    pub fn reserved(&self, scope: &BudgetScope, at: DateTime<Utc>) -> f64 {
        let day = at.date_naive();
        match scope {
            BudgetScope::Daily => self.reserved_daily.get(&day).map_or(0.0, |v| *v),
            BudgetScope::Monthly => self
                .reserved_monthly
                .get(&(at.year(), at.month()))
                .map_or(0.0, |v| *v),
            BudgetScope::CallerDaily(caller) => self
                .reserved_caller_daily
                .get(&(caller.clone(), day))
                .map_or(0.0, |v| *v),
        }
    }

    /// Spend on (provider, model) on the day containing `at`
    pub fn bucket(&self, provider: &str, model: &str, at: DateTime<Utc>) -> f64 {
        self.buckets
            .get(&(provider.to_string(), model.to_string(), at.date_naive()))
            .map_or(0.0, |v| *v)
    }

    /// First ceiling that `spent + reserved + estimate` would cross
    pub fn check(&self, caller: Option<&str>, estimate: f64, at: DateTime<Utc>) -> Result<(), BudgetViolation> {
        for scope in self.scopes_for(caller) {
            let Some(ceiling) = self.ceiling(&scope) else {
                continue;
            };
            let spent = self.spent(&scope, at) + self.reserved(&scope, at);
            if spent + estimate > ceiling {
                return Err(BudgetViolation {
                    scope,
                    spent,
                    estimate,
                    ceiling,
                });
            }
        }
        Ok(())
    }

    /// Check `estimate` and, if it fits every ceiling, reserve it until the
    /// returned hold is dropped
    pub fn reserve(
        self: &Arc<Self>,
        caller: Option<&str>,
        estimate: f64,
        at: DateTime<Utc>,
    ) -> Result<BudgetHold, BudgetViolation> {
        let _admission = self.admission.lock();
        self.check(caller, estimate, at)?;
        Ok(self.hold(caller, estimate, at))
    }

    /// Reserve `estimate` without checking any ceiling
    pub fn hold(self: &Arc<Self>, caller: Option<&str>, estimate: f64, at: DateTime<Utc>) -> BudgetHold {
        let amount = if estimate.is_finite() { estimate.max(0.0) } else { 0.0 };
        self.adjust_reserved(caller, amount, at);
        BudgetHold {
            ledger: Arc::clone(self),
            caller: caller.map(str::to_string),
            amount,
            at,
        }
    }

    fn adjust_reserved(&self, caller: Option<&str>, delta: f64, at: DateTime<Utc>) {
        fn apply(slot: &mut f64, delta: f64) {
            *slot = (*slot + delta).max(0.0);
        }

        let day = at.date_naive();
        apply(&mut self.reserved_daily.entry(day).or_insert(0.0), delta);
        apply(
            &mut self.reserved_monthly.entry((at.year(), at.month())).or_insert(0.0),
            delta,
        );
        if let Some(caller) = caller {
            apply(
                &mut self
                    .reserved_caller_daily
                    .entry((caller.to_string(), day))
                    .or_insert(0.0),
                delta,
            );
        }
    }

    /// Attribute `cost` and return the alert crossings it caused
    pub fn record(
        &self,
        provider: &str,
        model: &str,
        caller: Option<&str>,
        cost: f64,
        at: DateTime<Utc>,
    ) -> Vec<BudgetCrossing> {
        let cost = if cost.is_finite() { cost.max(0.0) } else { 0.0 };
        let day = at.date_naive();

        *self
            .buckets
            .entry((provider.to_string(), model.to_string(), day))
            .or_insert(0.0) += cost;
        *self.daily.entry(day).or_insert(0.0) += cost;
        *self.monthly.entry((at.year(), at.month())).or_insert(0.0) += cost;
        if let Some(caller) = caller {
            *self
                .caller_daily
                .entry((caller.to_string(), day))
                .or_insert(0.0) += cost;
        }

        self.latch_crossings(caller, at)
    }

    fn latch_crossings(&self, caller: Option<&str>, at: DateTime<Utc>) -> Vec<BudgetCrossing> {
        let threshold = self.config.alert_threshold;
        let mut crossings = Vec::new();

        for scope in self.scopes_for(caller) {
            let Some(ceiling) = self.ceiling(&scope) else {
                continue;
            };
            let spent = self.spent(&scope, at);
            if spent < threshold * ceiling {
                continue;
            }
            let period = PeriodKey::for_scope(&scope, at);
            // insert() is the latch: only the first crosser in a period sees true
            if self.alerted.insert((scope.clone(), period)) {
                crossings.push(BudgetCrossing {
                    scope,
                    period,
                    spent,
                    ceiling,
                    threshold,
                });
            }
        }
        crossings
    }

    /// Mark every scope already past its threshold as alerted without
    /// reporting it; used after rebuilding counters from storage
    pub fn mark_crossed(&self, at: DateTime<Utc>) {
        let callers: Vec<String> = self
            .caller_daily
            .iter()
            .filter(|e| e.key().1 == at.date_naive())
            .map(|e| e.key().0.clone())
            .collect();

        self.latch_crossings(None, at);
        for caller in callers {
            self.latch_crossings(Some(&caller), at);
        }
    }

    pub fn is_alerted(&self, scope: &BudgetScope, at: DateTime<Utc>) -> bool {
        self.alerted
            .contains(&(scope.clone(), PeriodKey::for_scope(scope, at)))
    }

    /// Status for the periods containing `at`
    pub fn status(&self, at: DateTime<Utc>) -> BudgetStatus {
        let day = at.date_naive();
        let mut scopes = vec![
            self.scope_status(BudgetScope::Daily, at),
            self.scope_status(BudgetScope::Monthly, at),
        ];

        let mut callers: Vec<String> = self
            .caller_daily
            .iter()
            .filter(|e| e.key().1 == day)
            .map(|e| e.key().0.clone())
            .collect();
        callers.sort();
        scopes.extend(
            callers
                .into_iter()
                .map(|caller| self.scope_status(BudgetScope::CallerDaily(caller), at)),
        );

        BudgetStatus {
            mode: self.config.mode,
            alert_threshold: self.config.alert_threshold,
            scopes,
        }
    }

    fn scope_status(&self, scope: BudgetScope, at: DateTime<Utc>) -> ScopeStatus {
        let spent = self.spent(&scope, at);
        let ceiling = self.ceiling(&scope);
        ScopeStatus {
            period: PeriodKey::for_scope(&scope, at).to_string(),
            spent,
            reserved: self.reserved(&scope, at),
            ceiling,
            remaining: ceiling.map(|c| (c - spent).max(0.0)),
            alerted: self.is_alerted(&scope, at),
            scope,
        }
    }
}

/// An admitted request's reserved estimate
///
/// Dropping the hold returns the estimate to the ledger. Record the actual
/// cost first, so spend plus reservations never dips below what is owed.
#[must_use = "dropping the hold releases the reservation"]
pub struct BudgetHold {
    ledger: Arc<BudgetLedger>,
    caller: Option<String>,
    amount: f64,
    at: DateTime<Utc>,
}

impl BudgetHold {
    pub fn amount(&self) -> f64 {
        self.amount
    }
}

impl Drop for BudgetHold {
    fn drop(&mut self) {
        self.ledger
            .adjust_reserved(self.caller.as_deref(), -self.amount, self.at);
    }
}

impl fmt::Debug for BudgetHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetHold")
            .field("caller", &self.caller)
            .field("amount", &self.amount)
            .field("at", &self.at)
            .finish_non_exhaustive()
    }
}
