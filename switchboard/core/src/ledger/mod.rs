//! Token accounting and budgets
//!
//! [`TokenTracker`] prices every provider attempt, appends it to the usage
//! store and keeps per-period spend counters that back budget enforcement.
//! Counters for the current month are rebuilt from the store on startup so
//! a restart does not reset spend.

mod budget;
mod pricing;
mod store;

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use thiserror::Error;

pub use budget::{
    BudgetConfig, BudgetCrossing, BudgetHold, BudgetLedger, BudgetMode, BudgetScope, BudgetStatus,
    BudgetViolation, PeriodKey, ScopeStatus, DEFAULT_ALERT_THRESHOLD,
};
pub use pricing::{ModelPricing, PricingTable};
pub use store::{MemoryUsageStore, SqliteUsageStore, UsageRecord, UsageStats, UsageStore, UsageTotals};

use crate::events::{EventBus, RouterEvent};
use crate::provider::{CompletionRequest, TokenCounts};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    #[error("usage storage error: {0}")]
    Storage(String),
}

/// Usage reported after a provider attempt
#[derive(Clone, Debug, PartialEq)]
pub struct UsageEvent {
    pub provider: String,
    pub model: String,
    pub caller: Option<String>,
    pub tokens: TokenCounts,
    pub latency_ms: u64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, tokens: TokenCounts) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            caller: None,
            tokens,
            latency_ms: 0,
            success: true,
            timestamp: Utc::now(),
        }
    }

    pub fn with_caller(mut self, caller: Option<String>) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Prices usage, records it and enforces budgets
pub struct TokenTracker {
    pricing: PricingTable,
    budgets: Arc<BudgetLedger>,
    store: Arc<dyn UsageStore>,
    events: Option<Arc<EventBus>>,
}

impl TokenTracker {
    /// Create a tracker and rebuild this month's counters from `store`
    pub fn new(pricing: PricingTable, budget: BudgetConfig, store: Arc<dyn UsageStore>) -> Self {
        let tracker = Self {
            pricing,
            budgets: Arc::new(BudgetLedger::new(budget)),
            store,
            events: None,
        };
        tracker.rehydrate(Utc::now());
        tracker
    }

    /// In-memory tracker with no persisted history
    pub fn in_memory(pricing: PricingTable, budget: BudgetConfig) -> Self {
        Self::new(pricing, budget, Arc::new(MemoryUsageStore::new()))
    }

    #[must_use]
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn rehydrate(&self, now: DateTime<Utc>) {
        let Some(month_start) = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
        else {
            return;
        };

        match self.store.records_between(month_start, now + Duration::days(1)) {
            Ok(records) => {
                for record in &records {
                    self.budgets.record(
                        &record.provider,
                        &record.model,
                        record.caller.as_deref(),
                        record.cost,
                        record.timestamp,
                    );
                }
                // Crossings from before the restart were already reported
                self.budgets.mark_crossed(now);
                if !records.is_empty() {
                    tracing::info!(
                        store = self.store.name(),
                        records = records.len(),
                        "Rebuilt budget counters from usage ledger"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(store = self.store.name(), error = %e, "Failed to read usage ledger, budgets start empty");
            }
        }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn budget_config(&self) -> &BudgetConfig {
        self.budgets.config()
    }

    /// Cost of `tokens` on (provider, model); pure, depends only on the
    /// pricing table
    #[must_use]
    pub fn calculate_cost(&self, provider: &str, model: &str, tokens: &TokenCounts) -> f64 {
        self.pricing.cost(provider, model, tokens)
    }

    /// Pre-dispatch cost estimate for `request` on (provider, model)
    #[must_use]
    pub fn estimate_cost(&self, provider: &str, model: &str, request: &CompletionRequest) -> f64 {
        self.pricing.estimate(provider, model, request)
    }

    /// Check whether `estimate` more spend is allowed right now
    pub fn check_budget(&self, caller: Option<&str>, estimate: f64) -> Result<(), BudgetViolation> {
        self.check_budget_at(caller, estimate, Utc::now())
    }

    /// Check against the periods containing `at`. Soft mode logs the
    /// violation and allows the request.
    pub fn check_budget_at(
        &self,
        caller: Option<&str>,
        estimate: f64,
        at: DateTime<Utc>,
    ) -> Result<(), BudgetViolation> {
        match self.budgets.check(caller, estimate, at) {
            Ok(()) => Ok(()),
            Err(violation) if self.budgets.config().mode == BudgetMode::Soft => {
                tracing::warn!(
                    scope = %violation.scope,
                    spent = violation.spent,
                    estimate = violation.estimate,
                    ceiling = violation.ceiling,
                    "Budget ceiling exceeded (soft mode, proceeding)"
                );
                Ok(())
            }
            Err(violation) => Err(violation),
        }
    }

    /// Check `estimate` and reserve it until the hold is dropped. Concurrent
    /// callers are admitted one at a time, so in hard mode the ceiling holds
    /// even when many requests are in flight. Soft mode reserves regardless.
    pub fn reserve_budget(&self, caller: Option<&str>, estimate: f64) -> Result<BudgetHold, BudgetViolation> {
        self.reserve_budget_at(caller, estimate, Utc::now())
    }

    pub fn reserve_budget_at(
        &self,
        caller: Option<&str>,
        estimate: f64,
        at: DateTime<Utc>,
    ) -> Result<BudgetHold, BudgetViolation> {
        match self.budgets.reserve(caller, estimate, at) {
            Ok(hold) => Ok(hold),
            Err(violation) if self.budgets.config().mode == BudgetMode::Soft => {
                tracing::warn!(
                    scope = %violation.scope,
                    spent = violation.spent,
                    estimate = violation.estimate,
                    ceiling = violation.ceiling,
                    "Budget ceiling exceeded (soft mode, proceeding)"
                );
                Ok(self.budgets.hold(caller, estimate, at))
            }
            Err(violation) => Err(violation),
        }
    }

    /// Price and record an attempt; returns its cost
    pub fn track_usage(&self, event: UsageEvent) -> f64 {
        let cost = self.calculate_cost(&event.provider, &event.model, &event.tokens);

        let record = UsageRecord {
            timestamp: event.timestamp,
            provider: event.provider,
            model: event.model,
            caller: event.caller,
            tokens: event.tokens,
            cost,
            latency_ms: event.latency_ms,
            success: event.success,
        };

        if let Err(e) = self.store.append(&record) {
            tracing::warn!(store = self.store.name(), error = %e, "Failed to persist usage record");
        }

        let crossings = self.budgets.record(
            &record.provider,
            &record.model,
            record.caller.as_deref(),
            cost,
            record.timestamp,
        );
        for crossing in crossings {
            self.alert(crossing);
        }

        tracing::debug!(
            provider = %record.provider,
            model = %record.model,
            tokens = record.tokens.total(),
            cost,
            success = record.success,
            "Usage tracked"
        );
        cost
    }

    fn alert(&self, crossing: BudgetCrossing) {
        tracing::warn!(
            scope = %crossing.scope,
            period = %crossing.period,
            spent = crossing.spent,
            ceiling = crossing.ceiling,
            "Budget alert threshold crossed"
        );
        if let Some(events) = &self.events {
            events.emit(RouterEvent::BudgetAlert {
                scope: crossing.scope,
                period: crossing.period.to_string(),
                spent: crossing.spent,
                ceiling: crossing.ceiling,
                threshold: crossing.threshold,
            });
        }
    }

    /// Aggregated usage for `start <= t < end`
    pub fn usage_stats(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<UsageStats, LedgerError> {
        let records = self.store.records_between(start, end)?;
        Ok(UsageStats::from_records(start, end, &records))
    }

    /// Budget status for the current periods
    pub fn budget_status(&self) -> BudgetStatus {
        self.budgets.status(Utc::now())
    }

    pub fn budget_status_at(&self, at: DateTime<Utc>) -> BudgetStatus {
        self.budgets.status(at)
    }
}

impl std::fmt::Debug for TokenTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenTracker")
            .field("pricing", &self.pricing)
            .field("budgets", &self.budgets)
            .field("store", &self.store.name())
            .finish_non_exhaustive()
    }
}
