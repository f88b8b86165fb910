//! Safety budgets: per-resource daily accumulators and continuous-run timers.
//!
//! Two kinds of resource are tracked:
//!
//! - **volume** (dosing pumps): an ON is admitted only if the requested
//!   volume still fits under the daily limit; admission charges it.
//! - **duration** (watering pump, devices): an ON is admitted only while the
//!   daily run time is under the limit, the resource has not been running
//!   longer than `max_continuous_run_sec`, and no post-shutoff cooldown is in
//!   force. Run time is credited when the channel turns off.
//!
//! Turning something off is never budget-checked. Accumulators reset once
//! per budget day; the day starts at `day_boundary_hour` local time.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tracing::{info, warn};

use crate::error::Rejected;

pub const DEFAULT_SHUTOFF_COOLDOWN_SEC: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetKind {
    /// Millilitres per day.
    Volume,
    /// Seconds of run time per day.
    Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSpec {
    pub id: ResourceId,
    pub kind: BudgetKind,
    pub daily_limit: f64,
    #[serde(default)]
    pub max_continuous_run_sec: Option<u64>,
    #[serde(default = "default_shutoff_cooldown")]
    pub shutoff_cooldown_sec: u64,
}

fn default_shutoff_cooldown() -> u64 {
    DEFAULT_SHUTOFF_COOLDOWN_SEC
}

// ---------------------------------------------------------------------------
// Per-resource state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SafetyBudget {
    spec: BudgetSpec,
    daily_accumulated: f64,
    /// Set while a duration resource is on; never moved by day roll-over.
    continuous_run_started_at: Option<Instant>,
    /// Start of the run time not yet credited to `daily_accumulated`.
    accounted_from: Option<Instant>,
    lockout_until: Option<Instant>,
}

impl SafetyBudget {
    fn new(spec: BudgetSpec) -> Self {
        Self {
            spec,
            daily_accumulated: 0.0,
            continuous_run_started_at: None,
            accounted_from: None,
            lockout_until: None,
        }
    }

    /// Credited usage plus the uncredited part of a run in progress.
    fn used(&self, mono: Instant) -> f64 {
        let running = self
            .accounted_from
            .map(|from| mono.saturating_duration_since(from).as_secs_f64())
            .unwrap_or(0.0);
        self.daily_accumulated + running
    }

    fn running_for(&self, mono: Instant) -> Option<Duration> {
        self.continuous_run_started_at
            .map(|since| mono.saturating_duration_since(since))
    }

    fn check(&self, amount: f64, mono: Instant) -> Result<(), Rejected> {
        let resource = &self.spec.id;
        match self.spec.kind {
            BudgetKind::Volume => {
                if self.daily_accumulated + amount > self.spec.daily_limit {
                    return Err(Rejected::DailyLimitExceeded {
                        resource: resource.clone(),
                        used: self.daily_accumulated,
                        requested: amount,
                        limit: self.spec.daily_limit,
                    });
                }
            }
            BudgetKind::Duration => {
                if let Some(until) = self.lockout_until {
                    if mono < until {
                        return Err(Rejected::SafetyLockout {
                            resource: resource.clone(),
                            remaining_secs: (until - mono).as_secs(),
                        });
                    }
                }
                let used = self.used(mono);
                if used >= self.spec.daily_limit {
                    return Err(Rejected::DailyLimitExceeded {
                        resource: resource.clone(),
                        used,
                        requested: amount,
                        limit: self.spec.daily_limit,
                    });
                }
                if let (Some(max), Some(ran)) =
                    (self.spec.max_continuous_run_sec, self.running_for(mono))
                {
                    if ran.as_secs() > max {
                        return Err(Rejected::ContinuousRunExceeded {
                            resource: resource.clone(),
                            ran_secs: ran.as_secs(),
                            max_secs: max,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub resource: ResourceId,
    pub kind: BudgetKind,
    pub used: f64,
    pub daily_limit: f64,
    pub remaining: f64,
    pub running_secs: Option<u64>,
    pub max_continuous_run_sec: Option<u64>,
    pub locked_out_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub struct BudgetTracker {
    budgets: BTreeMap<ResourceId, SafetyBudget>,
    day: Option<Date>,
    boundary_hour: u8,
}

impl BudgetTracker {
    pub fn new(specs: impl IntoIterator<Item = BudgetSpec>, boundary_hour: u8) -> Self {
        Self {
            budgets: specs
                .into_iter()
                .map(|s| (s.id.clone(), SafetyBudget::new(s)))
                .collect(),
            day: None,
            boundary_hour,
        }
    }

    /// The budget day `now` falls in.
    pub fn budget_day(&self, now: OffsetDateTime) -> Date {
        (now - time::Duration::hours(i64::from(self.boundary_hour))).date()
    }

    pub fn current_day(&self) -> Option<Date> {
        self.day
    }

    /// Reset every accumulator if `now` is in a new budget day. Returns true
    /// only for the call that performed the reset.
    pub fn roll_over(&mut self, now: OffsetDateTime, mono: Instant) -> bool {
        let day = self.budget_day(now);
        match self.day {
            Some(current) if current == day => false,
            None => {
                self.day = Some(day);
                false
            }
            Some(previous) => {
                for budget in self.budgets.values_mut() {
                    if budget.daily_accumulated > 0.0 {
                        info!(
                            resource = %budget.spec.id,
                            previous_total = budget.daily_accumulated,
                            "budget: daily total reset"
                        );
                    }
                    budget.daily_accumulated = 0.0;
                    if budget.accounted_from.is_some() {
                        budget.accounted_from = Some(mono);
                    }
                }
                info!(%previous, %day, "budget: new budget day");
                self.day = Some(day);
                true
            }
        }
    }

    /// Load persisted totals for `day`. Totals for any other day are stale.
    pub fn restore(&mut self, day: Date, totals: &[(ResourceId, f64)]) {
        self.day = Some(day);
        for (resource, amount) in totals {
            match self.budgets.get_mut(resource) {
                Some(budget) => budget.daily_accumulated = *amount,
                None => warn!(%resource, "budget: ignoring persisted total for unknown resource"),
            }
        }
    }

    /// Admit `amount` against `resource`, charging volume budgets on success.
    /// Resources without a budget are always admitted.
    pub fn admit(&mut self, resource: &ResourceId, amount: f64, mono: Instant) -> Result<(), Rejected> {
        let Some(budget) = self.budgets.get_mut(resource) else {
            return Ok(());
        };
        budget.check(amount, mono)?;
        if budget.spec.kind == BudgetKind::Volume {
            budget.daily_accumulated += amount;
        }
        Ok(())
    }

    /// Same decision as [`admit`](Self::admit) without charging anything.
    pub fn check(&self, resource: &ResourceId, amount: f64, mono: Instant) -> Result<(), Rejected> {
        match self.budgets.get(resource) {
            Some(budget) => budget.check(amount, mono),
            None => Ok(()),
        }
    }

    /// Undo a volume charge whose action never reached the hardware.
    pub fn refund(&mut self, resource: &ResourceId, amount: f64) {
        if let Some(budget) = self.budgets.get_mut(resource) {
            if budget.spec.kind == BudgetKind::Volume {
                budget.daily_accumulated = (budget.daily_accumulated - amount).max(0.0);
            }
        }
    }

    /// A duration resource was confirmed on.
    pub fn started(&mut self, resource: &ResourceId, mono: Instant) {
        if let Some(budget) = self.budgets.get_mut(resource) {
            if budget.spec.kind == BudgetKind::Duration {
                budget.continuous_run_started_at = Some(mono);
                budget.accounted_from = Some(mono);
            }
        }
    }

    /// A duration resource was confirmed off; credit its run time.
    pub fn stopped(&mut self, resource: &ResourceId, mono: Instant) {
        if let Some(budget) = self.budgets.get_mut(resource) {
            if budget.spec.kind == BudgetKind::Duration {
                budget.daily_accumulated = budget.used(mono);
                budget.continuous_run_started_at = None;
                budget.accounted_from = None;
            }
        }
    }

    /// Start the post-shutoff cooldown.
    pub fn trip(&mut self, resource: &ResourceId, mono: Instant) {
        if let Some(budget) = self.budgets.get_mut(resource) {
            let cooldown = Duration::from_secs(budget.spec.shutoff_cooldown_sec);
            budget.lockout_until = Some(mono + cooldown);
        }
    }

    /// Running duration resources that have broken a limit and must be
    /// forced off.
    pub fn overruns(&self, mono: Instant) -> Vec<(ResourceId, Rejected)> {
        self.budgets
            .values()
            .filter(|b| b.spec.kind == BudgetKind::Duration && b.continuous_run_started_at.is_some())
            .filter_map(|b| b.check(0.0, mono).err().map(|e| (b.spec.id.clone(), e)))
            .collect()
    }

    /// Change a limit. Lowering it below today's usage is allowed; actions
    /// already applied stay applied.
    pub fn set_limit(&mut self, resource: &ResourceId, daily_limit: f64) -> bool {
        match self.budgets.get_mut(resource) {
            Some(budget) => {
                info!(
                    %resource,
                    old = budget.spec.daily_limit,
                    new = daily_limit,
                    "budget: daily limit changed"
                );
                budget.spec.daily_limit = daily_limit;
                true
            }
            None => false,
        }
    }

    pub fn status(&self, resource: &ResourceId, mono: Instant) -> Option<BudgetStatus> {
        self.budgets.get(resource).map(|b| {
            let used = b.used(mono);
            BudgetStatus {
                resource: b.spec.id.clone(),
                kind: b.spec.kind,
                used,
                daily_limit: b.spec.daily_limit,
                remaining: (b.spec.daily_limit - used).max(0.0),
                running_secs: b.running_for(mono).map(|d| d.as_secs()),
                max_continuous_run_sec: b.spec.max_continuous_run_sec,
                locked_out_secs: b
                    .lockout_until
                    .filter(|until| mono < *until)
                    .map(|until| (until - mono).as_secs()),
            }
        })
    }

    pub fn statuses(&self, mono: Instant) -> Vec<BudgetStatus> {
        self.budgets
            .keys()
            .filter_map(|id| self.status(id, mono))
            .collect()
    }

    /// Today's usage for persistence, including any run in progress.
    pub fn totals(&self, mono: Instant) -> Vec<(ResourceId, f64)> {
        self.budgets
            .values()
            .map(|b| (b.spec.id.clone(), b.used(mono)))
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn volume(id: &str, limit: f64) -> BudgetSpec {
        BudgetSpec {
            id: id.into(),
            kind: BudgetKind::Volume,
            daily_limit: limit,
            max_continuous_run_sec: None,
            shutoff_cooldown_sec: DEFAULT_SHUTOFF_COOLDOWN_SEC,
        }
    }

    fn watering() -> BudgetSpec {
        BudgetSpec {
            id: "watering".into(),
            kind: BudgetKind::Duration,
            daily_limit: 600.0,
            max_continuous_run_sec: Some(300),
            shutoff_cooldown_sec: 300,
        }
    }

    // -- Volume budgets ---------------------------------------------------

    #[test]
    fn volume_admits_until_limit_then_rejects_without_charging() {
        let mut t = BudgetTracker::new([volume("ph_down", 20.0)], 0);
        let mono = Instant::now();
        let id = ResourceId::from("ph_down");

        for _ in 0..4 {
            t.admit(&id, 5.0, mono).unwrap();
        }
        let err = t.admit(&id, 5.0, mono).unwrap_err();
        assert!(matches!(err, Rejected::DailyLimitExceeded { .. }));

        let status = t.status(&id, mono).unwrap();
        assert_eq!(status.used, 20.0);
        assert!(status.used <= status.daily_limit);
    }

    #[test]
    fn volume_partial_fit_is_rejected() {
        let mut t = BudgetTracker::new([volume("ph_down", 12.0)], 0);
        let mono = Instant::now();
        let id = ResourceId::from("ph_down");
        t.admit(&id, 10.0, mono).unwrap();
        assert!(t.admit(&id, 5.0, mono).is_err());
        assert_eq!(t.status(&id, mono).unwrap().used, 10.0);
    }

    #[test]
    fn check_does_not_charge() {
        let t = BudgetTracker::new([volume("ph_up", 10.0)], 0);
        let mono = Instant::now();
        let id = ResourceId::from("ph_up");
        t.check(&id, 5.0, mono).unwrap();
        assert_eq!(t.status(&id, mono).unwrap().used, 0.0);
    }

    #[test]
    fn refund_returns_charge() {
        let mut t = BudgetTracker::new([volume("ph_up", 10.0)], 0);
        let mono = Instant::now();
        let id = ResourceId::from("ph_up");
        t.admit(&id, 5.0, mono).unwrap();
        t.refund(&id, 5.0);
        assert_eq!(t.status(&id, mono).unwrap().used, 0.0);
    }

    #[test]
    fn lowering_limit_mid_day_keeps_applied_usage() {
        let mut t = BudgetTracker::new([volume("nutrient", 50.0)], 0);
        let mono = Instant::now();
        let id = ResourceId::from("nutrient");
        t.admit(&id, 30.0, mono).unwrap();
        assert!(t.set_limit(&id, 20.0));

        let status = t.status(&id, mono).unwrap();
        assert_eq!(status.used, 30.0);
        assert_eq!(status.remaining, 0.0);
        assert!(t.admit(&id, 1.0, mono).is_err());
    }

    #[test]
    fn unknown_resource_is_admitted() {
        let mut t = BudgetTracker::new([], 0);
        t.admit(&"nothing".into(), 100.0, Instant::now()).unwrap();
    }

    // -- Duration budgets -------------------------------------------------

    #[test]
    fn duration_credits_run_time_on_stop() {
        let mut t = BudgetTracker::new([watering()], 0);
        let id = ResourceId::from("watering");
        let t0 = Instant::now();
        t.admit(&id, 0.0, t0).unwrap();
        t.started(&id, t0);
        t.stopped(&id, t0 + Duration::from_secs(90));
        assert_eq!(t.status(&id, t0).unwrap().used, 90.0);
    }

    #[test]
    fn duration_rejects_once_daily_limit_used() {
        let mut t = BudgetTracker::new([watering()], 0);
        let id = ResourceId::from("watering");
        let t0 = Instant::now();
        t.started(&id, t0);
        t.stopped(&id, t0 + Duration::from_secs(600));
        let err = t.admit(&id, 0.0, t0 + Duration::from_secs(700)).unwrap_err();
        assert!(matches!(err, Rejected::DailyLimitExceeded { .. }));
    }

    #[test]
    fn overrun_reported_after_max_continuous_run() {
        let mut t = BudgetTracker::new([watering()], 0);
        let id = ResourceId::from("watering");
        let t0 = Instant::now();
        t.started(&id, t0);

        assert!(t.overruns(t0 + Duration::from_secs(300)).is_empty());
        let overruns = t.overruns(t0 + Duration::from_secs(301));
        assert_eq!(overruns.len(), 1);
        assert!(matches!(overruns[0].1, Rejected::ContinuousRunExceeded { .. }));
    }

    #[test]
    fn trip_locks_out_until_cooldown_passes() {
        let mut t = BudgetTracker::new([watering()], 0);
        let id = ResourceId::from("watering");
        let t0 = Instant::now();
        t.trip(&id, t0);

        let err = t.admit(&id, 0.0, t0 + Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, Rejected::SafetyLockout { .. }));
        t.admit(&id, 0.0, t0 + Duration::from_secs(301)).unwrap();
    }

    // -- Day roll-over ----------------------------------------------------

    #[test]
    fn roll_over_resets_once_per_day() {
        let mut t = BudgetTracker::new([volume("ph_down", 20.0)], 0);
        let id = ResourceId::from("ph_down");
        let mono = Instant::now();

        assert!(!t.roll_over(datetime!(2024-05-01 23:59:50 UTC), mono));
        t.admit(&id, 15.0, mono).unwrap();

        assert!(t.roll_over(datetime!(2024-05-02 00:00:01 UTC), mono));
        assert_eq!(t.status(&id, mono).unwrap().used, 0.0);

        t.admit(&id, 5.0, mono).unwrap();
        // Repeated ticks near the boundary must not reset again.
        assert!(!t.roll_over(datetime!(2024-05-02 00:00:05 UTC), mono));
        assert!(!t.roll_over(datetime!(2024-05-02 00:04:59 UTC), mono));
        assert_eq!(t.status(&id, mono).unwrap().used, 5.0);
    }

    #[test]
    fn boundary_hour_shifts_the_budget_day() {
        let t = BudgetTracker::new([], 6);
        assert_eq!(
            t.budget_day(datetime!(2024-05-02 05:59:00 UTC)),
            time::macros::date!(2024-05-01)
        );
        assert_eq!(
            t.budget_day(datetime!(2024-05-02 06:00:00 UTC)),
            time::macros::date!(2024-05-02)
        );
    }

    #[test]
    fn roll_over_while_running_only_resets_accounting() {
        let mut t = BudgetTracker::new([watering()], 0);
        let id = ResourceId::from("watering");
        let t0 = Instant::now();
        t.roll_over(datetime!(2024-05-01 23:58:00 UTC), t0);
        t.started(&id, t0);

        let t1 = t0 + Duration::from_secs(120);
        assert!(t.roll_over(datetime!(2024-05-02 00:00:00 UTC), t1));
        let status = t.status(&id, t1).unwrap();
        assert_eq!(status.used, 0.0);
        assert_eq!(status.running_secs, Some(120));
    }

    #[test]
    fn restore_loads_persisted_totals() {
        let mut t = BudgetTracker::new([volume("ph_down", 20.0)], 0);
        let id = ResourceId::from("ph_down");
        t.restore(time::macros::date!(2024-05-01), &[(id.clone(), 18.0)]);
        assert!(t.admit(&id, 5.0, Instant::now()).is_err());
        assert!(!t.roll_over(datetime!(2024-05-01 12:00:00 UTC), Instant::now()));
    }
}
