//! The actuator control engine.
//!
//! Owns the channel registry, safety budgets, overrides, cycle groups and
//! dosing bookkeeping under a single lock, and is the only thing that talks
//! to the actuator transport. Every path that wants a channel in some state
//! (scheduler tick, dosing feedback, manual command, safety sweep, reconnect
//! resync) goes through [`Engine::submit`], so each attempt is checked the
//! same way and lands in the ledger exactly once.
//!
//! ## Locks
//!
//! ```text
//! pump_locks[ch] ──▶ core ──▶ ledger
//!                      └────▶ states (watch)
//! ```
//!
//! A dose pulse holds its pump lock for the whole pulse but takes `core` only
//! to open and to close. Reads of channel state go to the `states` snapshot
//! and never wait on `core` or on the transport.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use time::{Date, OffsetDateTime};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::budget::{BudgetSpec, BudgetStatus, BudgetTracker, ResourceId};
use crate::channel::{Applied, Channel, ChannelId, ChannelRegistry, ChannelSpec};
use crate::climate::{Co2Controller, Co2Decision, Co2Rule};
use crate::clock::Clock;
use crate::cycle::{CycleGroup, CycleGroupSpec, CycleState, GroupKind};
use crate::dosing::{DosingController, DosingRule, PlannedDose, Quantity};
use crate::error::Rejected;
use crate::ledger::{ActionLedger, ActionOutcome, ActionRecord, ActionSource, LedgerSettings};
use crate::light::LightPhase;
use crate::manual::{Override, OverrideTable, MAX_OVERRIDE};
use crate::transport::ActuatorTransport;

pub struct EngineSettings {
    pub channels: Vec<ChannelSpec>,
    pub budgets: Vec<BudgetSpec>,
    pub cycles: Vec<CycleGroupSpec>,
    pub dosing: Vec<DosingRule>,
    pub co2: Vec<Co2Rule>,
    pub ledger: LedgerSettings,
    pub day_boundary_hour: u8,
}

/// What a manual command is aimed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideTarget {
    Channel(ChannelId),
    Group(String),
}

/// Per-channel results of a command aimed at one or more channels.
pub type ChannelResults = Vec<(ChannelId, Result<Applied, Rejected>)>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub rolled_over: bool,
    pub overrides_expired: usize,
    pub safety_shutoffs: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub suppressed: usize,
    pub rejected: usize,
    pub doses_started: usize,
}

impl TickReport {
    fn count(&mut self, result: &Result<Applied, Rejected>) {
        match result {
            Ok(Applied::Changed) => self.applied += 1,
            Ok(Applied::Unchanged) => self.unchanged += 1,
            Err(Rejected::OverrideActive { .. }) => self.suppressed += 1,
            Err(_) => self.rejected += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub group: String,
    pub kind: GroupKind,
    pub enabled: bool,
    pub state: CycleState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadingStatus {
    pub quantity: Quantity,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    #[serde(with = "time::serde::rfc3339")]
    pub now: OffsetDateTime,
    pub budget_day: Option<String>,
    pub light_on: Option<bool>,
    pub channels: Vec<Channel>,
    pub groups: Vec<GroupStatus>,
    pub overrides: Vec<Override>,
    pub budgets: Vec<BudgetStatus>,
    pub readings: Vec<ReadingStatus>,
    pub conflicts_detected: u64,
}

/// One attempt to put a channel into a state.
struct Request<'a> {
    channel: &'a ChannelId,
    desired: bool,
    /// Charged against a volume budget when turning on.
    volume_ml: f64,
    source: ActionSource,
    details: serde_json::Value,
}

struct Core {
    registry: ChannelRegistry,
    budgets: BudgetTracker,
    overrides: OverrideTable,
    groups: Vec<CycleGroup>,
    dosing: DosingController,
    co2: Co2Controller,
}

pub struct Engine {
    clock: Arc<dyn Clock>,
    transport: Arc<dyn ActuatorTransport>,
    light: Arc<dyn LightPhase>,
    core: Mutex<Core>,
    ledger: std::sync::Mutex<ActionLedger>,
    states: watch::Sender<BTreeMap<ChannelId, bool>>,
    pump_locks: HashMap<ChannelId, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn ActuatorTransport>,
        light: Arc<dyn LightPhase>,
    ) -> Arc<Self> {
        let registry = ChannelRegistry::new(settings.channels);
        let (states, _) = watch::channel(registry.states());
        let pump_locks = registry
            .ids()
            .into_iter()
            .map(|id| (id, Arc::new(Mutex::new(()))))
            .collect();

        info!(
            channels = registry.ids().len(),
            budgets = settings.budgets.len(),
            groups = settings.cycles.len(),
            dosing_rules = settings.dosing.len(),
            co2_rules = settings.co2.len(),
            "engine ready"
        );

        Arc::new(Self {
            clock,
            transport,
            light,
            core: Mutex::new(Core {
                registry,
                budgets: BudgetTracker::new(settings.budgets, settings.day_boundary_hour),
                overrides: OverrideTable::default(),
                groups: settings.cycles.into_iter().map(CycleGroup::new).collect(),
                dosing: DosingController::new(settings.dosing),
                co2: Co2Controller::new(settings.co2),
            }),
            ledger: std::sync::Mutex::new(ActionLedger::new(settings.ledger)),
            states,
            pump_locks,
        })
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    // -----------------------------------------------------------------------
    // The one mutation path
    // -----------------------------------------------------------------------

    /// Check, apply and record one request. Scheduled and feedback requests
    /// for a channel under a manual override are recorded as suppressed and
    /// not applied.
    fn submit(
        &self,
        core: &mut Core,
        req: Request<'_>,
        now: OffsetDateTime,
        mono: Instant,
    ) -> Result<Applied, Rejected> {
        let overridable = matches!(req.source, ActionSource::Scheduled | ActionSource::AutoFeedback);
        let result = match core.overrides.active(req.channel, mono) {
            Some(o) if overridable => Err(Rejected::OverrideActive {
                channel: req.channel.clone(),
                remaining_secs: o.remaining_secs(mono),
            }),
            _ => core.registry.transition(
                req.channel,
                req.desired,
                req.volume_ml,
                &mut core.budgets,
                self.transport.as_ref(),
                now,
                mono,
            ),
        };

        let outcome = match &result {
            Ok(Applied::Changed) => ActionOutcome::Applied,
            Ok(Applied::Unchanged) => ActionOutcome::Unchanged,
            Err(Rejected::OverrideActive { .. }) => ActionOutcome::Suppressed,
            Err(e) => ActionOutcome::Rejected {
                reason: e.to_string(),
            },
        };
        if result == Ok(Applied::Changed) {
            let (id, on) = (req.channel.clone(), req.desired);
            self.states.send_modify(|states| {
                states.insert(id, on);
            });
        }
        self.record(ActionRecord {
            timestamp: now,
            channel_id: req.channel.clone(),
            requested_state: req.desired,
            source: req.source,
            details: req.details,
            outcome,
        });
        result
    }

    fn record(&self, record: ActionRecord) {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(record);
    }

    fn resolve(core: &Core, target: &OverrideTarget) -> Result<Vec<ChannelId>, Rejected> {
        match target {
            OverrideTarget::Channel(id) => match core.registry.get(id) {
                Some(_) => Ok(vec![id.clone()]),
                None => Err(Rejected::UnknownChannel(id.clone())),
            },
            OverrideTarget::Group(group) => {
                let ids: Vec<ChannelId> =
                    core.registry.in_group(group).map(|c| c.id.clone()).collect();
                if ids.is_empty() {
                    Err(Rejected::UnknownGroup(group.clone()))
                } else {
                    Ok(ids)
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Direct state changes
    // -----------------------------------------------------------------------

    /// Ask for `channel` to be in `desired`. Scheduled and feedback sources
    /// lose to an active override.
    pub async fn set_state(
        &self,
        channel: &ChannelId,
        desired: bool,
        source: ActionSource,
        details: serde_json::Value,
    ) -> Result<Applied, Rejected> {
        let mut core = self.core.lock().await;
        let (now, mono) = (self.clock.now(), self.clock.monotonic());
        let result = self.submit(
            &mut core,
            Request {
                channel,
                desired,
                volume_ml: 0.0,
                source,
                details,
            },
            now,
            mono,
        );
        if let Err(e) = &result {
            warn!(channel = %channel, desired, source = source.as_str(), reason = %e, "set_state did not take effect");
        }
        result
    }

    /// Turn every channel off and write OFF to every output, whatever the
    /// registry believes. Clears all overrides.
    pub async fn all_off(&self, reason: &str) -> ChannelResults {
        let mut core = self.core.lock().await;
        let (now, mono) = (self.clock.now(), self.clock.monotonic());
        for o in core.overrides.all() {
            core.overrides.remove(&o.channel_id);
        }

        let mut results = Vec::new();
        for id in core.registry.ids() {
            let mut result = self.submit(
                &mut core,
                Request {
                    channel: &id,
                    desired: false,
                    volume_ml: 0.0,
                    source: ActionSource::SafetyShutoff,
                    details: json!({ "reason": reason }),
                },
                now,
                mono,
            );
            if result == Ok(Applied::Unchanged) {
                if let Err(e) = core.registry.rewrite(&id, self.transport.as_ref()) {
                    result = Err(e);
                }
            }
            if let Err(e) = &result {
                error!(channel = %id, reason = %e, "all_off: could not confirm channel is off");
            }
            results.push((id, result));
        }
        info!(reason, channels = results.len(), "all channels off");
        results
    }

    /// Write every channel's recorded state to the transport again, e.g.
    /// after the relay board or its link came back.
    pub async fn resync(&self) -> ChannelResults {
        let core = self.core.lock().await;
        let now = self.clock.now();
        let mut results = Vec::new();
        for id in core.registry.ids() {
            let written = core.registry.rewrite(&id, self.transport.as_ref());
            let on = core.registry.get(&id).map(|c| c.on).unwrap_or(false);
            let outcome = match &written {
                Ok(_) => ActionOutcome::Applied,
                Err(e) => {
                    warn!(channel = %id, reason = %e, "resync: write failed");
                    ActionOutcome::Rejected {
                        reason: e.to_string(),
                    }
                }
            };
            self.record(ActionRecord {
                timestamp: now,
                channel_id: id.clone(),
                requested_state: on,
                source: ActionSource::ReconnectResync,
                details: json!({ "reason": "outputs resynchronised" }),
                outcome,
            });
            results.push((id, written.map(|_| Applied::Changed)));
        }
        info!(channels = results.len(), "resync complete");
        results
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// One pass of the control loop at wall-clock `now`:
    ///
    /// 1. budget day roll-over
    /// 2. expired overrides revert to OFF
    /// 3. safety sweep of running duration budgets
    /// 4. cycle and photoperiod groups
    /// 5. CO2 injectors
    /// 6. dosing; pulses run in their own tasks after the lock is released
    ///
    /// Returns as soon as the pulses are spawned, before any of them has
    /// closed its pump. `doses_started` counts pulses launched, not finished.
    pub async fn tick(self: &Arc<Self>, now: OffsetDateTime) -> TickReport {
        let mut report = TickReport::default();
        let doses = {
            let mut core = self.core.lock().await;
            let mono = self.clock.monotonic();

            report.rolled_over = core.budgets.roll_over(now, mono);

            for o in core.overrides.expired(mono) {
                self.revert_override(&mut core, &o, now, mono);
                report.overrides_expired += 1;
            }

            report.safety_shutoffs = self.safety_sweep(&mut core, now, mono);
            self.run_groups(&mut core, now, mono, &mut report);
            self.run_co2(&mut core, now, mono, &mut report);
            self.plan_doses(&mut core, now, mono)
        };

        report.doses_started = doses.len();
        for dose in doses {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                let details = json!({
                    "quantity": dose.quantity,
                    "measured": dose.measured,
                    "target": dose.target,
                    "direction": dose.direction,
                    "volume_ml": dose.volume_ml,
                });
                if let Err(e) = engine
                    .pulse(&dose.pump, dose.volume_ml, ActionSource::AutoFeedback, details)
                    .await
                {
                    warn!(pump = %dose.pump, reason = %e, "dosing: pulse did not run");
                }
            });
        }
        report
    }

    fn revert_override(&self, core: &mut Core, o: &Override, now: OffsetDateTime, mono: Instant) {
        info!(channel = %o.channel_id, was = o.desired_state, "override expired");
        let result = self.submit(
            core,
            Request {
                channel: &o.channel_id,
                desired: false,
                volume_ml: 0.0,
                source: ActionSource::Manual,
                details: json!({ "reason": "override expired" }),
            },
            now,
            mono,
        );
        if let Err(e) = result {
            warn!(channel = %o.channel_id, reason = %e, "override expiry: could not turn channel off");
        }
    }

    /// Force off every channel whose duration budget has been broken while
    /// running, and lock the resource out.
    fn safety_sweep(&self, core: &mut Core, now: OffsetDateTime, mono: Instant) -> usize {
        let mut shutoffs = 0;
        for (resource, reason) in core.budgets.overruns(mono) {
            let running: Vec<ChannelId> = core
                .registry
                .iter()
                .filter(|c| c.on && c.budget.as_ref() == Some(&resource))
                .map(|c| c.id.clone())
                .collect();
            for id in running {
                warn!(channel = %id, %resource, %reason, "SAFETY SHUTOFF");
                core.overrides.remove(&id);
                let result = self.submit(
                    core,
                    Request {
                        channel: &id,
                        desired: false,
                        volume_ml: 0.0,
                        source: ActionSource::SafetyShutoff,
                        details: json!({ "reason": reason.to_string() }),
                    },
                    now,
                    mono,
                );
                match result {
                    Ok(_) => shutoffs += 1,
                    Err(e) => error!(channel = %id, reason = %e, "safety shutoff failed"),
                }
            }
            core.budgets.trip(&resource, mono);
        }
        shutoffs
    }

    fn run_groups(&self, core: &mut Core, now: OffsetDateTime, mono: Instant, report: &mut TickReport) {
        let is_day = self.light.is_day(now);
        for idx in 0..core.groups.len() {
            let Some(on) = core.groups[idx].decide(now, is_day) else {
                continue;
            };
            let group = core.groups[idx].name().to_string();
            let channels: Vec<ChannelId> =
                core.registry.in_group(&group).map(|c| c.id.clone()).collect();

            let mut rejection = None;
            for id in &channels {
                let result = self.submit(
                    core,
                    Request {
                        channel: id,
                        desired: on,
                        volume_ml: 0.0,
                        source: ActionSource::Scheduled,
                        details: json!({ "group": group }),
                    },
                    now,
                    mono,
                );
                report.count(&result);
                match result {
                    Err(Rejected::OverrideActive { .. }) | Ok(_) => {}
                    Err(e) => rejection = Some((id.clone(), e)),
                }
            }

            match rejection {
                Some((id, e)) => {
                    let reason = e.to_string();
                    if core.groups[idx].note_rejection(&reason) {
                        warn!(%group, channel = %id, %reason, "cycle: decision rejected");
                    } else {
                        debug!(%group, channel = %id, %reason, "cycle: decision still rejected");
                    }
                }
                None => core.groups[idx].clear_rejection(),
            }
        }
    }

    /// Switch CO2 injectors that are not already where their rule wants
    /// them. Inside the band nothing is submitted.
    fn run_co2(&self, core: &mut Core, now: OffsetDateTime, mono: Instant, report: &mut TickReport) {
        let is_day = self.light.is_day(now);
        let reading = core.dosing.reading(Quantity::Co2);
        for (id, decision) in core.co2.plan(reading.as_ref(), is_day, now) {
            let Some(desired) = decision.desired() else {
                continue;
            };
            if core.registry.get(&id).map(|c| c.on) == Some(desired) {
                continue;
            }
            let details = match decision {
                Co2Decision::On { measured, target } | Co2Decision::Off { measured, target } => {
                    json!({ "quantity": Quantity::Co2, "measured": measured, "target": target })
                }
                Co2Decision::Stale { age_secs } => {
                    json!({ "quantity": Quantity::Co2, "reason": "stale reading", "age_secs": age_secs })
                }
                Co2Decision::NoReading | Co2Decision::Hold => {
                    json!({ "quantity": Quantity::Co2, "reason": "no reading" })
                }
            };
            let result = self.submit(
                core,
                Request {
                    channel: &id,
                    desired,
                    volume_ml: 0.0,
                    source: ActionSource::AutoFeedback,
                    details,
                },
                now,
                mono,
            );
            report.count(&result);
            match result {
                Ok(Applied::Changed) => info!(channel = %id, on = desired, "co2: injector switched"),
                Ok(Applied::Unchanged) | Err(Rejected::OverrideActive { .. }) => {}
                Err(e) => warn!(channel = %id, reason = %e, "co2: injector not switched"),
            }
        }
    }

    /// Decide doses and commit the ones that may run. The caller runs the
    /// pulses once the core lock is released.
    fn plan_doses(&self, core: &mut Core, now: OffsetDateTime, mono: Instant) -> Vec<PlannedDose> {
        let day = core
            .budgets
            .current_day()
            .unwrap_or_else(|| core.budgets.budget_day(now));
        let mut committed = Vec::new();

        for dose in core.dosing.plan(now, day) {
            if let Some(o) = core.overrides.active(&dose.pump, mono) {
                let remaining_secs = o.remaining_secs(mono);
                self.record(ActionRecord {
                    timestamp: now,
                    channel_id: dose.pump.clone(),
                    requested_state: true,
                    source: ActionSource::AutoFeedback,
                    details: json!({ "quantity": dose.quantity, "measured": dose.measured, "volume_ml": dose.volume_ml }),
                    outcome: ActionOutcome::Suppressed,
                });
                debug!(pump = %dose.pump, remaining_secs, "dosing: suppressed by manual override");
                continue;
            }

            let budget = core
                .registry
                .get(&dose.pump)
                .and_then(|c| c.budget.clone());
            if let Some(resource) = budget {
                if let Err(e) = core.budgets.check(&resource, dose.volume_ml, mono) {
                    if core.dosing.mark_exhausted(dose.rule, day) {
                        warn!(
                            quantity = %dose.quantity,
                            pump = %dose.pump,
                            reason = %e,
                            "dosing: budget exhausted, no more doses today"
                        );
                        self.record(ActionRecord {
                            timestamp: now,
                            channel_id: dose.pump.clone(),
                            requested_state: true,
                            source: ActionSource::AutoFeedback,
                            details: json!({ "quantity": dose.quantity, "volume_ml": dose.volume_ml }),
                            outcome: ActionOutcome::Rejected {
                                reason: e.to_string(),
                            },
                        });
                    }
                    continue;
                }
            }

            info!(
                quantity = %dose.quantity,
                measured = dose.measured,
                target = dose.target,
                pump = %dose.pump,
                volume_ml = dose.volume_ml,
                "dosing: correcting"
            );
            core.dosing.mark_dosed(dose.rule, now);
            committed.push(dose);
        }
        committed
    }

    // -----------------------------------------------------------------------
    // Dosing pulses
    // -----------------------------------------------------------------------

    /// Dispense `volume_ml` from `pump` by hand.
    pub async fn dose(&self, pump: &ChannelId, volume_ml: f64) -> Result<Applied, Rejected> {
        self.pulse(
            pump,
            volume_ml,
            ActionSource::Manual,
            json!({ "volume_ml": volume_ml, "reason": "manual dose" }),
        )
        .await
    }

    /// Open `pump`, hold it for `volume / flow` seconds, close it. Pulses on
    /// one pump queue behind each other.
    async fn pulse(
        &self,
        pump: &ChannelId,
        volume_ml: f64,
        source: ActionSource,
        details: serde_json::Value,
    ) -> Result<Applied, Rejected> {
        let lock = self
            .pump_locks
            .get(pump)
            .cloned()
            .ok_or_else(|| Rejected::UnknownChannel(pump.clone()))?;
        let _pulse = lock.lock().await;

        let hold = {
            let mut core = self.core.lock().await;
            let (now, mono) = (self.clock.now(), self.clock.monotonic());
            let flow = core
                .registry
                .get(pump)
                .map(|c| c.flow_ml_per_sec)
                .ok_or_else(|| Rejected::UnknownChannel(pump.clone()))?;
            if !(volume_ml.is_finite() && volume_ml > 0.0) {
                return Err(Rejected::InvalidVolume(volume_ml));
            }
            let hold = Duration::try_from_secs_f64(volume_ml / flow)
                .map_err(|_| Rejected::InvalidVolume(volume_ml))?;
            let opened = self.submit(
                &mut core,
                Request {
                    channel: pump,
                    desired: true,
                    volume_ml,
                    source,
                    details: details.clone(),
                },
                now,
                mono,
            )?;
            if opened == Applied::Unchanged {
                // Already running under someone else's command; leave it be.
                return Ok(Applied::Unchanged);
            }
            hold
        };

        debug!(pump = %pump, volume_ml, hold_ms = hold.as_millis() as u64, "dosing: pulse open");
        tokio::time::sleep(hold).await;

        let mut core = self.core.lock().await;
        let (now, mono) = (self.clock.now(), self.clock.monotonic());
        let mut close = details;
        if close.is_object() {
            close["reason"] = json!("pulse complete");
        }
        let closed = self.submit(
            &mut core,
            Request {
                channel: pump,
                desired: false,
                volume_ml: 0.0,
                source,
                details: close,
            },
            now,
            mono,
        );
        if let Err(e) = closed {
            error!(pump = %pump, reason = %e, "dosing: pulse close failed, retrying as safety shutoff");
            let retry = self.submit(
                &mut core,
                Request {
                    channel: pump,
                    desired: false,
                    volume_ml: 0.0,
                    source: ActionSource::SafetyShutoff,
                    details: json!({ "reason": "pulse close failed", "error": e.to_string() }),
                },
                now,
                mono,
            );
            if let Err(e) = retry {
                error!(pump = %pump, reason = %e, "dosing: PUMP MAY STILL BE RUNNING");
                return Err(e);
            }
        }
        Ok(Applied::Changed)
    }

    // -----------------------------------------------------------------------
    // Manual overrides
    // -----------------------------------------------------------------------

    /// Hold `target` in `desired` for `duration`, then turn it off. Each
    /// channel's override is only installed if its action took effect.
    pub async fn set_override(
        self: &Arc<Self>,
        target: OverrideTarget,
        desired: bool,
        duration: Duration,
    ) -> Result<ChannelResults, Rejected> {
        let invalid = || Rejected::InvalidOverride {
            secs: duration.as_secs(),
            max_secs: MAX_OVERRIDE.as_secs(),
        };
        if duration.is_zero() || duration > MAX_OVERRIDE {
            return Err(invalid());
        }
        let span = time::Duration::try_from(duration).map_err(|_| invalid())?;
        let channels = {
            let core = self.core.lock().await;
            Self::resolve(&core, &target)?
        };

        let mut results = Vec::new();
        for id in channels {
            // Wait out any pulse running on this channel.
            let lock = self.pump_locks.get(&id).cloned();
            let _pulse = match &lock {
                Some(l) => Some(l.lock().await),
                None => None,
            };

            let mut core = self.core.lock().await;
            let (now, mono) = (self.clock.now(), self.clock.monotonic());
            let (Some(expires_at), Some(deadline)) =
                (now.checked_add(span), mono.checked_add(duration))
            else {
                return Err(invalid());
            };
            let flow = core.registry.get(&id).map(|c| c.flow_ml_per_sec).unwrap_or(0.0);
            let result = self.submit(
                &mut core,
                Request {
                    channel: &id,
                    desired,
                    volume_ml: if desired { flow * duration.as_secs_f64() } else { 0.0 },
                    source: ActionSource::Manual,
                    details: json!({ "override_secs": duration.as_secs() }),
                },
                now,
                mono,
            );

            match &result {
                Ok(_) => {
                    let generation = core.overrides.install(id.clone(), desired, expires_at, deadline);
                    info!(channel = %id, desired, secs = duration.as_secs(), generation, "override set");

                    let engine = Arc::clone(self);
                    let channel = id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(duration).await;
                        engine.expire_override(&channel, generation).await;
                    });
                }
                Err(e) => warn!(channel = %id, desired, reason = %e, "override not installed"),
            }
            results.push((id, result));
        }
        Ok(results)
    }

    /// Timer path for override expiry. Does nothing if the override was
    /// already replaced, cancelled or expired by a tick.
    async fn expire_override(&self, channel: &ChannelId, generation: u64) {
        let mut core = self.core.lock().await;
        if let Some(o) = core.overrides.take_if_generation(channel, generation) {
            let (now, mono) = (self.clock.now(), self.clock.monotonic());
            self.revert_override(&mut core, &o, now, mono);
        }
    }

    /// Drop the override and put the channel where the scheduler wants it
    /// right now: its group's decision, or OFF outside any cycle group.
    pub async fn cancel_override(&self, target: OverrideTarget) -> Result<ChannelResults, Rejected> {
        let mut core = self.core.lock().await;
        let channels = Self::resolve(&core, &target)?;
        let (now, mono) = (self.clock.now(), self.clock.monotonic());
        let is_day = self.light.is_day(now);

        let mut results = Vec::new();
        for id in channels {
            if core.overrides.remove(&id).is_some() {
                info!(channel = %id, "override cancelled");
            }
            let group = core.registry.get(&id).and_then(|c| c.group.clone());
            let natural = match group
                .as_deref()
                .and_then(|g| core.groups.iter_mut().find(|cg| cg.name() == g))
            {
                Some(cg) => cg.decide(now, is_day),
                None => Some(false),
            };
            let Some(desired) = natural else {
                // Group is holding; leave the channel as it is.
                results.push((id, Ok(Applied::Unchanged)));
                continue;
            };
            let result = self.submit(
                &mut core,
                Request {
                    channel: &id,
                    desired,
                    volume_ml: 0.0,
                    source: ActionSource::Scheduled,
                    details: json!({ "reason": "override cancelled", "group": group }),
                },
                now,
                mono,
            );
            results.push((id, result));
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Sensor feed
    // -----------------------------------------------------------------------

    pub async fn push_reading(&self, quantity: Quantity, value: f64, at: OffsetDateTime) {
        debug!(%quantity, value, "reading");
        self.core.lock().await.dosing.push_reading(quantity, value, at);
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_state(&self, channel: &ChannelId) -> Option<bool> {
        self.states.borrow().get(channel).copied()
    }

    pub fn get_all_states(&self) -> BTreeMap<ChannelId, bool> {
        self.states.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<ChannelId, bool>> {
        self.states.subscribe()
    }

    pub fn history(&self, channel: &ChannelId) -> Vec<ActionRecord> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history(channel)
    }

    pub fn recent(&self, limit: usize) -> Vec<ActionRecord> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(limit)
    }

    /// Records queued for persistence since the last call.
    pub fn drain_exported_actions(&self) -> Vec<ActionRecord> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain_export()
    }

    pub async fn budget_status(&self, resource: &ResourceId) -> Option<BudgetStatus> {
        let mono = self.clock.monotonic();
        self.core.lock().await.budgets.status(resource, mono)
    }

    pub async fn set_budget_limit(&self, resource: &ResourceId, daily_limit: f64) -> bool {
        self.core.lock().await.budgets.set_limit(resource, daily_limit)
    }

    /// Today's budget usage, for persistence.
    pub async fn budget_totals(&self) -> (Date, Vec<(ResourceId, f64)>) {
        let core = self.core.lock().await;
        let day = core
            .budgets
            .current_day()
            .unwrap_or_else(|| core.budgets.budget_day(self.clock.now()));
        (day, core.budgets.totals(self.clock.monotonic()))
    }

    /// Reload persisted totals if they belong to the current budget day.
    pub async fn restore_budget_totals(&self, day: Date, totals: &[(ResourceId, f64)]) -> bool {
        let mut core = self.core.lock().await;
        if core.budgets.budget_day(self.clock.now()) != day {
            return false;
        }
        core.budgets.restore(day, totals);
        info!(%day, resources = totals.len(), "budget totals restored");
        true
    }

    pub async fn status(&self) -> EngineStatus {
        let core = self.core.lock().await;
        let (now, mono) = (self.clock.now(), self.clock.monotonic());
        let conflicts_detected = self
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .conflicts_detected();
        EngineStatus {
            now,
            budget_day: core.budgets.current_day().map(|d| d.to_string()),
            light_on: self.light.is_day(now),
            channels: core.registry.iter().cloned().collect(),
            groups: core
                .groups
                .iter()
                .map(|g| GroupStatus {
                    group: g.name().to_string(),
                    kind: g.spec().kind,
                    enabled: g.spec().enabled,
                    state: g.state(),
                })
                .collect(),
            overrides: core
                .overrides
                .all()
                .into_iter()
                .filter(|o| mono < o.deadline)
                .collect(),
            budgets: core.budgets.statuses(mono),
            readings: [Quantity::Ph, Quantity::Ec, Quantity::Co2]
                .into_iter()
                .filter_map(|q| {
                    core.dosing.reading(q).map(|r| ReadingStatus {
                        quantity: q,
                        value: r.value,
                        at: r.at,
                    })
                })
                .collect(),
            conflicts_detected,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
