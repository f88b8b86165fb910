//! Hysteresis dosing: keep pH and EC inside `target ± tolerance` by pulsing
//! the up or down pump.
//!
//! This module only decides. The engine checks overrides and budgets, then
//! runs the pulse outside its lock.

use std::collections::HashMap;
use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tracing::warn;

use crate::channel::ChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    Ph,
    Ec,
    /// Room CO2 in ppm. Read by the CO2 controller, never dosed.
    Co2,
}

impl Quantity {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ph" => Ok(Self::Ph),
            "ec" => Ok(Self::Ec),
            "co2" => Ok(Self::Co2),
            other => bail!("unknown quantity '{other}'"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ph => "ph",
            Self::Ec => "ec",
            Self::Co2 => "co2",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DosingRule {
    pub quantity: Quantity,
    pub target: f64,
    pub tolerance: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub up_pump: Option<ChannelId>,
    #[serde(default)]
    pub down_pump: Option<ChannelId>,
    #[serde(default = "default_dose_ml")]
    pub dose_ml: f64,
    /// Proportional gain in ml per unit of deviation. Unset doses a fixed
    /// `dose_ml`.
    #[serde(default)]
    pub ml_per_unit: Option<f64>,
    #[serde(default = "default_cooldown")]
    pub cooldown_sec: u64,
    #[serde(default = "default_max_reading_age")]
    pub max_reading_age_sec: u64,
}

fn default_true() -> bool {
    true
}
fn default_dose_ml() -> f64 {
    5.0
}
fn default_cooldown() -> u64 {
    300
}
fn default_max_reading_age() -> u64 {
    120
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: f64,
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Within tolerance, or the rule is disabled.
    Hold,
    Dose {
        pump: ChannelId,
        direction: Direction,
        volume_ml: f64,
        measured: f64,
    },
    /// Out of band but no pump is configured for that direction.
    NoCorrectivePump { direction: Direction, measured: f64 },
    Stale { age_secs: i64 },
    NoReading,
    CoolingDown { remaining_secs: i64 },
}

/// Pure decision for one rule.
pub fn decide(
    rule: &DosingRule,
    reading: Option<&Reading>,
    last_dose: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Decision {
    if !rule.enabled {
        return Decision::Hold;
    }
    let Some(reading) = reading else {
        return Decision::NoReading;
    };
    let age = (now - reading.at).whole_seconds();
    if age > rule.max_reading_age_sec as i64 {
        return Decision::Stale { age_secs: age };
    }

    let measured = reading.value;
    let direction = if measured < rule.target - rule.tolerance {
        Direction::Up
    } else if measured > rule.target + rule.tolerance {
        Direction::Down
    } else {
        return Decision::Hold;
    };

    if let Some(last) = last_dose {
        let since = (now - last).whole_seconds();
        let cooldown = rule.cooldown_sec as i64;
        if since < cooldown {
            return Decision::CoolingDown {
                remaining_secs: cooldown - since,
            };
        }
    }

    let pump = match direction {
        Direction::Up => rule.up_pump.clone(),
        Direction::Down => rule.down_pump.clone(),
    };
    let Some(pump) = pump else {
        return Decision::NoCorrectivePump {
            direction,
            measured,
        };
    };

    let deviation = (measured - rule.target).abs();
    let volume_ml = match rule.ml_per_unit {
        Some(gain) => rule.dose_ml.min(deviation * gain),
        None => rule.dose_ml,
    };
    Decision::Dose {
        pump,
        direction,
        volume_ml,
        measured,
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// A dose the controller wants; the engine decides whether it happens.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedDose {
    pub rule: usize,
    pub quantity: Quantity,
    pub pump: ChannelId,
    pub direction: Direction,
    pub volume_ml: f64,
    pub measured: f64,
    pub target: f64,
}

struct RuleState {
    rule: DosingRule,
    last_dose: Option<OffsetDateTime>,
    /// Budget day on which the pump's budget ran out.
    exhausted_on: Option<Date>,
    /// Last warning logged, so steady-state problems log once.
    last_alert: Option<String>,
}

pub struct DosingController {
    rules: Vec<RuleState>,
    readings: HashMap<Quantity, Reading>,
}

impl DosingController {
    pub fn new(rules: impl IntoIterator<Item = DosingRule>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|rule| RuleState {
                    rule,
                    last_dose: None,
                    exhausted_on: None,
                    last_alert: None,
                })
                .collect(),
            readings: HashMap::new(),
        }
    }

    pub fn push_reading(&mut self, quantity: Quantity, value: f64, at: OffsetDateTime) {
        self.readings.insert(quantity, Reading { value, at });
    }

    pub fn reading(&self, quantity: Quantity) -> Option<Reading> {
        self.readings.get(&quantity).copied()
    }

    pub fn rules(&self) -> impl Iterator<Item = &DosingRule> {
        self.rules.iter().map(|s| &s.rule)
    }

    /// Decide every rule for `now`. Rules whose pump budget ran out on
    /// `day` are skipped until the day changes.
    pub fn plan(&mut self, now: OffsetDateTime, day: Date) -> Vec<PlannedDose> {
        let mut planned = Vec::new();
        for (idx, state) in self.rules.iter_mut().enumerate() {
            if state.exhausted_on.is_some_and(|d| d == day) {
                continue;
            }
            let quantity = state.rule.quantity;
            let decision = decide(
                &state.rule,
                self.readings.get(&quantity),
                state.last_dose,
                now,
            );
            match decision {
                Decision::Dose {
                    pump,
                    direction,
                    volume_ml,
                    measured,
                } => {
                    state.last_alert = None;
                    planned.push(PlannedDose {
                        rule: idx,
                        quantity,
                        pump,
                        direction,
                        volume_ml,
                        measured,
                        target: state.rule.target,
                    });
                }
                Decision::NoCorrectivePump {
                    direction,
                    measured,
                } => {
                    let alert = format!("no {direction:?} pump");
                    if state.last_alert.as_deref() != Some(alert.as_str()) {
                        warn!(
                            %quantity,
                            measured,
                            target = state.rule.target,
                            tolerance = state.rule.tolerance,
                            ?direction,
                            "dosing: out of range but no corrective pump configured"
                        );
                        state.last_alert = Some(alert);
                    }
                }
                Decision::Stale { age_secs } => {
                    if state.last_alert.as_deref() != Some("stale") {
                        warn!(%quantity, age_secs, "dosing: reading is stale, not dosing");
                        state.last_alert = Some("stale".to_string());
                    }
                }
                Decision::Hold => state.last_alert = None,
                Decision::NoReading | Decision::CoolingDown { .. } => {}
            }
        }
        planned
    }

    /// Start the rule's cooldown. Called when a planned dose is committed,
    /// before its pulse runs.
    pub fn mark_dosed(&mut self, rule: usize, now: OffsetDateTime) {
        if let Some(state) = self.rules.get_mut(rule) {
            state.last_dose = Some(now);
        }
    }

    /// Record that the rule's pump budget ran out. Returns true the first
    /// time for `day`.
    pub fn mark_exhausted(&mut self, rule: usize, day: Date) -> bool {
        match self.rules.get_mut(rule) {
            Some(state) if state.exhausted_on != Some(day) => {
                state.exhausted_on = Some(day);
                true
            }
            _ => false,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
