//! Duty-cycle scheduling for channel groups.
//!
//! A cycle group repeats `seconds_on` ON then `seconds_off` OFF, counted from
//! the start of its active-hours window, using the day, night or fallback
//! pattern depending on the light phase. A photoperiod group simply follows
//! the lights.

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, Time};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CyclePattern {
    pub day_seconds_on: u32,
    pub day_seconds_off: u32,
    pub night_seconds_on: u32,
    pub night_seconds_off: u32,
    #[serde(default)]
    pub fallback_seconds_on: u32,
    #[serde(default)]
    pub fallback_seconds_off: u32,
    /// Local hour the window opens, 0-23.
    #[serde(default)]
    pub active_hours_start: u8,
    /// Local hour the window closes, 0-23. Equal to start means 24/7.
    #[serde(default)]
    pub active_hours_end: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Day,
    Night,
    /// The light oracle had no answer; the fallback pattern applies.
    Unknown,
}

impl Phase {
    pub fn from_oracle(is_day: Option<bool>) -> Self {
        match is_day {
            Some(true) => Self::Day,
            Some(false) => Self::Night,
            None => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    Idle,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    #[default]
    Cycle,
    Photoperiod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleGroupSpec {
    pub group: String,
    #[serde(default)]
    pub kind: GroupKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Unused by photoperiod groups.
    #[serde(default = "always_off")]
    pub pattern: CyclePattern,
}

fn default_true() -> bool {
    true
}

fn always_off() -> CyclePattern {
    CyclePattern {
        day_seconds_on: 0,
        day_seconds_off: 0,
        night_seconds_on: 0,
        night_seconds_off: 0,
        fallback_seconds_on: 0,
        fallback_seconds_off: 0,
        active_hours_start: 0,
        active_hours_end: 0,
    }
}

impl CyclePattern {
    /// `(seconds_on, seconds_off)` for a phase.
    pub fn durations(&self, phase: Phase) -> (u32, u32) {
        match phase {
            Phase::Day => (self.day_seconds_on, self.day_seconds_off),
            Phase::Night => (self.night_seconds_on, self.night_seconds_off),
            Phase::Unknown => (self.fallback_seconds_on, self.fallback_seconds_off),
        }
    }
}

// ---------------------------------------------------------------------------
// Pure scheduling functions
// ---------------------------------------------------------------------------

/// Whether `hour` falls inside `[start, end)`, wrapping past midnight when
/// `start > end`. `start == end` is always active.
pub fn is_active_hour(hour: u8, start: u8, end: u8) -> bool {
    if start == end {
        true
    } else if start < end {
        start <= hour && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// The most recent `start_hour:00:00` at or before `now`.
pub fn cycle_epoch(now: OffsetDateTime, start_hour: u8) -> OffsetDateTime {
    let start = Time::from_hms(start_hour.min(23), 0, 0).unwrap_or(Time::MIDNIGHT);
    let today = now.replace_time(start);
    if today > now {
        today - time::Duration::days(1)
    } else {
        today
    }
}

/// Where in its cycle `pattern` is at `now`.
pub fn evaluate(pattern: &CyclePattern, now: OffsetDateTime, phase: Phase) -> CycleState {
    if !is_active_hour(now.hour(), pattern.active_hours_start, pattern.active_hours_end) {
        return CycleState::Idle;
    }
    let (on, off) = pattern.durations(phase);
    let total = u64::from(on) + u64::from(off);
    if total == 0 {
        return CycleState::Idle;
    }
    let elapsed = (now - cycle_epoch(now, pattern.active_hours_start)).whole_seconds();
    let position = u64::try_from(elapsed).unwrap_or(0) % total;
    if position < u64::from(on) {
        CycleState::Active
    } else {
        CycleState::Idle
    }
}

// ---------------------------------------------------------------------------
// Group state machine
// ---------------------------------------------------------------------------

pub struct CycleGroup {
    spec: CycleGroupSpec,
    state: CycleState,
    last_rejection: Option<String>,
}

impl CycleGroup {
    pub fn new(spec: CycleGroupSpec) -> Self {
        Self {
            spec,
            state: CycleState::Idle,
            last_rejection: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.group
    }

    pub fn spec(&self) -> &CycleGroupSpec {
        &self.spec
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Desired output for every channel of the group, or `None` to hold
    /// whatever they are doing now.
    pub fn decide(&mut self, now: OffsetDateTime, is_day: Option<bool>) -> Option<bool> {
        let phase = Phase::from_oracle(is_day);
        let next = if !self.spec.enabled {
            CycleState::Idle
        } else {
            match self.spec.kind {
                GroupKind::Cycle => {
                    if phase == Phase::Unknown {
                        debug!(group = %self.spec.group, "light phase unknown, using fallback pattern");
                    }
                    evaluate(&self.spec.pattern, now, phase)
                }
                GroupKind::Photoperiod => match is_day {
                    Some(true) => CycleState::Active,
                    Some(false) => CycleState::Idle,
                    None => {
                        debug!(group = %self.spec.group, "light phase unknown, holding photoperiod group");
                        return None;
                    }
                },
            }
        };

        if next != self.state {
            let (on, off) = self.spec.pattern.durations(phase);
            info!(
                group = %self.spec.group,
                from = ?self.state,
                to = ?next,
                phase = ?phase,
                seconds_on = on,
                seconds_off = off,
                "cycle: transition"
            );
            self.state = next;
        }
        Some(next == CycleState::Active)
    }

    /// Remember the latest rejection for this group. Returns true when the
    /// reason differs from the previous one, so repeats can log quietly.
    pub fn note_rejection(&mut self, reason: &str) -> bool {
        if self.last_rejection.as_deref() == Some(reason) {
            return false;
        }
        self.last_rejection = Some(reason.to_string());
        true
    }

    pub fn clear_rejection(&mut self) {
        self.last_rejection = None;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
