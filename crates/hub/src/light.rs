//! Light-phase oracle. Cycle groups ask it whether the lights are on to pick
//! their day or night pattern; photoperiod groups follow it directly.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, Time};

pub trait LightPhase: Send + Sync {
    /// `Some(true)` during the light period, `Some(false)` outside it, `None`
    /// when the phase can't be determined.
    fn is_day(&self, now: OffsetDateTime) -> Option<bool>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightWindow {
    /// "HH:MM", local time.
    pub start: String,
    pub end: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Parse "HH:MM" into a time of day.
pub fn parse_hhmm(s: &str) -> Result<Time> {
    let (h, m) = s
        .trim()
        .split_once(':')
        .with_context(|| format!("'{s}' is not HH:MM"))?;
    let hour: u8 = h.parse().with_context(|| format!("bad hour in '{s}'"))?;
    let minute: u8 = m.parse().with_context(|| format!("bad minute in '{s}'"))?;
    if hour > 23 || minute > 59 {
        bail!("'{s}' is out of range");
    }
    Ok(Time::from_hms(hour, minute, 0)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: Time,
    end: Time,
}

impl Span {
    /// Both ends inclusive; `start > end` wraps past midnight.
    fn contains(&self, t: Time) -> bool {
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}

/// Photoperiod built from the configured light windows.
#[derive(Debug, Clone, Default)]
pub struct LightSchedule {
    spans: Vec<Span>,
}

impl LightSchedule {
    pub fn from_windows(windows: &[LightWindow]) -> Result<Self> {
        let mut spans = Vec::new();
        for w in windows.iter().filter(|w| w.enabled) {
            spans.push(Span {
                start: parse_hhmm(&w.start)?,
                end: parse_hhmm(&w.end)?,
            });
        }
        Ok(Self { spans })
    }
}

impl LightPhase for LightSchedule {
    fn is_day(&self, now: OffsetDateTime) -> Option<bool> {
        if self.spans.is_empty() {
            return None;
        }
        // Minute resolution, matching the HH:MM windows.
        let t = Time::from_hms(now.hour(), now.minute(), 0).ok()?;
        Some(self.spans.iter().any(|s| s.contains(t)))
    }
}

/// An oracle whose answer tests set directly.
#[cfg(test)]
#[derive(Default)]
pub struct FixedPhase(std::sync::Mutex<Option<bool>>);

#[cfg(test)]
impl FixedPhase {
    pub fn new(phase: Option<bool>) -> Self {
        Self(std::sync::Mutex::new(phase))
    }

    pub fn set(&self, phase: Option<bool>) {
        *self.0.lock().unwrap() = phase;
    }
}

#[cfg(test)]
impl LightPhase for FixedPhase {
    fn is_day(&self, _now: OffsetDateTime) -> Option<bool> {
        *self.0.lock().unwrap()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
