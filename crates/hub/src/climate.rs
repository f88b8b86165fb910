//! CO2 enrichment: switch an injector so the room's CO2 stays inside
//! `target ± tolerance`, with separate targets for the light and dark parts
//! of the photoperiod.
//!
//! Inside the band the injector keeps whatever state it is in. A missing or
//! stale reading turns it off.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::channel::ChannelId;
use crate::dosing::Reading;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Co2Rule {
    /// Injector (solenoid or burner) relay.
    pub channel: ChannelId,
    /// ppm while the lights are on.
    #[serde(default = "default_day_target")]
    pub day_target: f64,
    /// ppm while the lights are off or the phase is unknown.
    #[serde(default = "default_night_target")]
    pub night_target: f64,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_max_reading_age")]
    pub max_reading_age_sec: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_day_target() -> f64 {
    1200.0
}
fn default_night_target() -> f64 {
    800.0
}
fn default_tolerance() -> f64 {
    25.0
}
fn default_max_reading_age() -> u64 {
    120
}
fn default_true() -> bool {
    true
}

impl Co2Rule {
    pub fn target(&self, is_day: Option<bool>) -> f64 {
        if is_day == Some(true) {
            self.day_target
        } else {
            self.night_target
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Co2Decision {
    /// Inside the band, or the rule is disabled.
    Hold,
    On { measured: f64, target: f64 },
    Off { measured: f64, target: f64 },
    Stale { age_secs: i64 },
    NoReading,
}

impl Co2Decision {
    /// The injector state this decision asks for, if any.
    pub fn desired(&self) -> Option<bool> {
        match self {
            Self::Hold => None,
            Self::On { .. } => Some(true),
            Self::Off { .. } | Self::Stale { .. } | Self::NoReading => Some(false),
        }
    }
}

/// Pure decision for one rule.
pub fn decide(
    rule: &Co2Rule,
    reading: Option<&Reading>,
    is_day: Option<bool>,
    now: OffsetDateTime,
) -> Co2Decision {
    if !rule.enabled {
        return Co2Decision::Hold;
    }
    let Some(reading) = reading else {
        return Co2Decision::NoReading;
    };
    let age = (now - reading.at).whole_seconds();
    if age > rule.max_reading_age_sec as i64 {
        return Co2Decision::Stale { age_secs: age };
    }

    let target = rule.target(is_day);
    let measured = reading.value;
    if measured < target - rule.tolerance {
        Co2Decision::On { measured, target }
    } else if measured > target + rule.tolerance {
        Co2Decision::Off { measured, target }
    } else {
        Co2Decision::Hold
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct RuleState {
    rule: Co2Rule,
    /// Set while the reading is missing or stale, so the warning logs once.
    blind: bool,
}

pub struct Co2Controller {
    rules: Vec<RuleState>,
}

impl Co2Controller {
    pub fn new(rules: impl IntoIterator<Item = Co2Rule>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|rule| RuleState { rule, blind: false })
                .collect(),
        }
    }

    pub fn rules(&self) -> impl Iterator<Item = &Co2Rule> {
        self.rules.iter().map(|s| &s.rule)
    }

    /// Decide every rule against the latest CO2 reading.
    pub fn plan(
        &mut self,
        reading: Option<&Reading>,
        is_day: Option<bool>,
        now: OffsetDateTime,
    ) -> Vec<(ChannelId, Co2Decision)> {
        let mut planned = Vec::with_capacity(self.rules.len());
        for state in &mut self.rules {
            let decision = decide(&state.rule, reading, is_day, now);
            match &decision {
                Co2Decision::Stale { age_secs } if !state.blind => {
                    warn!(channel = %state.rule.channel, age_secs, "co2: reading is stale, injector off");
                    state.blind = true;
                }
                Co2Decision::NoReading if !state.blind => {
                    warn!(channel = %state.rule.channel, "co2: no reading yet, injector off");
                    state.blind = true;
                }
                Co2Decision::Stale { .. } | Co2Decision::NoReading => {}
                _ => state.blind = false,
            }
            planned.push((state.rule.channel.clone(), decision));
        }
        planned
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:00:00 UTC);

    fn rule() -> Co2Rule {
        Co2Rule {
            channel: "co2".into(),
            day_target: 1200.0,
            night_target: 800.0,
            tolerance: 25.0,
            max_reading_age_sec: 120,
            enabled: true,
        }
    }

    fn fresh(value: f64) -> Reading {
        Reading { value, at: NOW }
    }

    // -- decide -------------------------------------------------------------

    #[test]
    fn below_band_turns_injector_on() {
        assert_eq!(
            decide(&rule(), Some(&fresh(1100.0)), Some(true), NOW),
            Co2Decision::On {
                measured: 1100.0,
                target: 1200.0
            }
        );
    }

    #[test]
    fn above_band_turns_injector_off() {
        assert_eq!(
            decide(&rule(), Some(&fresh(1300.0)), Some(true), NOW),
            Co2Decision::Off {
                measured: 1300.0,
                target: 1200.0
            }
        );
    }

    #[test]
    fn inside_band_holds_either_state() {
        let r = rule();
        assert_eq!(decide(&r, Some(&fresh(1175.0)), Some(true), NOW), Co2Decision::Hold);
        assert_eq!(decide(&r, Some(&fresh(1225.0)), Some(true), NOW), Co2Decision::Hold);
        assert_eq!(Co2Decision::Hold.desired(), None);
    }

    #[test]
    fn night_and_unknown_phase_use_night_target() {
        let r = rule();
        // 1000 ppm is short of the day target but well over the night one.
        assert!(matches!(
            decide(&r, Some(&fresh(1000.0)), Some(true), NOW),
            Co2Decision::On { .. }
        ));
        assert_eq!(
            decide(&r, Some(&fresh(1000.0)), Some(false), NOW),
            Co2Decision::Off {
                measured: 1000.0,
                target: 800.0
            }
        );
        assert_eq!(r.target(None), 800.0);
    }

    #[test]
    fn stale_or_missing_reading_asks_for_off() {
        let r = rule();
        let old = Reading {
            value: 400.0,
            at: NOW - time::Duration::seconds(121),
        };
        let stale = decide(&r, Some(&old), Some(true), NOW);
        assert_eq!(stale, Co2Decision::Stale { age_secs: 121 });
        assert_eq!(stale.desired(), Some(false));
        assert_eq!(decide(&r, None, Some(true), NOW).desired(), Some(false));
    }

    #[test]
    fn disabled_rule_holds() {
        let mut r = rule();
        r.enabled = false;
        assert_eq!(decide(&r, None, Some(true), NOW), Co2Decision::Hold);
    }

    // -- controller ---------------------------------------------------------

    #[test]
    fn controller_decides_every_rule() {
        let mut second = rule();
        second.channel = "co2_b".into();
        second.day_target = 1000.0;
        let mut c = Co2Controller::new([rule(), second]);

        let plan = c.plan(Some(&fresh(1100.0)), Some(true), NOW);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].0, ChannelId::from("co2"));
        assert_eq!(plan[0].1.desired(), Some(true));
        assert_eq!(plan[1].0, ChannelId::from("co2_b"));
        assert_eq!(plan[1].1.desired(), Some(false));
    }

    #[test]
    fn config_defaults_fill_targets() {
        let r: Co2Rule = toml::from_str(r#"channel = "co2""#).unwrap();
        assert_eq!(r.day_target, 1200.0);
        assert_eq!(r.night_target, 800.0);
        assert_eq!(r.tolerance, 25.0);
        assert!(r.enabled);
    }
}
