//! Channel registry: the single source of truth for what each actuator is
//! doing. Every state change goes through [`ChannelRegistry::transition`],
//! which admits it against the channel's budget, writes it to the transport
//! and rolls everything back if the write fails.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::budget::{BudgetTracker, ResourceId};
use crate::error::Rejected;
use crate::transport::ActuatorTransport;

/// Flow rate assumed for dosing pumps that don't configure one.
pub const DEFAULT_FLOW_ML_PER_SEC: f64 = 1.75;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawChannelId", into = "String")]
pub struct ChannelId(String);

/// Channel ids may be written as integers (relay numbers) in config and
/// commands.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawChannelId {
    Text(String),
    Number(u32),
}

impl From<RawChannelId> for ChannelId {
    fn from(raw: RawChannelId) -> Self {
        match raw {
            RawChannelId::Text(s) => Self(s),
            RawChannelId::Number(n) => n.into(),
        }
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u32> for ChannelId {
    fn from(n: u32) -> Self {
        Self(n.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpRole {
    Nutrient,
    PhUp,
    PhDown,
    Watering,
}

/// A channel as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub id: ChannelId,
    pub name: String,
    pub relay_pin: i64,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub role: Option<PumpRole>,
    #[serde(default)]
    pub budget: Option<ResourceId>,
    #[serde(default)]
    pub flow_ml_per_sec: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub relay_pin: i64,
    pub on: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_changed: Option<OffsetDateTime>,
    pub group: Option<String>,
    pub role: Option<PumpRole>,
    pub budget: Option<ResourceId>,
    pub flow_ml_per_sec: f64,
}

impl Channel {
    fn from_spec(spec: ChannelSpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            relay_pin: spec.relay_pin,
            on: false,
            last_changed: None,
            group: spec.group,
            role: spec.role,
            budget: spec.budget,
            flow_ml_per_sec: spec.flow_ml_per_sec.unwrap_or(DEFAULT_FLOW_ML_PER_SEC),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The transport confirmed the new state.
    Changed,
    /// Already in the requested state; nothing was written.
    Unchanged,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct ChannelRegistry {
    channels: BTreeMap<ChannelId, Channel>,
}

impl ChannelRegistry {
    pub fn new(specs: impl IntoIterator<Item = ChannelSpec>) -> Self {
        Self {
            channels: specs
                .into_iter()
                .map(|s| (s.id.clone(), Channel::from_spec(s)))
                .collect(),
        }
    }

    pub fn get(&self, id: &ChannelId) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn ids(&self) -> Vec<ChannelId> {
        self.channels.keys().cloned().collect()
    }

    pub fn in_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a Channel> + 'a {
        self.channels
            .values()
            .filter(move |c| c.group.as_deref() == Some(group))
    }

    pub fn states(&self) -> BTreeMap<ChannelId, bool> {
        self.channels
            .iter()
            .map(|(id, c)| (id.clone(), c.on))
            .collect()
    }

    /// Drive `id` to `desired`.
    ///
    /// `volume_ml` is the claim charged against a volume budget when turning
    /// on; duration budgets ignore it. Turning off is never budget-checked.
    #[allow(clippy::too_many_arguments)]
    pub fn transition(
        &mut self,
        id: &ChannelId,
        desired: bool,
        volume_ml: f64,
        budgets: &mut BudgetTracker,
        transport: &dyn ActuatorTransport,
        now: OffsetDateTime,
        mono: Instant,
    ) -> Result<Applied, Rejected> {
        let channel = self
            .channels
            .get_mut(id)
            .ok_or_else(|| Rejected::UnknownChannel(id.clone()))?;

        if channel.on == desired {
            return Ok(Applied::Unchanged);
        }

        let charged = match (&channel.budget, desired) {
            (Some(resource), true) => {
                budgets.admit(resource, volume_ml, mono)?;
                Some(resource.clone())
            }
            _ => None,
        };

        let previous = channel.on;
        channel.on = desired;

        if let Err(e) = transport.write(id, desired) {
            channel.on = previous;
            if let Some(resource) = &charged {
                budgets.refund(resource, volume_ml);
            }
            warn!(channel = %id, desired, error = %e, "channel: transport write failed, rolled back");
            return Err(Rejected::Transport(e));
        }

        channel.last_changed = Some(now);
        if let Some(resource) = &channel.budget {
            if desired {
                budgets.started(resource, mono);
            } else {
                budgets.stopped(resource, mono);
            }
        }
        info!(channel = %id, on = desired, "channel: state changed");
        Ok(Applied::Changed)
    }

    /// Write the recorded state of `id` to the transport again without a
    /// budget check. Used after the transport lost its outputs.
    pub fn rewrite(&self, id: &ChannelId, transport: &dyn ActuatorTransport) -> Result<bool, Rejected> {
        let channel = self
            .channels
            .get(id)
            .ok_or_else(|| Rejected::UnknownChannel(id.clone()))?;
        transport.write(id, channel.on)?;
        Ok(channel.on)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetKind, BudgetSpec};
    use crate::transport::RecordingTransport;
    use time::macros::datetime;

    fn pump(id: &str, budget: Option<&str>) -> ChannelSpec {
        ChannelSpec {
            id: id.into(),
            name: id.to_string(),
            relay_pin: 17,
            group: None,
            role: Some(PumpRole::PhDown),
            budget: budget.map(ResourceId::from),
            flow_ml_per_sec: None,
        }
    }

    fn ph_budget(limit: f64) -> BudgetTracker {
        BudgetTracker::new(
            [BudgetSpec {
                id: "ph_down".into(),
                kind: BudgetKind::Volume,
                daily_limit: limit,
                max_continuous_run_sec: None,
                shutoff_cooldown_sec: 300,
            }],
            0,
        )
    }

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:00:00 UTC);

    #[test]
    fn integer_ids_are_stringified() {
        let id: ChannelId = serde_json::from_str("5").unwrap();
        assert_eq!(id, ChannelId::from("5"));
        let id: ChannelId = serde_json::from_str("\"fan\"").unwrap();
        assert_eq!(id.as_str(), "fan");
    }

    #[test]
    fn unset_flow_defaults() {
        let reg = ChannelRegistry::new([pump("p1", None)]);
        assert_eq!(
            reg.get(&"p1".into()).unwrap().flow_ml_per_sec,
            DEFAULT_FLOW_ML_PER_SEC
        );
    }

    #[test]
    fn repeated_transition_writes_once() {
        let mut reg = ChannelRegistry::new([pump("p1", None)]);
        let mut budgets = ph_budget(50.0);
        let transport = RecordingTransport::default();
        let id = ChannelId::from("p1");
        let mono = Instant::now();

        let first = reg.transition(&id, true, 0.0, &mut budgets, &transport, NOW, mono);
        let second = reg.transition(&id, true, 0.0, &mut budgets, &transport, NOW, mono);
        assert_eq!(first, Ok(Applied::Changed));
        assert_eq!(second, Ok(Applied::Unchanged));
        assert_eq!(transport.writes().len(), 1);
        assert_eq!(reg.get(&id).unwrap().last_changed, Some(NOW));
    }

    #[test]
    fn transport_failure_rolls_back_state_and_budget() {
        let mut reg = ChannelRegistry::new([pump("p1", Some("ph_down"))]);
        let mut budgets = ph_budget(50.0);
        let transport = RecordingTransport::failing();
        let id = ChannelId::from("p1");
        let mono = Instant::now();

        let err = reg
            .transition(&id, true, 5.0, &mut budgets, &transport, NOW, mono)
            .unwrap_err();
        assert!(matches!(err, Rejected::Transport(_)));
        assert!(!reg.get(&id).unwrap().on);
        assert_eq!(reg.get(&id).unwrap().last_changed, None);
        assert_eq!(budgets.status(&"ph_down".into(), mono).unwrap().used, 0.0);
    }

    #[test]
    fn budget_rejection_leaves_channel_untouched() {
        let mut reg = ChannelRegistry::new([pump("p1", Some("ph_down"))]);
        let mut budgets = ph_budget(4.0);
        let transport = RecordingTransport::default();
        let id = ChannelId::from("p1");

        let err = reg
            .transition(&id, true, 5.0, &mut budgets, &transport, NOW, Instant::now())
            .unwrap_err();
        assert!(err.is_budget());
        assert!(transport.writes().is_empty());
        assert!(!reg.get(&id).unwrap().on);
    }

    #[test]
    fn turning_off_is_never_budget_checked() {
        let mut reg = ChannelRegistry::new([pump("p1", Some("ph_down"))]);
        let mut budgets = ph_budget(5.0);
        let transport = RecordingTransport::default();
        let id = ChannelId::from("p1");
        let mono = Instant::now();

        reg.transition(&id, true, 5.0, &mut budgets, &transport, NOW, mono)
            .unwrap();
        budgets.set_limit(&"ph_down".into(), 0.0);
        assert_eq!(
            reg.transition(&id, false, 0.0, &mut budgets, &transport, NOW, mono),
            Ok(Applied::Changed)
        );
    }

    #[test]
    fn unknown_channel_is_rejected() {
        let mut reg = ChannelRegistry::new([]);
        let mut budgets = ph_budget(5.0);
        let err = reg
            .transition(
                &"ghost".into(),
                true,
                0.0,
                &mut budgets,
                &RecordingTransport::default(),
                NOW,
                Instant::now(),
            )
            .unwrap_err();
        assert_eq!(err, Rejected::UnknownChannel("ghost".into()));
    }
}
