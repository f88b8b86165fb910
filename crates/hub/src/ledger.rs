//! Append-only record of every requested state change.
//!
//! Each channel keeps its own bounded window, and there is a bounded global
//! window across all channels. Recorded actions also queue for export so the
//! tick driver can persist them.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::channel::ChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSource {
    Scheduled,
    Manual,
    AutoFeedback,
    SafetyShutoff,
    ReconnectResync,
}

impl ActionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::AutoFeedback => "auto_feedback",
            Self::SafetyShutoff => "safety_shutoff",
            Self::ReconnectResync => "reconnect_resync",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied,
    Unchanged,
    /// Computed while a manual override held the channel; not applied.
    Suppressed,
    Rejected { reason: String },
}

impl ActionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Unchanged => "unchanged",
            Self::Suppressed => "suppressed",
            Self::Rejected { .. } => "rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub channel_id: ChannelId,
    pub requested_state: bool,
    pub source: ActionSource,
    pub details: serde_json::Value,
    pub outcome: ActionOutcome,
}

/// Two opposite requests for one channel that arrived too close together.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub channel_id: ChannelId,
    pub first_source: ActionSource,
    pub first_state: bool,
    pub second_source: ActionSource,
    pub second_state: bool,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    #[serde(default = "default_channel_history")]
    pub channel_history: usize,
    #[serde(default = "default_global_history")]
    pub global_history: usize,
    #[serde(default = "default_conflict_threshold")]
    pub conflict_threshold_sec: f64,
}

fn default_channel_history() -> usize {
    20
}
fn default_global_history() -> usize {
    100
}
fn default_conflict_threshold() -> f64 {
    10.0
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            channel_history: default_channel_history(),
            global_history: default_global_history(),
            conflict_threshold_sec: default_conflict_threshold(),
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct ActionLedger {
    settings: LedgerSettings,
    per_channel: HashMap<ChannelId, VecDeque<ActionRecord>>,
    global: VecDeque<ActionRecord>,
    export: VecDeque<ActionRecord>,
    conflicts: u64,
}

fn push_bounded(buf: &mut VecDeque<ActionRecord>, record: ActionRecord, cap: usize) {
    if buf.len() >= cap {
        buf.pop_front();
    }
    buf.push_back(record);
}

impl ActionLedger {
    pub fn new(settings: LedgerSettings) -> Self {
        Self {
            settings,
            per_channel: HashMap::new(),
            global: VecDeque::new(),
            export: VecDeque::new(),
            conflicts: 0,
        }
    }

    /// Append `record` and compare it with the previous record for the same
    /// channel. Opposite requests inside the threshold are a conflict,
    /// whichever sources made them. Conflicts are only reported.
    pub fn record(&mut self, record: ActionRecord) -> Option<Conflict> {
        let history = self.per_channel.entry(record.channel_id.clone()).or_default();
        let conflict = history.back().and_then(|prev| {
            let elapsed = (record.timestamp - prev.timestamp).as_seconds_f64().abs();
            (prev.requested_state != record.requested_state
                && elapsed < self.settings.conflict_threshold_sec)
                .then(|| Conflict {
                    channel_id: record.channel_id.clone(),
                    first_source: prev.source,
                    first_state: prev.requested_state,
                    second_source: record.source,
                    second_state: record.requested_state,
                    elapsed_secs: elapsed,
                })
        });

        push_bounded(history, record.clone(), self.settings.channel_history);
        push_bounded(&mut self.global, record.clone(), self.settings.global_history);
        // Every tick re-confirms each scheduled channel; only the in-memory
        // windows keep those.
        let scheduled_no_op =
            record.source == ActionSource::Scheduled && record.outcome == ActionOutcome::Unchanged;
        if !scheduled_no_op {
            push_bounded(&mut self.export, record, self.settings.global_history);
        }

        if let Some(c) = &conflict {
            self.conflicts += 1;
            warn!(
                channel = %c.channel_id,
                first_source = c.first_source.as_str(),
                first_state = c.first_state,
                second_source = c.second_source.as_str(),
                second_state = c.second_state,
                elapsed_secs = c.elapsed_secs,
                "POTENTIAL CONFLICT: opposite requests {:.1}s apart",
                c.elapsed_secs
            );
        }
        conflict
    }

    /// Records for one channel, oldest first.
    pub fn history(&self, channel: &ChannelId) -> Vec<ActionRecord> {
        self.per_channel
            .get(channel)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The newest `limit` records across all channels, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ActionRecord> {
        let skip = self.global.len().saturating_sub(limit);
        self.global.iter().skip(skip).cloned().collect()
    }

    /// Take everything queued for persistence since the last drain.
    pub fn drain_export(&mut self) -> Vec<ActionRecord> {
        self.export.drain(..).collect()
    }

    pub fn conflicts_detected(&self) -> u64 {
        self.conflicts
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn action(channel: &str, on: bool, source: ActionSource, at: OffsetDateTime) -> ActionRecord {
        ActionRecord {
            timestamp: at,
            channel_id: channel.into(),
            requested_state: on,
            source,
            details: serde_json::Value::Null,
            outcome: ActionOutcome::Applied,
        }
    }

    const T0: OffsetDateTime = datetime!(2024-05-01 12:00:00 UTC);

    #[test]
    fn opposite_actions_within_threshold_conflict() {
        let mut ledger = ActionLedger::new(LedgerSettings::default());
        assert!(ledger
            .record(action("5", true, ActionSource::Manual, T0))
            .is_none());

        let conflict = ledger
            .record(action(
                "5",
                false,
                ActionSource::Scheduled,
                T0 + time::Duration::seconds(9),
            ))
            .unwrap();
        assert_eq!(conflict.first_source, ActionSource::Manual);
        assert_eq!(conflict.second_source, ActionSource::Scheduled);
        assert_eq!(conflict.elapsed_secs, 9.0);
        assert_eq!(ledger.conflicts_detected(), 1);
    }

    #[test]
    fn opposite_actions_outside_threshold_do_not_conflict() {
        let mut ledger = ActionLedger::new(LedgerSettings::default());
        ledger.record(action("5", true, ActionSource::Manual, T0));
        let conflict = ledger.record(action(
            "5",
            false,
            ActionSource::Scheduled,
            T0 + time::Duration::seconds(11),
        ));
        assert!(conflict.is_none());
        assert_eq!(ledger.conflicts_detected(), 0);
    }

    #[test]
    fn same_state_and_other_channels_do_not_conflict() {
        let mut ledger = ActionLedger::new(LedgerSettings::default());
        ledger.record(action("5", true, ActionSource::Manual, T0));
        assert!(ledger
            .record(action("5", true, ActionSource::Scheduled, T0))
            .is_none());
        assert!(ledger
            .record(action("6", false, ActionSource::Scheduled, T0))
            .is_none());
    }

    #[test]
    fn one_source_flipping_quickly_is_a_conflict() {
        let mut ledger = ActionLedger::new(LedgerSettings::default());
        ledger.record(action("5", true, ActionSource::Manual, T0));
        let conflict = ledger
            .record(action(
                "5",
                false,
                ActionSource::Manual,
                T0 + time::Duration::seconds(5),
            ))
            .unwrap();
        assert_eq!(conflict.first_source, ActionSource::Manual);
        assert_eq!(conflict.second_source, ActionSource::Manual);
        assert_eq!(conflict.elapsed_secs, 5.0);
        assert_eq!(ledger.conflicts_detected(), 1);
    }

    #[test]
    fn windows_evict_oldest_first() {
        let mut ledger = ActionLedger::new(LedgerSettings {
            channel_history: 3,
            global_history: 5,
            conflict_threshold_sec: 10.0,
        });
        for i in 0..8 {
            let at = T0 + time::Duration::minutes(i);
            ledger.record(action("a", i % 2 == 0, ActionSource::Scheduled, at));
        }

        let history = ledger.history(&"a".into());
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].timestamp, T0 + time::Duration::minutes(5));
        assert_eq!(history[2].timestamp, T0 + time::Duration::minutes(7));
        assert_eq!(ledger.recent(usize::MAX).len(), 5);
    }

    #[test]
    fn recent_returns_newest_in_order() {
        let mut ledger = ActionLedger::new(LedgerSettings::default());
        for (i, ch) in ["a", "b", "c"].iter().enumerate() {
            ledger.record(action(
                ch,
                true,
                ActionSource::Scheduled,
                T0 + time::Duration::seconds(i as i64),
            ));
        }
        let recent = ledger.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].channel_id, ChannelId::from("b"));
        assert_eq!(recent[1].channel_id, ChannelId::from("c"));
        assert_eq!(ledger.recent(10).len(), 3);
    }

    #[test]
    fn drain_export_empties_queue() {
        let mut ledger = ActionLedger::new(LedgerSettings::default());
        ledger.record(action("a", true, ActionSource::Manual, T0));
        ledger.record(action("b", true, ActionSource::Manual, T0));
        assert_eq!(ledger.drain_export().len(), 2);
        assert!(ledger.drain_export().is_empty());
        // History is unaffected by draining.
        assert_eq!(ledger.recent(usize::MAX).len(), 2);
    }

    #[test]
    fn scheduled_no_ops_are_kept_but_not_exported() {
        let mut ledger = ActionLedger::new(LedgerSettings::default());
        let mut no_op = action("5", false, ActionSource::Scheduled, T0);
        no_op.outcome = ActionOutcome::Unchanged;
        ledger.record(no_op.clone());
        no_op.source = ActionSource::Manual;
        ledger.record(no_op);
        ledger.record(action("5", true, ActionSource::Scheduled, T0));

        let exported = ledger.drain_export();
        assert_eq!(exported.len(), 2);
        assert_eq!(exported[0].source, ActionSource::Manual);
        assert_eq!(exported[1].outcome, ActionOutcome::Applied);
        assert_eq!(ledger.history(&"5".into()).len(), 3);
    }

    #[test]
    fn outcome_serializes_with_reason() {
        let json = serde_json::to_string(&ActionOutcome::Rejected {
            reason: "nope".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"status":"rejected","reason":"nope"}"#);
    }
}
