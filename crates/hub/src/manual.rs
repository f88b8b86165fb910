//! Manual overrides. While one is active on a channel, scheduled and
//! feedback decisions for it are recorded but not applied.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use time::OffsetDateTime;

use crate::channel::ChannelId;

/// Longest hold a manual override may ask for.
pub const MAX_OVERRIDE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize)]
pub struct Override {
    pub channel_id: ChannelId,
    pub desired_state: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(skip)]
    pub deadline: Instant,
    /// Distinguishes this override from any later one on the same channel,
    /// so a stale expiry timer can't remove its replacement.
    #[serde(skip)]
    pub generation: u64,
}

impl Override {
    pub fn remaining_secs(&self, mono: Instant) -> u64 {
        self.deadline.saturating_duration_since(mono).as_secs()
    }
}

#[derive(Default)]
pub struct OverrideTable {
    active: BTreeMap<ChannelId, Override>,
    next_generation: u64,
}

impl OverrideTable {
    /// Install an override, replacing any existing one on the channel.
    /// Returns its generation.
    pub fn install(
        &mut self,
        channel_id: ChannelId,
        desired_state: bool,
        expires_at: OffsetDateTime,
        deadline: Instant,
    ) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.active.insert(
            channel_id.clone(),
            Override {
                channel_id,
                desired_state,
                expires_at,
                deadline,
                generation,
            },
        );
        generation
    }

    /// The override on `channel`, if it hasn't reached its deadline.
    pub fn active(&self, channel: &ChannelId, mono: Instant) -> Option<&Override> {
        self.active.get(channel).filter(|o| mono < o.deadline)
    }

    pub fn remove(&mut self, channel: &ChannelId) -> Option<Override> {
        self.active.remove(channel)
    }

    /// Remove the override only if it is still the one with `generation`.
    pub fn take_if_generation(&mut self, channel: &ChannelId, generation: u64) -> Option<Override> {
        match self.active.get(channel) {
            Some(o) if o.generation == generation => self.active.remove(channel),
            _ => None,
        }
    }

    /// Remove and return every override whose deadline has passed.
    pub fn expired(&mut self, mono: Instant) -> Vec<Override> {
        let due: Vec<ChannelId> = self
            .active
            .iter()
            .filter(|(_, o)| mono >= o.deadline)
            .map(|(id, _)| id.clone())
            .collect();
        due.iter().filter_map(|id| self.active.remove(id)).collect()
    }

    pub fn all(&self) -> Vec<Override> {
        self.active.values().cloned().collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const AT: OffsetDateTime = datetime!(2024-05-01 12:00:00 UTC);

    #[test]
    fn last_writer_wins() {
        let mut table = OverrideTable::default();
        let t0 = Instant::now();
        let first = table.install("5".into(), true, AT, t0 + Duration::from_secs(60));
        let second = table.install("5".into(), false, AT, t0 + Duration::from_secs(60));
        assert_ne!(first, second);

        let o = table.active(&"5".into(), t0).unwrap();
        assert!(!o.desired_state);
        assert!(table.take_if_generation(&"5".into(), first).is_none());
        assert!(table.take_if_generation(&"5".into(), second).is_some());
    }

    #[test]
    fn expired_overrides_are_taken_once() {
        let mut table = OverrideTable::default();
        let t0 = Instant::now();
        table.install("a".into(), true, AT, t0 + Duration::from_secs(10));
        table.install("b".into(), true, AT, t0 + Duration::from_secs(100));

        let later = t0 + Duration::from_secs(10);
        assert!(table.active(&"a".into(), later).is_none());
        let expired = table.expired(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].channel_id, ChannelId::from("a"));
        assert!(table.expired(later).is_empty());
        assert!(table.active(&"b".into(), later).is_some());
    }

    #[test]
    fn remaining_counts_down() {
        let mut table = OverrideTable::default();
        let t0 = Instant::now();
        table.install("a".into(), true, AT, t0 + Duration::from_secs(30));
        let o = table.active(&"a".into(), t0 + Duration::from_secs(12)).unwrap();
        assert_eq!(o.remaining_secs(t0 + Duration::from_secs(12)), 18);
    }
}
