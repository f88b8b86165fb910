use std::time::Duration;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::dosing::Quantity;
use crate::manual::MAX_OVERRIDE;

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Reading {
    pub quantity: String,
    pub value: f64,
}

#[derive(Debug, Deserialize)]
pub struct ReadingMsg {
    pub ts: i64,
    pub readings: Vec<Reading>,
}

impl ReadingMsg {
    /// Readings for quantities the dosing controller knows about. Unknown
    /// quantities (temperature, humidity, ...) are skipped.
    pub fn known(&self) -> impl Iterator<Item = (Quantity, f64)> + '_ {
        self.readings
            .iter()
            .filter(|r| r.value.is_finite())
            .filter_map(|r| Quantity::parse(&r.quantity).ok().map(|q| (q, r.value)))
    }

    /// When the readings were taken. A node timestamp that is missing,
    /// unparseable or ahead of the hub clock is replaced by `received`.
    pub fn taken_at(&self, received: OffsetDateTime) -> OffsetDateTime {
        match OffsetDateTime::from_unix_timestamp(self.ts) {
            Ok(at) if self.ts > 0 && at <= received => at.to_offset(received.offset()),
            _ => received,
        }
    }
}

/// What a command payload on a `relay/...` or `group/...` topic asks for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Hold the target at `on`. Without a duration the site default applies.
    Set { on: bool, duration: Option<Duration> },
    /// Drop the override and hand the target back to its schedule.
    Release,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

fn middle_segment<'a>(topic: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == prefix && parts[2] == suffix && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract node_id from "tele/<node_id>/reading".
pub fn extract_node_id(topic: &str) -> Option<&str> {
    middle_segment(topic, "tele", "reading")
}

/// Extract the channel id from "relay/<channel>/set".
pub fn extract_channel_id(topic: &str) -> Option<&str> {
    middle_segment(topic, "relay", "set")
}

/// Extract the group name from "group/<group>/set".
pub fn extract_group(topic: &str) -> Option<&str> {
    middle_segment(topic, "group", "set")
}

/// Extract the pump channel from "pump/<channel>/dose".
pub fn extract_dose_pump(topic: &str) -> Option<&str> {
    middle_segment(topic, "pump", "dose")
}

/// Parse "ON", "OFF", "ON <secs>", "OFF <secs>", "AUTO" or "CANCEL"
/// (case-insensitive, trims whitespace). Holds are capped at
/// [`MAX_OVERRIDE`].
pub fn parse_command(payload: &[u8]) -> Result<Command, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    let mut words = s.split_whitespace();
    let verb = words.next().unwrap_or_default();
    let secs = words.next();
    if words.next().is_some() {
        return Err(format!("unknown command '{s}'"));
    }

    let on = match verb {
        "ON" => true,
        "OFF" => false,
        "AUTO" | "CANCEL" if secs.is_none() => return Ok(Command::Release),
        _ => return Err(format!("unknown command '{s}'")),
    };

    let duration = match secs {
        None => None,
        Some(raw) => match raw.parse::<u64>() {
            Ok(n) if n > 0 && n <= MAX_OVERRIDE.as_secs() => Some(Duration::from_secs(n)),
            _ => return Err(format!("bad override duration '{raw}'")),
        },
    };
    Ok(Command::Set { on, duration })
}

/// Parse a dose volume in ml.
pub fn parse_dose_ml(payload: &[u8]) -> Result<f64, String> {
    let s = String::from_utf8_lossy(payload).trim().to_string();
    match s.parse::<f64>() {
        Ok(ml) if ml.is_finite() && ml > 0.0 => Ok(ml),
        _ => Err(format!("bad dose volume '{s}'")),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
