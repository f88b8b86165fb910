//! TOML config file loading, validation, and database seeding for cycle
//! groups and dosing rules. CO2 rules are read from the file on every start
//! and are not stored.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use time::UtcOffset;

use crate::budget::{BudgetKind, BudgetSpec};
use crate::channel::ChannelSpec;
use crate::climate::Co2Rule;
use crate::cycle::{CycleGroupSpec, GroupKind};
use crate::db::Db;
use crate::dosing::{DosingRule, Quantity};
use crate::ledger::LedgerSettings;
use crate::light::{parse_hhmm, LightWindow};
use crate::manual::MAX_OVERRIDE;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub site: SiteSettings,
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
    #[serde(default)]
    pub budgets: Vec<BudgetSpec>,
    #[serde(default)]
    pub light_windows: Vec<LightWindow>,
    #[serde(default)]
    pub cycles: Vec<CycleGroupSpec>,
    #[serde(default)]
    pub dosing: Vec<DosingRule>,
    #[serde(default)]
    pub co2: Vec<Co2Rule>,
}

#[derive(Debug, Deserialize)]
pub struct SiteSettings {
    /// Offset of local time from UTC. Cycle windows, light windows and the
    /// budget day are all local.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Local hour at which daily budgets reset.
    #[serde(default)]
    pub day_boundary_hour: u8,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_sec: u64,
    /// Override length for `ON`/`OFF` commands that don't give one.
    #[serde(default = "default_override_sec")]
    pub default_override_sec: u64,
    /// Persisted action events older than this are pruned.
    #[serde(default = "default_retention_days")]
    pub action_retention_days: u32,
}

fn default_tick_interval() -> u64 {
    5
}
fn default_retention_days() -> u32 {
    30
}
fn default_override_sec() -> u64 {
    900
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            day_boundary_hour: 0,
            tick_interval_sec: default_tick_interval(),
            default_override_sec: default_override_sec(),
            action_retention_days: default_retention_days(),
        }
    }
}

impl SiteSettings {
    pub fn utc_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_whole_seconds(self.utc_offset_minutes.saturating_mul(60))
            .with_context(|| format!("utc_offset_minutes {} out of range", self.utc_offset_minutes))
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_site(&mut errors);
        self.validate_budgets(&mut errors);
        self.validate_channels(&mut errors);
        self.validate_light_windows(&mut errors);
        self.validate_cycles(&mut errors);
        self.validate_dosing(&mut errors);
        self.validate_co2(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_site(&self, errors: &mut Vec<String>) {
        let s = &self.site;
        if let Err(e) = s.utc_offset() {
            errors.push(format!("site: {e}"));
        }
        if s.day_boundary_hour > 23 {
            errors.push(format!(
                "site: day_boundary_hour {} out of range [0, 23]",
                s.day_boundary_hour
            ));
        }
        if s.tick_interval_sec == 0 {
            errors.push("site: tick_interval_sec must be positive".to_string());
        }
        if s.default_override_sec == 0 || s.default_override_sec > MAX_OVERRIDE.as_secs() {
            errors.push(format!(
                "site: default_override_sec {} out of range [1, {}]",
                s.default_override_sec,
                MAX_OVERRIDE.as_secs()
            ));
        }
        if s.action_retention_days == 0 {
            errors.push("site: action_retention_days must be positive".to_string());
        }

        let l = &self.ledger;
        if l.channel_history == 0 || l.global_history == 0 {
            errors.push("ledger: history capacities must be positive".to_string());
        }
        if !(l.conflict_threshold_sec >= 0.0) {
            errors.push(format!(
                "ledger: conflict_threshold_sec {} must be >= 0",
                l.conflict_threshold_sec
            ));
        }
    }

    fn validate_budgets(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, b) in self.budgets.iter().enumerate() {
            let ctx = if b.id.as_str().is_empty() {
                format!("budgets[{i}]")
            } else {
                format!("budget '{}'", b.id)
            };

            if b.id.as_str().trim().is_empty() {
                errors.push(format!("{ctx}: id is empty"));
            } else if !seen.insert(b.id.as_str()) {
                errors.push(format!("{ctx}: duplicate id"));
            }

            if !(b.daily_limit.is_finite() && b.daily_limit > 0.0) {
                errors.push(format!(
                    "{ctx}: daily_limit must be positive, got {}",
                    b.daily_limit
                ));
            }
            if b.kind == BudgetKind::Volume && b.max_continuous_run_sec.is_some() {
                errors.push(format!(
                    "{ctx}: max_continuous_run_sec only applies to duration budgets"
                ));
            }
            if b.max_continuous_run_sec == Some(0) {
                errors.push(format!("{ctx}: max_continuous_run_sec must be positive"));
            }
        }
    }

    fn validate_channels(&self, errors: &mut Vec<String>) {
        let budgets: HashMap<&str, BudgetKind> = self
            .budgets
            .iter()
            .map(|b| (b.id.as_str(), b.kind))
            .collect();
        let cycle_groups: HashSet<&str> = self
            .cycles
            .iter()
            .filter(|c| c.kind == GroupKind::Cycle)
            .map(|c| c.group.as_str())
            .collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();
        let mut budget_owner: HashMap<&str, &str> = HashMap::new();

        for (i, c) in self.channels.iter().enumerate() {
            let ctx = || {
                if c.id.as_str().is_empty() {
                    format!("channels[{i}]")
                } else {
                    format!("channel '{}'", c.id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if c.id.as_str().trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(c.id.as_str()) {
                errors.push(format!("{}: duplicate id", ctx()));
            }
            if c.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if !VALID_GPIO_PINS.contains(&c.relay_pin) {
                errors.push(format!(
                    "{}: relay_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx(),
                    c.relay_pin
                ));
            } else if !seen_pins.insert(c.relay_pin) {
                errors.push(format!(
                    "{}: relay_pin {} is already used by another channel",
                    ctx(),
                    c.relay_pin
                ));
            }

            if let Some(flow) = c.flow_ml_per_sec {
                if !(flow.is_finite() && flow > 0.0) {
                    errors.push(format!(
                        "{}: flow_ml_per_sec must be positive, got {flow}",
                        ctx()
                    ));
                }
            }

            // ── Budget reference ────────────────────────────────
            let Some(budget) = &c.budget else { continue };
            match budgets.get(budget.as_str()) {
                None => errors.push(format!(
                    "{}: budget '{budget}' does not match any defined budget",
                    ctx()
                )),
                Some(kind) => {
                    if let Some(other) = budget_owner.insert(budget.as_str(), c.id.as_str()) {
                        errors.push(format!(
                            "{}: budget '{budget}' is already tied to channel '{other}'",
                            ctx()
                        ));
                    }
                    let in_cycle = c
                        .group
                        .as_deref()
                        .is_some_and(|g| cycle_groups.contains(g));
                    if *kind == BudgetKind::Volume && in_cycle {
                        errors.push(format!(
                            "{}: volume budget '{budget}' cannot be used by a cycle group channel",
                            ctx()
                        ));
                    }
                }
            }
        }
    }

    fn validate_light_windows(&self, errors: &mut Vec<String>) {
        for (i, w) in self.light_windows.iter().enumerate() {
            for (field, value) in [("start", &w.start), ("end", &w.end)] {
                if let Err(e) = parse_hhmm(value) {
                    errors.push(format!("light_windows[{i}]: {field}: {e:#}"));
                }
            }
        }
    }

    fn validate_cycles(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, c) in self.cycles.iter().enumerate() {
            let ctx = if c.group.is_empty() {
                format!("cycles[{i}]")
            } else {
                format!("cycle group '{}'", c.group)
            };

            if c.group.trim().is_empty() {
                errors.push(format!("{ctx}: group is empty"));
                continue;
            } else if !seen.insert(c.group.as_str()) {
                errors.push(format!("{ctx}: duplicate group"));
            }

            for (field, hour) in [
                ("active_hours_start", c.pattern.active_hours_start),
                ("active_hours_end", c.pattern.active_hours_end),
            ] {
                if hour > 23 {
                    errors.push(format!("{ctx}: {field} {hour} out of range [0, 23]"));
                }
            }

            if !self
                .channels
                .iter()
                .any(|ch| ch.group.as_deref() == Some(c.group.as_str()))
            {
                errors.push(format!("{ctx}: no channel belongs to this group"));
            }
        }
    }

    fn validate_dosing(&self, errors: &mut Vec<String>) {
        let channels: HashSet<&str> = self.channels.iter().map(|c| c.id.as_str()).collect();
        let mut seen = HashSet::new();
        for d in &self.dosing {
            let ctx = format!("dosing rule '{}'", d.quantity);

            if !seen.insert(d.quantity) {
                errors.push(format!("{ctx}: duplicate quantity"));
            }
            if d.quantity == Quantity::Co2 {
                errors.push(format!("{ctx}: co2 is controlled by [[co2]] rules, not dosing"));
            }
            if !(d.tolerance >= 0.0) {
                errors.push(format!("{ctx}: tolerance must be >= 0, got {}", d.tolerance));
            }
            if !(d.dose_ml.is_finite() && d.dose_ml > 0.0) {
                errors.push(format!("{ctx}: dose_ml must be positive, got {}", d.dose_ml));
            }
            if let Some(gain) = d.ml_per_unit {
                if !(gain.is_finite() && gain > 0.0) {
                    errors.push(format!("{ctx}: ml_per_unit must be positive, got {gain}"));
                }
            }
            for (field, pump) in [("up_pump", &d.up_pump), ("down_pump", &d.down_pump)] {
                if let Some(pump) = pump {
                    if !channels.contains(pump.as_str()) {
                        errors.push(format!(
                            "{ctx}: {field} '{pump}' does not match any defined channel"
                        ));
                    }
                }
            }
        }
    }

    fn validate_co2(&self, errors: &mut Vec<String>) {
        let grouped: HashSet<&str> = self.cycles.iter().map(|c| c.group.as_str()).collect();
        let pumps: HashSet<&str> = self
            .dosing
            .iter()
            .flat_map(|d| [&d.up_pump, &d.down_pump])
            .flatten()
            .map(|p| p.as_str())
            .collect();
        let mut seen: HashSet<&str> = HashSet::new();

        for r in &self.co2 {
            let ctx = format!("co2 rule '{}'", r.channel);

            match self.channels.iter().find(|c| c.id == r.channel) {
                None => errors.push(format!("{ctx}: channel does not match any defined channel")),
                Some(c) => {
                    if c.group.as_deref().is_some_and(|g| grouped.contains(g)) {
                        errors.push(format!("{ctx}: channel is driven by a cycle group"));
                    }
                }
            }
            if pumps.contains(r.channel.as_str()) {
                errors.push(format!("{ctx}: channel is a dosing pump"));
            }
            if !seen.insert(r.channel.as_str()) {
                errors.push(format!("{ctx}: duplicate channel"));
            }

            for (field, ppm) in [("day_target", r.day_target), ("night_target", r.night_target)] {
                if !(ppm.is_finite() && ppm > 0.0) {
                    errors.push(format!("{ctx}: {field} must be positive, got {ppm}"));
                }
            }
            if !(r.tolerance.is_finite() && r.tolerance >= 0.0) {
                errors.push(format!("{ctx}: tolerance must be >= 0, got {}", r.tolerance));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all cycle groups and dosing rules from the config into the
/// database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for c in &config.cycles {
        db.upsert_cycle_group(c)
            .await
            .with_context(|| format!("failed to upsert cycle group '{}'", c.group))?;
    }

    for d in &config.dosing {
        db.upsert_dosing_rule(d)
            .await
            .with_context(|| format!("failed to upsert dosing rule '{}'", d.quantity))?;
    }

    tracing::info!(
        cycles = config.cycles.len(),
        dosing_rules = config.dosing.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
