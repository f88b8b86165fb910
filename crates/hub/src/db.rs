use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::{Date, OffsetDateTime, UtcOffset};

use crate::budget::ResourceId;
use crate::cycle::{CycleGroupSpec, CyclePattern, GroupKind};
use crate::dosing::{DosingRule, Quantity};
use crate::ledger::{ActionOutcome, ActionRecord};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// A persisted ledger record.
#[derive(Debug, Clone, Serialize)]
pub struct ActionEvent {
    pub id: i64,
    pub ts: String,
    pub channel_id: String,
    pub requested_state: bool,
    pub source: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub details: serde_json::Value,
}

/// Event timestamps are stored as UTC RFC 3339 so they compare as text.
fn utc_timestamp(at: OffsetDateTime) -> Result<String> {
    at.to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .context("timestamp not representable as RFC 3339")
}

/// Budget day as stored: "YYYY-MM-DD".
pub fn day_key(day: Date) -> String {
    format!("{:04}-{:02}-{:02}", day.year(), day.month() as u8, day.day())
}

fn kind_str(kind: GroupKind) -> &'static str {
    match kind {
        GroupKind::Cycle => "cycle",
        GroupKind::Photoperiod => "photoperiod",
    }
}

fn parse_kind(s: &str) -> Result<GroupKind> {
    match s {
        "cycle" => Ok(GroupKind::Cycle),
        "photoperiod" => Ok(GroupKind::Photoperiod),
        other => bail!("unknown group kind '{other}' in database"),
    }
}

fn seconds(row: &SqliteRow, col: &str) -> Result<u32> {
    let v: i64 = row.try_get(col)?;
    u32::try_from(v).with_context(|| format!("{col} out of range: {v}"))
}

fn hour(row: &SqliteRow, col: &str) -> Result<u8> {
    let v: i64 = row.try_get(col)?;
    u8::try_from(v).with_context(|| format!("{col} out of range: {v}"))
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/growroom/growroom.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" is its own database; keep exactly one.
        let in_memory = db_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Cycle groups
    // ----------------------------

    pub async fn upsert_cycle_group(&self, g: &CycleGroupSpec) -> Result<()> {
        let p = &g.pattern;
        sqlx::query(
            r#"
            INSERT INTO cycle_patterns (
              group_name, kind, enabled,
              day_seconds_on, day_seconds_off,
              night_seconds_on, night_seconds_off,
              fallback_seconds_on, fallback_seconds_off,
              active_hours_start, active_hours_end
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(group_name) DO UPDATE SET
              kind=excluded.kind,
              enabled=excluded.enabled,
              day_seconds_on=excluded.day_seconds_on,
              day_seconds_off=excluded.day_seconds_off,
              night_seconds_on=excluded.night_seconds_on,
              night_seconds_off=excluded.night_seconds_off,
              fallback_seconds_on=excluded.fallback_seconds_on,
              fallback_seconds_off=excluded.fallback_seconds_off,
              active_hours_start=excluded.active_hours_start,
              active_hours_end=excluded.active_hours_end
            "#,
        )
        .bind(g.group.as_str())
        .bind(kind_str(g.kind))
        .bind(g.enabled)
        .bind(i64::from(p.day_seconds_on))
        .bind(i64::from(p.day_seconds_off))
        .bind(i64::from(p.night_seconds_on))
        .bind(i64::from(p.night_seconds_off))
        .bind(i64::from(p.fallback_seconds_on))
        .bind(i64::from(p.fallback_seconds_off))
        .bind(i64::from(p.active_hours_start))
        .bind(i64::from(p.active_hours_end))
        .execute(&self.pool)
        .await
        .context("upsert_cycle_group failed")?;
        Ok(())
    }

    pub async fn load_cycle_groups(&self) -> Result<Vec<CycleGroupSpec>> {
        let rows = sqlx::query(
            r#"
            SELECT group_name, kind, enabled,
                   day_seconds_on, day_seconds_off,
                   night_seconds_on, night_seconds_off,
                   fallback_seconds_on, fallback_seconds_off,
                   active_hours_start, active_hours_end
            FROM cycle_patterns
            ORDER BY group_name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_cycle_groups failed")?;

        rows.iter()
            .map(|r| -> Result<CycleGroupSpec> {
                let kind: String = r.try_get("kind")?;
                Ok(CycleGroupSpec {
                    group: r.try_get("group_name")?,
                    kind: parse_kind(&kind)?,
                    enabled: r.try_get("enabled")?,
                    pattern: CyclePattern {
                        day_seconds_on: seconds(r, "day_seconds_on")?,
                        day_seconds_off: seconds(r, "day_seconds_off")?,
                        night_seconds_on: seconds(r, "night_seconds_on")?,
                        night_seconds_off: seconds(r, "night_seconds_off")?,
                        fallback_seconds_on: seconds(r, "fallback_seconds_on")?,
                        fallback_seconds_off: seconds(r, "fallback_seconds_off")?,
                        active_hours_start: hour(r, "active_hours_start")?,
                        active_hours_end: hour(r, "active_hours_end")?,
                    },
                })
            })
            .collect::<Result<Vec<_>>>()
            .context("load_cycle_groups: bad row")
    }

    // ----------------------------
    // Dosing rules
    // ----------------------------

    pub async fn upsert_dosing_rule(&self, d: &DosingRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dosing_rules (
              quantity, target, tolerance, enabled,
              up_pump, down_pump,
              dose_ml, ml_per_unit, cooldown_sec, max_reading_age_sec
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(quantity) DO UPDATE SET
              target=excluded.target,
              tolerance=excluded.tolerance,
              enabled=excluded.enabled,
              up_pump=excluded.up_pump,
              down_pump=excluded.down_pump,
              dose_ml=excluded.dose_ml,
              ml_per_unit=excluded.ml_per_unit,
              cooldown_sec=excluded.cooldown_sec,
              max_reading_age_sec=excluded.max_reading_age_sec
            "#,
        )
        .bind(d.quantity.as_str())
        .bind(d.target)
        .bind(d.tolerance)
        .bind(d.enabled)
        .bind(d.up_pump.as_ref().map(|p| p.as_str().to_string()))
        .bind(d.down_pump.as_ref().map(|p| p.as_str().to_string()))
        .bind(d.dose_ml)
        .bind(d.ml_per_unit)
        .bind(d.cooldown_sec as i64)
        .bind(d.max_reading_age_sec as i64)
        .execute(&self.pool)
        .await
        .context("upsert_dosing_rule failed")?;
        Ok(())
    }

    pub async fn load_dosing_rules(&self) -> Result<Vec<DosingRule>> {
        let rows = sqlx::query(
            r#"
            SELECT quantity, target, tolerance, enabled,
                   up_pump, down_pump,
                   dose_ml, ml_per_unit, cooldown_sec, max_reading_age_sec
            FROM dosing_rules
            ORDER BY quantity
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_dosing_rules failed")?;

        rows.iter()
            .map(|r| -> Result<DosingRule> {
                let quantity: String = r.try_get("quantity")?;
                let up: Option<String> = r.try_get("up_pump")?;
                let down: Option<String> = r.try_get("down_pump")?;
                let cooldown: i64 = r.try_get("cooldown_sec")?;
                let max_age: i64 = r.try_get("max_reading_age_sec")?;
                Ok(DosingRule {
                    quantity: Quantity::parse(&quantity)?,
                    target: r.try_get("target")?,
                    tolerance: r.try_get("tolerance")?,
                    enabled: r.try_get("enabled")?,
                    up_pump: up.map(Into::into),
                    down_pump: down.map(Into::into),
                    dose_ml: r.try_get("dose_ml")?,
                    ml_per_unit: r.try_get("ml_per_unit")?,
                    cooldown_sec: u64::try_from(cooldown)?,
                    max_reading_age_sec: u64::try_from(max_age)?,
                })
            })
            .collect::<Result<Vec<_>>>()
            .context("load_dosing_rules: bad row")
    }

    // ----------------------------
    // Budget totals
    // ----------------------------

    pub async fn store_budget_totals(&self, day: Date, totals: &[(ResourceId, f64)]) -> Result<()> {
        let day = day_key(day);
        for (resource, amount) in totals {
            sqlx::query(
                r#"
                INSERT INTO budget_daily_totals (day, resource_id, amount)
                VALUES (?, ?, ?)
                ON CONFLICT(day, resource_id) DO UPDATE SET amount=excluded.amount
                "#,
            )
            .bind(day.as_str())
            .bind(resource.as_str())
            .bind(*amount)
            .execute(&self.pool)
            .await
            .with_context(|| format!("store_budget_totals failed for '{resource}'"))?;
        }
        Ok(())
    }

    pub async fn load_budget_totals(&self, day: Date) -> Result<Vec<(ResourceId, f64)>> {
        let rows = sqlx::query(
            r#"
            SELECT resource_id, amount
            FROM budget_daily_totals
            WHERE day = ?
            ORDER BY resource_id
            "#,
        )
        .bind(day_key(day))
        .fetch_all(&self.pool)
        .await
        .context("load_budget_totals failed")?;

        rows.iter()
            .map(|r| -> Result<(ResourceId, f64)> {
                let id: String = r.try_get("resource_id")?;
                Ok((ResourceId::from(id), r.try_get("amount")?))
            })
            .collect()
    }

    // ----------------------------
    // Action events
    // ----------------------------

    pub async fn insert_action_event(&self, a: &ActionRecord) -> Result<()> {
        let ts = utc_timestamp(a.timestamp)?;
        let reason = match &a.outcome {
            ActionOutcome::Rejected { reason } => Some(reason.as_str()),
            _ => None,
        };
        sqlx::query(
            r#"
            INSERT INTO action_events (ts, channel_id, requested_state, source, outcome, reason, details)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(a.channel_id.as_str())
        .bind(a.requested_state)
        .bind(a.source.as_str())
        .bind(a.outcome.label())
        .bind(reason)
        .bind(a.details.to_string())
        .execute(&self.pool)
        .await
        .context("insert_action_event failed")?;
        Ok(())
    }

    /// Delete action events recorded before `cutoff`. Returns how many rows
    /// were removed.
    pub async fn prune_action_events(&self, cutoff: OffsetDateTime) -> Result<u64> {
        let done = sqlx::query("DELETE FROM action_events WHERE ts < ?")
            .bind(utc_timestamp(cutoff)?)
            .execute(&self.pool)
            .await
            .context("prune_action_events failed")?;
        Ok(done.rows_affected())
    }

    /// Newest first.
    pub async fn recent_action_events(&self, channel_id: Option<&str>, limit: i64) -> Result<Vec<ActionEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, ts, channel_id, requested_state, source, outcome, reason, details
            FROM action_events
            WHERE (?1 IS NULL OR channel_id = ?1)
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )
        .bind(channel_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_action_events failed")?;

        rows.iter()
            .map(|r| -> Result<ActionEvent> {
                let details: String = r.try_get("details")?;
                Ok(ActionEvent {
                    id: r.try_get("id")?,
                    ts: r.try_get("ts")?,
                    channel_id: r.try_get("channel_id")?,
                    requested_state: r.try_get("requested_state")?,
                    source: r.try_get("source")?,
                    outcome: r.try_get("outcome")?,
                    reason: r.try_get("reason")?,
                    details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                })
            })
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ActionSource;
    use time::macros::{date, datetime};

    async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn group(name: &str) -> CycleGroupSpec {
        CycleGroupSpec {
            group: name.to_string(),
            kind: GroupKind::Cycle,
            enabled: true,
            pattern: CyclePattern {
                day_seconds_on: 30,
                day_seconds_off: 270,
                night_seconds_on: 20,
                night_seconds_off: 600,
                fallback_seconds_on: 10,
                fallback_seconds_off: 290,
                active_hours_start: 22,
                active_hours_end: 6,
            },
        }
    }

    #[test]
    fn day_key_is_zero_padded() {
        assert_eq!(day_key(date!(2024-03-07)), "2024-03-07");
    }

    #[tokio::test]
    async fn cycle_groups_round_trip_and_upsert() {
        let db = memory_db().await;
        db.upsert_cycle_group(&group("water")).await.unwrap();

        let mut changed = group("water");
        changed.pattern.day_seconds_on = 45;
        changed.kind = GroupKind::Photoperiod;
        db.upsert_cycle_group(&changed).await.unwrap();

        let loaded = db.load_cycle_groups().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].pattern.day_seconds_on, 45);
        assert_eq!(loaded[0].pattern.active_hours_start, 22);
        assert_eq!(loaded[0].kind, GroupKind::Photoperiod);
    }

    #[tokio::test]
    async fn dosing_rules_keep_optional_fields() {
        let db = memory_db().await;
        db.upsert_dosing_rule(&DosingRule {
            quantity: Quantity::Ec,
            target: 1.8,
            tolerance: 0.2,
            enabled: true,
            up_pump: Some("nutrient_a".into()),
            down_pump: None,
            dose_ml: 10.0,
            ml_per_unit: None,
            cooldown_sec: 300,
            max_reading_age_sec: 120,
        })
        .await
        .unwrap();

        let rules = db.load_dosing_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].quantity, Quantity::Ec);
        assert_eq!(rules[0].up_pump, Some("nutrient_a".into()));
        assert_eq!(rules[0].down_pump, None);
        assert_eq!(rules[0].ml_per_unit, None);
    }

    #[tokio::test]
    async fn budget_totals_are_per_day() {
        let db = memory_db().await;
        let today = date!(2024-05-01);
        db.store_budget_totals(today, &[("ph_down".into(), 10.0)])
            .await
            .unwrap();
        db.store_budget_totals(today, &[("ph_down".into(), 15.0)])
            .await
            .unwrap();

        assert_eq!(
            db.load_budget_totals(today).await.unwrap(),
            vec![("ph_down".into(), 15.0)]
        );
        assert!(db
            .load_budget_totals(date!(2024-05-02))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn action_events_are_filtered_and_newest_first() {
        let db = memory_db().await;
        for (ch, on) in [("a", true), ("b", true), ("a", false)] {
            db.insert_action_event(&ActionRecord {
                timestamp: datetime!(2024-05-01 12:00 UTC),
                channel_id: ch.into(),
                requested_state: on,
                source: ActionSource::Scheduled,
                details: serde_json::json!({ "group": "g" }),
                outcome: ActionOutcome::Applied,
            })
            .await
            .unwrap();
        }
        db.insert_action_event(&ActionRecord {
            timestamp: datetime!(2024-05-01 12:01 UTC),
            channel_id: "a".into(),
            requested_state: true,
            source: ActionSource::Manual,
            details: serde_json::Value::Null,
            outcome: ActionOutcome::Rejected {
                reason: "daily limit".into(),
            },
        })
        .await
        .unwrap();

        let a = db.recent_action_events(Some("a"), 10).await.unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a[0].outcome, "rejected");
        assert_eq!(a[0].reason.as_deref(), Some("daily limit"));
        assert_eq!(a[1].details["group"], "g");

        let all = db.recent_action_events(None, 2).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn prune_drops_only_older_events() {
        let db = memory_db().await;
        // Local offsets are normalised, so 13:00+02:00 is older than 12:00Z.
        for at in [
            datetime!(2024-04-01 12:00 UTC),
            datetime!(2024-05-01 13:00 +02:00),
            datetime!(2024-05-01 12:00 UTC),
        ] {
            db.insert_action_event(&ActionRecord {
                timestamp: at,
                channel_id: "a".into(),
                requested_state: true,
                source: ActionSource::Manual,
                details: serde_json::Value::Null,
                outcome: ActionOutcome::Applied,
            })
            .await
            .unwrap();
        }

        let removed = db
            .prune_action_events(datetime!(2024-05-01 11:30 UTC))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        let left = db.recent_action_events(None, 10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].ts, "2024-05-01T12:00:00Z");
    }
}
