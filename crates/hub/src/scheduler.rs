//! Tick driver: advances the engine on a fixed interval and carries its
//! state out to SQLite and the broker.
//!
//! Each tick:
//!
//! ```text
//! engine.tick(now) ──▶ persist budget totals ──▶ drain ledger into action_events
//!                                             └─▶ publish retained hub/status
//! ```
//!
//! Once per local day, `action_events` rows older than the retention window
//! are deleted.
//!
//! Persistence and publishing are best-effort. A failed write is logged and
//! retried with fresh totals on the next tick; drained ledger records that
//! fail to insert are dropped from the database copy but stay in the
//! in-memory history.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, QoS};
use time::{Date, OffsetDateTime};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::db::Db;
use crate::engine::{Engine, TickReport};

pub const STATUS_TOPIC: &str = "hub/status";

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the tick loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run(
    engine: Arc<Engine>,
    db: Db,
    mqtt: Option<AsyncClient>,
    interval: Duration,
    retention: time::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pruned_on: Option<Date> = None;

    info!(
        tick_sec = interval.as_secs_f64(),
        publish_status = mqtt.is_some(),
        retention_days = retention.whole_days(),
        "scheduler started"
    );

    loop {
        ticker.tick().await;

        let now = engine.clock().now();
        let report = engine.tick(now).await;
        log_report(&report);

        if let Err(e) = persist(&engine, &db).await {
            error!("scheduler: persist failed: {e:#}");
        }

        if pruned_on != Some(now.date()) {
            match prune(&db, now, retention).await {
                Ok(_) => pruned_on = Some(now.date()),
                Err(e) => warn!("scheduler: prune failed: {e:#}"),
            }
        }

        if let Some(client) = &mqtt {
            if let Err(e) = publish_status(&engine, client).await {
                warn!("scheduler: status publish failed: {e:#}");
            }
        }
    }
}

fn log_report(report: &TickReport) {
    if report.rolled_over || report.safety_shutoffs > 0 || report.rejected > 0 {
        info!(
            rolled_over = report.rolled_over,
            overrides_expired = report.overrides_expired,
            safety_shutoffs = report.safety_shutoffs,
            applied = report.applied,
            rejected = report.rejected,
            doses_started = report.doses_started,
            "tick"
        );
    } else {
        debug!(
            overrides_expired = report.overrides_expired,
            applied = report.applied,
            unchanged = report.unchanged,
            suppressed = report.suppressed,
            doses_started = report.doses_started,
            "tick"
        );
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Store today's budget totals and move queued ledger records into
/// `action_events`. Returns how many records were written.
pub async fn persist(engine: &Engine, db: &Db) -> Result<usize> {
    let (day, totals) = engine.budget_totals().await;
    db.store_budget_totals(day, &totals)
        .await
        .context("budget totals")?;

    let actions = engine.drain_exported_actions();
    let mut written = 0;
    for action in &actions {
        match db.insert_action_event(action).await {
            Ok(()) => written += 1,
            Err(e) => warn!(channel = %action.channel_id, "db: {e:#}"),
        }
    }
    if written < actions.len() {
        warn!(
            dropped = actions.len() - written,
            "scheduler: some ledger records were not persisted"
        );
    }
    Ok(written)
}

/// Delete persisted action events older than `now - retention`.
pub async fn prune(db: &Db, now: OffsetDateTime, retention: time::Duration) -> Result<u64> {
    let cutoff = now - retention;
    let removed = db
        .prune_action_events(cutoff)
        .await
        .context("prune action_events")?;
    if removed > 0 {
        info!(removed, %cutoff, "scheduler: pruned old action events");
    }
    Ok(removed)
}

async fn publish_status(engine: &Engine, client: &AsyncClient) -> Result<()> {
    let status = engine.status().await;
    let payload = serde_json::to_vec(&status).context("serialize status")?;
    client
        .publish(STATUS_TOPIC, QoS::AtLeastOnce, true, payload)
        .await
        .context("publish hub/status")?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetKind, BudgetSpec, ResourceId};
    use crate::channel::{Applied, ChannelSpec};
    use crate::clock::ManualClock;
    use crate::engine::EngineSettings;
    use crate::ledger::{ActionSource, LedgerSettings};
    use crate::light::FixedPhase;
    use crate::transport::RecordingTransport;
    use time::macros::{date, datetime};

    async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn engine() -> Arc<Engine> {
        let settings = EngineSettings {
            channels: vec![ChannelSpec {
                id: "pump".into(),
                name: "Drip pump".to_string(),
                relay_pin: 17,
                group: None,
                role: None,
                budget: Some("watering".into()),
                flow_ml_per_sec: None,
            }],
            budgets: vec![BudgetSpec {
                id: "watering".into(),
                kind: BudgetKind::Duration,
                daily_limit: 3600.0,
                max_continuous_run_sec: Some(300),
                shutoff_cooldown_sec: 300,
            }],
            cycles: Vec::new(),
            dosing: Vec::new(),
            co2: Vec::new(),
            ledger: LedgerSettings::default(),
            day_boundary_hour: 0,
        };
        Engine::new(
            settings,
            Arc::new(ManualClock::new(datetime!(2024-05-01 12:00:00 UTC))),
            Arc::new(RecordingTransport::default()),
            Arc::new(FixedPhase::new(Some(true))),
        )
    }

    #[tokio::test]
    async fn persist_drains_ledger_into_action_events() {
        let db = memory_db().await;
        let engine = engine();
        engine.tick(engine.clock().now()).await;

        let pump = "pump".into();
        engine
            .set_state(&pump, true, ActionSource::Manual, serde_json::json!({}))
            .await
            .unwrap();
        engine
            .set_state(&pump, false, ActionSource::Manual, serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(persist(&engine, &db).await.unwrap(), 2);
        // Already drained; nothing new to write.
        assert_eq!(persist(&engine, &db).await.unwrap(), 0);

        let events = db.recent_action_events(Some("pump"), 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(!events[0].requested_state);
        assert_eq!(events[0].source, "manual");
        assert_eq!(events[0].outcome, "applied");
        // The in-memory history keeps its copy.
        assert_eq!(engine.history(&pump).len(), 2);
    }

    #[tokio::test]
    async fn persist_stores_budget_totals_for_the_day() {
        let db = memory_db().await;
        let engine = engine();
        engine.tick(engine.clock().now()).await;

        persist(&engine, &db).await.unwrap();

        let totals = db.load_budget_totals(date!(2024 - 05 - 01)).await.unwrap();
        assert_eq!(totals, vec![(ResourceId::from("watering"), 0.0)]);
    }

    #[tokio::test]
    async fn prune_keeps_events_inside_the_retention_window() {
        let db = memory_db().await;
        let engine = engine();
        let pump = "pump".into();
        engine
            .set_state(&pump, true, ActionSource::Manual, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(persist(&engine, &db).await.unwrap(), 1);

        let retention = time::Duration::days(30);
        let now = engine.clock().now();
        assert_eq!(prune(&db, now + time::Duration::days(10), retention).await.unwrap(), 0);
        assert_eq!(db.recent_action_events(Some("pump"), 10).await.unwrap().len(), 1);

        assert_eq!(prune(&db, now + time::Duration::days(31), retention).await.unwrap(), 1);
        assert!(db.recent_action_events(Some("pump"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scheduled_no_ops_are_not_persisted() {
        let db = memory_db().await;
        let engine = engine();
        engine.tick(engine.clock().now()).await;
        let pump = "pump".into();
        for _ in 0..3 {
            let result = engine
                .set_state(&pump, false, ActionSource::Scheduled, serde_json::json!({}))
                .await;
            assert_eq!(result, Ok(Applied::Unchanged));
        }

        assert_eq!(persist(&engine, &db).await.unwrap(), 0);
        assert_eq!(engine.history(&pump).len(), 3);
    }

    #[tokio::test]
    async fn status_snapshot_serializes() {
        let engine = engine();
        engine.tick(engine.clock().now()).await;
        let json = serde_json::to_value(engine.status().await).unwrap();
        assert_eq!(json["channels"][0]["id"], "pump");
        assert_eq!(json["budget_day"], "2024-05-01");
        assert_eq!(json["light_on"], true);
    }
}
