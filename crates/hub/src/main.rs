use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use growroom_hub::channel::ChannelId;
use growroom_hub::clock::SystemClock;
use growroom_hub::config;
use growroom_hub::db::Db;
use growroom_hub::engine::{ChannelResults, OverrideTarget};
use growroom_hub::error::Rejected;
use growroom_hub::light::LightSchedule;
use growroom_hub::mqtt::{
    extract_channel_id, extract_dose_pump, extract_group, extract_node_id, parse_command,
    parse_dose_ml, Command, ReadingMsg,
};
use growroom_hub::scheduler;
use growroom_hub::transport::RelayBoard;
use growroom_hub::{Engine, EngineSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:growroom.db?mode=rwc".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed cycle groups + dosing rules) ───────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    // Cycle patterns and dosing rules come back from the DB, which is the
    // source of truth once seeded.
    let cycles = db.load_cycle_groups().await?;
    let dosing = db.load_dosing_rules().await?;
    if cfg.channels.is_empty() {
        warn!("no channels configured");
    }
    info!(
        channels = cfg.channels.len(),
        cycles = cycles.len(),
        dosing_rules = dosing.len(),
        co2_rules = cfg.co2.len(),
        "db ready"
    );

    // ── Relay board ─────────────────────────────────────────────────
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let channel_to_gpio = cfg
        .channels
        .iter()
        .map(|c| {
            let pin = u8::try_from(c.relay_pin)
                .with_context(|| format!("channel '{}': bad relay pin {}", c.id, c.relay_pin))?;
            Ok((c.id.clone(), pin))
        })
        .collect::<Result<Vec<(ChannelId, u8)>>>()?;
    let board = RelayBoard::new(&channel_to_gpio, active_low)?;

    // ── Engine ──────────────────────────────────────────────────────
    let clock = Arc::new(SystemClock::new(cfg.site.utc_offset()?));
    let light = Arc::new(LightSchedule::from_windows(&cfg.light_windows)?);
    let engine = Engine::new(
        EngineSettings {
            channels: cfg.channels.clone(),
            budgets: cfg.budgets.clone(),
            cycles,
            dosing,
            co2: cfg.co2.clone(),
            ledger: cfg.ledger.clone(),
            day_boundary_hour: cfg.site.day_boundary_hour,
        },
        clock,
        Arc::new(board),
        light,
    );

    // Pick up where today left off so a restart can't reset a daily limit.
    {
        let (day, _) = engine.budget_totals().await;
        let totals = db.load_budget_totals(day).await?;
        if !totals.is_empty() {
            engine.restore_budget_totals(day, &totals).await;
        }
    }
    engine.all_off("startup").await;

    // ── MQTT ────────────────────────────────────────────────────────
    let client_id = "growroom-hub";
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    for topic in ["tele/+/reading", "relay/+/set", "group/+/set", "pump/+/dose"] {
        client.subscribe(topic, QoS::AtLeastOnce).await?;
    }
    info!("hub subscribed to tele/+/reading, relay/+/set, group/+/set and pump/+/dose");

    // ── Tick driver ─────────────────────────────────────────────────
    tokio::spawn(scheduler::run(
        Arc::clone(&engine),
        db.clone(),
        Some(client.clone()),
        Duration::from_secs(cfg.site.tick_interval_sec),
        time::Duration::days(i64::from(cfg.site.action_retention_days)),
    ));

    let default_override = Duration::from_secs(cfg.site.default_override_sec);
    let mut link_lost = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let topic = p.topic.as_str();
                let payload = p.payload.as_ref();

                if let Some(node_id) = extract_node_id(topic) {
                    match serde_json::from_slice::<ReadingMsg>(payload) {
                        Ok(msg) => {
                            let at = msg.taken_at(engine.clock().now());
                            for (quantity, value) in msg.known() {
                                engine.push_reading(quantity, value, at).await;
                            }
                            info!(node = node_id, ts = msg.ts, readings = msg.readings.len(), "telemetry");
                        }
                        Err(e) => warn!(%topic, "bad telemetry json: {e}"),
                    }
                } else if let Some(channel) = extract_channel_id(topic) {
                    let target = OverrideTarget::Channel(channel.into());
                    handle_command(&engine, target, payload, default_override).await;
                } else if let Some(group) = extract_group(topic) {
                    let target = OverrideTarget::Group(group.to_string());
                    handle_command(&engine, target, payload, default_override).await;
                } else if let Some(pump) = extract_dose_pump(topic) {
                    match parse_dose_ml(payload) {
                        Ok(ml) => {
                            let engine = Arc::clone(&engine);
                            let pump = ChannelId::from(pump);
                            tokio::spawn(async move {
                                match engine.dose(&pump, ml).await {
                                    Ok(_) => info!(%pump, ml, "manual dose complete"),
                                    Err(e) => warn!(%pump, ml, "manual dose refused: {e}"),
                                }
                            });
                        }
                        Err(msg) => warn!(%topic, "{msg}"),
                    }
                } else {
                    warn!(%topic, "unhandled topic");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                if link_lost {
                    // Outputs may have been touched while we were away.
                    engine.resync().await;
                    link_lost = false;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                link_lost = true;
            }
            Ok(_) => {}
            Err(e) => {
                // Outputs keep their state; the schedule and budgets still run
                // from the tick driver while the broker is away.
                error!("mqtt error: {e}. reconnecting...");
                link_lost = true;
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Apply an `ON`/`OFF`/`AUTO` command to a channel or group.
async fn handle_command(
    engine: &Arc<Engine>,
    target: OverrideTarget,
    payload: &[u8],
    default_override: Duration,
) {
    let result: Result<ChannelResults, Rejected> = match parse_command(payload) {
        Ok(Command::Set { on, duration }) => {
            engine
                .set_override(target.clone(), on, duration.unwrap_or(default_override))
                .await
        }
        Ok(Command::Release) => engine.cancel_override(target.clone()).await,
        Err(msg) => {
            warn!(?target, "{msg} (use ON, OFF, ON <secs>, OFF <secs> or AUTO)");
            return;
        }
    };

    match result {
        Ok(results) => {
            for (channel, r) in results {
                if let Err(e) = r {
                    warn!(%channel, "command not applied: {e}");
                }
            }
        }
        Err(e) => warn!(?target, "command rejected: {e}"),
    }
}
