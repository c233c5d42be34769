mod actuator;
mod catalog;
mod config;
mod control;
mod ledger;
mod mqtt;
mod policy;
mod pump;
mod round;
mod state;
mod sunrise;

use std::{env, path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::HttpPumpActuator;
use catalog::HttpCommandHistory;
use config::Config;
use control::ControlLoop;
use ledger::WaterLedger;
use mqtt::Bus;
use pump::PumpController;
use state::ControlState;

const DEFAULT_CONFIG_PATH: &str = "control.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let cfg = load_config()?;
    info!(
        broker = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        prefix = %cfg.mqtt.topic_prefix,
        actuator = %cfg.actuator.base_url,
        catalog = %cfg.catalog.base_url,
        "config loaded"
    );

    // ── Ledger ──────────────────────────────────────────────────────
    let ledger = WaterLedger::load(&cfg.ledger.path);
    info!(
        path = %ledger.path().display(),
        total_liters = format!("{:.4}", ledger.total_liters()),
        "water ledger loaded"
    );

    // ── Remote services ─────────────────────────────────────────────
    let actuator = Arc::new(HttpPumpActuator::new(&cfg.actuator)?);
    let history = Arc::new(HttpCommandHistory::new(&cfg.catalog)?);

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_secs));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);
    let bus = Bus::new(client, &cfg.mqtt.topic_prefix, cfg.round.utc_offset());

    // ── Shared state + pump ─────────────────────────────────────────
    let shared = ControlState::shared(&cfg);
    let pump = Arc::new(PumpController::new(
        actuator,
        history,
        bus.clone(),
        shared.clone(),
        ledger,
        &cfg.catalog.pump_device_id,
        cfg.pump.duration(),
    ));

    // Inbound side: subscribe on every (re)connect, feed readings into state.
    let bus_task = {
        let bus = bus.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        mqtt::handle_publish(&shared, bus.prefix(), &p.topic, &p.payload).await;
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected");
                        if let Err(e) = bus.try_subscribe_sensors() {
                            error!("failed to subscribe to sensor topics: {e}");
                        } else {
                            info!(prefix = bus.prefix(), "subscribed to sensor topics");
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => warn!("mqtt disconnected"),
                    Ok(other) => debug!(?other, "mqtt event"),
                    Err(e) => {
                        warn!("mqtt error: {e}. reconnecting...");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        })
    };

    // ── Control loop ────────────────────────────────────────────────
    let control = ControlLoop::new(cfg, shared, Arc::clone(&pump), bus.clone());
    tokio::select! {
        _ = control.run() => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("failed to listen for shutdown signal: {e}");
            }
            info!("shutdown requested");
        }
    }

    pump.shutdown().await;
    if let Err(e) = bus.disconnect().await {
        debug!("mqtt disconnect: {e}");
    }
    bus_task.abort();
    info!("control unit stopped");
    Ok(())
}

/// `CONFIG_PATH` must exist when set; the default file is optional.
fn load_config() -> Result<Config> {
    let mut cfg = match env::var("CONFIG_PATH") {
        Ok(path) => config::load(&path)?,
        Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => config::load(DEFAULT_CONFIG_PATH)?,
        Err(_) => {
            info!("no {DEFAULT_CONFIG_PATH} found, using defaults");
            Config::default()
        }
    };

    let host = env::var("MQTT_HOST").ok();
    let port = match env::var("MQTT_PORT") {
        Ok(p) => Some(
            p.parse::<u16>()
                .with_context(|| format!("MQTT_PORT is not a valid port: {p}"))?,
        ),
        Err(_) => None,
    };
    cfg.apply_overrides(host, port);
    cfg.validate()?;
    Ok(cfg)
}
