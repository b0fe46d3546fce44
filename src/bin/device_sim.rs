//! Device simulator: random-walk telemetry for N fake phones
//!
//! Each simulated device publishes `{deviceId, timestamp, location, cellTowers}`
//! to the telemetry topic and listens on its control topic, adopting any
//! `sendIntervalSec` the supervisor advertises.
//!
//! ```bash
//! MQTT_HOST=localhost MQTT_USER=sim MQTT_PASS=sim cargo run --bin device-sim -- --devices 50 --no-tls
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use mobile_supervisor::config::{defaults, SupervisorConfig};
use mobile_supervisor::types::ConfigMessage;

#[derive(Parser, Debug)]
#[command(name = "device-sim")]
#[command(about = "Publish random-walk telemetry for simulated devices")]
struct SimArgs {
    /// Number of simulated devices
    #[arg(short = 'n', long, default_value = "10")]
    devices: usize,

    /// Starting latitude of every device
    #[arg(long, default_value = "21.0285")]
    lat: f64,

    /// Starting longitude of every device
    #[arg(long, default_value = "105.8542")]
    lon: f64,

    /// Largest step per report (meters)
    #[arg(long, default_value = "40")]
    step_m: f64,

    /// Connect without TLS
    #[arg(long)]
    no_tls: bool,

    /// RNG seed for reproducible walks
    #[arg(long)]
    seed: Option<u64>,
}

/// Meters per degree of latitude (spherical Earth)
const M_PER_DEG: f64 = defaults::EARTH_RADIUS_KM * 1_000.0 * std::f64::consts::PI / 180.0;

struct SimDevice {
    id: String,
    lat: f64,
    lon: f64,
    cid: i64,
    interval: Duration,
    next_due: Instant,
}

impl SimDevice {
    fn step(&mut self, rng: &mut StdRng, max_step_m: f64) {
        let bearing = rng.gen_range(0.0..std::f64::consts::TAU);
        let dist = rng.gen_range(0.0..=max_step_m);
        self.lat += dist * bearing.cos() / M_PER_DEG;
        self.lon += dist * bearing.sin() / (M_PER_DEG * self.lat.to_radians().cos().max(0.01));
        if rng.gen_bool(0.05) {
            self.cid += 1;
        }
    }

    fn report(&self, rng: &mut StdRng) -> serde_json::Value {
        serde_json::json!({
            "deviceId": self.id,
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "location": {
                "latitude": self.lat,
                "longitude": self.lon,
                "accuracy": rng.gen_range(3.0..60.0_f64).round(),
            },
            "cellTowers": [
                {"cid": self.cid, "lac": 10_500, "mcc": 452, "mnc": 4,
                 "isServing": true, "rssi": rng.gen_range(-110..-60)},
                {"cid": self.cid + 1, "lac": 10_500, "mcc": 452, "mnc": 4,
                 "isServing": false, "rssi": rng.gen_range(-120..-80)},
            ],
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = SimArgs::parse();
    let cfg = SupervisorConfig::load();
    let mqtt = &cfg.mqtt;
    let credentials = mqtt
        .credentials()
        .context("MQTT_HOST, MQTT_USER and MQTT_PASS must be set")?;

    let client_id = format!("device-sim-{}", uuid::Uuid::new_v4());
    let mut options = MqttOptions::new(client_id, credentials.host, mqtt.port);
    options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_secs));
    options.set_credentials(credentials.username, credentials.password);
    if mqtt.tls && !args.no_tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    let (client, mut eventloop) = AsyncClient::new(options, args.devices.max(1) * 2);

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let baseline = Duration::from_secs(u64::from(cfg.backpressure.baseline_interval_secs));
    let now = Instant::now();
    let mut devices: HashMap<String, SimDevice> = (0..args.devices)
        .map(|i| {
            let id = format!("sim-{i:04}");
            let device = SimDevice {
                id: id.clone(),
                lat: args.lat,
                lon: args.lon,
                cid: 20_000 + i as i64 * 10,
                interval: baseline,
                // Spread first reports across one interval
                next_due: now + baseline.mul_f64(rng.gen_range(0.0..1.0)),
            };
            (id, device)
        })
        .collect();

    let control_topics: HashMap<String, String> = devices
        .keys()
        .map(|id| (mqtt.control_topic(id), id.clone()))
        .collect();

    info!(devices = devices.len(), topic = %mqtt.telemetry_topic, "Device simulator starting");

    let mut tick = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping simulator");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to broker, subscribing to control topics");
                    for topic in control_topics.keys().chain(std::iter::once(&mqtt.broadcast_topic)) {
                        if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                            warn!(topic = %topic, error = %e, "Subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Ok(config) = serde_json::from_slice::<ConfigMessage>(&publish.payload) else {
                        debug!(topic = %publish.topic, "Ignoring non-config control payload");
                        continue;
                    };
                    let interval = Duration::from_secs(u64::from(config.send_interval_sec.max(1)));
                    let targets: Vec<&String> = match control_topics.get(&publish.topic) {
                        Some(id) => vec![id],
                        None => control_topics.values().collect(),
                    };
                    for id in targets {
                        if let Some(device) = devices.get_mut(id) {
                            device.interval = interval;
                        }
                    }
                    info!(
                        topic = %publish.topic,
                        interval_secs = config.send_interval_sec,
                        reason = %config.reason,
                        "Adopted new reporting interval"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT connection error, retrying");
                    tokio::time::sleep(Duration::from_millis(mqtt.reconnect_interval_ms)).await;
                }
            },
            _ = tick.tick() => {
                let now = Instant::now();
                for device in devices.values_mut().filter(|d| d.next_due <= now) {
                    device.step(&mut rng, args.step_m);
                    let payload = device.report(&mut rng).to_string();
                    if let Err(e) = client.try_publish(
                        mqtt.telemetry_topic.clone(),
                        QoS::AtMostOnce,
                        false,
                        payload,
                    ) {
                        debug!(device_id = %device.id, error = %e, "Publish queue full, skipping report");
                    }
                    device.next_due = now + device.interval;
                }
            }
        }
    }

    client.disconnect().await.ok();
    Ok(())
}
