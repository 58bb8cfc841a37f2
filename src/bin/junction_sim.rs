//! Junction feed simulator
//!
//! Publishes full junction snapshots to the feed topic at a fixed interval so
//! the gateway can be exercised without the real upstream. Densities drift
//! between pushes and emergency vehicles appear now and then.
//!
//! Usage:
//!   cargo run --bin junction-sim -- --junctions 12 --interval-ms 2000

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Map, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Bangalore city centre
const CENTRE_LAT: f64 = 12.9716;
const CENTRE_LON: f64 = 77.5946;

#[derive(Parser, Debug)]
#[command(name = "junction-sim")]
#[command(about = "Publishes simulated junction snapshots")]
struct Args {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    mqtt_port: u16,

    /// Feed topic
    #[arg(long, default_value = "traffic_junctions")]
    topic: String,

    /// Number of simulated junctions
    #[arg(long, default_value = "8")]
    junctions: usize,

    /// Milliseconds between snapshots
    #[arg(long, default_value = "2000")]
    interval_ms: u64,

    /// Chance per junction per push of an emergency vehicle
    #[arg(long, default_value = "0.02")]
    emergency_rate: f64,

    /// Spread of junction positions around the centre, in degrees
    #[arg(long, default_value = "0.01")]
    spread: f64,

    /// RNG seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many snapshots (0 runs until Ctrl+C)
    #[arg(long, default_value = "0")]
    count: u64,
}

impl Args {
    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.spread.is_finite() && self.spread >= 0.0,
            "--spread must be a non-negative number of degrees, got {}",
            self.spread
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.emergency_rate),
            "--emergency-rate must be between 0 and 1, got {}",
            self.emergency_rate
        );
        Ok(())
    }
}

struct SimJunction {
    key: String,
    id: String,
    lat: f64,
    lon: f64,
    density: i64,
    green_secs: u32,
    emergency: bool,
}

impl SimJunction {
    fn new(index: usize, rng: &mut StdRng, spread: f64) -> Self {
        Self {
            key: format!("-Sim{index:04}"),
            id: format!("J{}", index + 1),
            lat: CENTRE_LAT + rng.gen_range(-spread..=spread),
            lon: CENTRE_LON + rng.gen_range(-spread..=spread),
            density: rng.gen_range(0..=100),
            green_secs: rng.gen_range(20..=90),
            emergency: false,
        }
    }

    fn step(&mut self, rng: &mut StdRng, emergency_rate: f64) {
        self.density = (self.density + rng.gen_range(-12..=12)).clamp(0, 100);
        // Longer green phases for busier junctions
        self.green_secs = (20 + self.density as u32 * 7 / 10).min(90);
        self.emergency = rng.gen_bool(emergency_rate);
    }

    fn to_json(&self, ts: u64) -> Value {
        json!({
            "junctionId": self.id,
            "latitude": self.lat,
            "longitude": self.lon,
            "vehicleDensity": self.density,
            "greenLightDuration": self.green_secs,
            "timestamp": ts,
            "emergencyVehiclePresent": self.emergency,
        })
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn build_snapshot(junctions: &[SimJunction], ts: u64) -> Value {
    let children: Map<String, Value> =
        junctions.iter().map(|j| (j.key.clone(), j.to_json(ts))).collect();
    Value::Object(children)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    args.validate()?;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut junctions: Vec<SimJunction> =
        (0..args.junctions).map(|i| SimJunction::new(i, &mut rng, args.spread)).collect();

    let client_id = format!("junction-sim-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, &args.mqtt_host, args.mqtt_port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_max_packet_size(4 * 1024 * 1024, 4 * 1024 * 1024);

    let (client, mut eventloop) = AsyncClient::new(options, 16);
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("sim_connected"),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "sim_mqtt_error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    info!(
        host = %args.mqtt_host,
        port = %args.mqtt_port,
        topic = %args.topic,
        junctions = %args.junctions,
        interval_ms = %args.interval_ms,
        "sim_started"
    );

    let mut interval = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                for junction in junctions.iter_mut() {
                    junction.step(&mut rng, args.emergency_rate);
                    if junction.emergency {
                        info!(junction = %junction.id, density = %junction.density, "sim_emergency");
                    }
                }

                let payload = serde_json::to_vec(&build_snapshot(&junctions, epoch_ms()))?;
                // Retained so a gateway that subscribes later sees the current state
                client.publish(&args.topic, QoS::AtLeastOnce, true, payload).await?;
                sent += 1;
                debug!(seq = %sent, "sim_snapshot_published");

                if args.count > 0 && sent >= args.count {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown_signal_received");
                break;
            }
        }
    }

    // Let the last publish go out
    tokio::time::sleep(Duration::from_millis(300)).await;
    if let Err(e) = client.disconnect().await {
        debug!(error = %e, "sim_disconnect_failed");
    }
    info!(snapshots = %sent, "sim_stopped");
    Ok(())
}
