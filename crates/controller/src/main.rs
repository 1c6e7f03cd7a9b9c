mod arbiter;
mod circuit;
mod clock;
mod controller;
mod db;
mod error;
mod governor;
mod line;
mod mqtt;
mod program;
mod scheduler;
mod settings;
mod state;
mod telemetry;
mod watering;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc, time::Duration};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::RwLock;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use arbiter::Arbiter;
use circuit::AddressBus;
use clock::{Clock, SystemClock};
use controller::{Controller, Wiring};
use db::Db;
use governor::{Governor, MainValve, ValveState};
use line::RigLines;
use program::StopFlag;
use state::SystemState;
use telemetry::Telemetry;
use watering::JsonFileStore;

/// How long shutdown waits for a running program to release the bus.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // The OS offset can only be read while the process is single-threaded.
    let clock = SystemClock::detect();
    info!(offset = %clock.offset(), "local time offset");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(run(clock))
}

async fn run(clock: SystemClock) -> Result<()> {
    // ── Env config ──────────────────────────────────────────────────
    let settings_path = env::var("SETTINGS_PATH").unwrap_or_else(|_| "rig.toml".to_string());
    let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| "./config".to_string());
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:rig.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let mqtt_host = env::var("MQTT_HOST").ok();
    let mqtt_port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);

    // Hooked before anything touches the lines, so a signal during startup
    // still reaches the shutdown sweep below.
    let mut signals = Signals::hook()?;

    let settings = settings::load(&settings_path)?;
    info!(
        circuits = settings.watering.circuits,
        programs = settings.watering.programs,
        "settings loaded"
    );

    // ── Lines: everything off before any loop starts ────────────────
    // `lines` owns the flow sensor interrupt, keep it alive until exit.
    let lines = RigLines::open(&settings)?;
    let bus = AddressBus::new(lines.address.clone(), lines.any_active.clone());
    let telemetry = Telemetry::new();
    let (arbiter, _worker) = Arbiter::spawn(bus, StopFlag::default(), telemetry.clone());
    arbiter.sweep().await;
    let valve = MainValve::new(lines.main_valve.clone());
    valve.set(ValveState::Closed);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Shared state ────────────────────────────────────────────────
    let shared = Arc::new(RwLock::new(SystemState::new(settings.watering.circuits)));
    shared
        .write()
        .await
        .record_system("rig controller started".to_string());
    tokio::spawn(state::record(shared.clone(), telemetry.clone()));

    // ── Command surface ─────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(clock);
    let controller = Arc::new(Controller::start(Wiring {
        limits: settings.watering,
        store: Arc::new(JsonFileStore::new(&config_dir, settings.watering)),
        arbiter: arbiter.clone(),
        telemetry: telemetry.clone(),
        valve: valve.clone(),
        db: db.clone(),
        shared: shared.clone(),
        clock: clock.clone(),
    }));

    // ── Loops ───────────────────────────────────────────────────────
    tokio::spawn(scheduler::run(controller.schedule(), arbiter.clone(), clock));

    let governor = Governor::new(
        valve.clone(),
        lines.electricity.clone(),
        lines.flow_pulses.clone(),
        arbiter.watering_flag(),
        settings.flow.clone(),
    );
    tokio::spawn(governor::run(governor, db, shared.clone()));

    match mqtt_host {
        Some(host) => {
            tokio::spawn(mqtt::run(host, mqtt_port, telemetry, shared));
        }
        None => info!("MQTT_HOST not set, telemetry bridge disabled"),
    }

    let web = tokio::spawn(web::serve(controller, web_port));

    // ── Run until a signal or the web server gives up ───────────────
    let outcome = tokio::select! {
        name = signals.recv() => {
            info!(signal = name, "shutdown requested");
            Ok(())
        }
        served = web => match served {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(anyhow::anyhow!("web task failed: {e}")),
        },
    };
    if let Err(e) = &outcome {
        error!(error = %e, "shutting down after failure");
    }

    arbiter.shutdown(SHUTDOWN_GRACE).await;
    valve.set(ValveState::Closed);
    info!("all circuits and the main valve are closed");
    drop(lines);
    outcome
}

/// SIGINT, SIGTERM and SIGHUP. Signals arriving between `hook` and `recv`
/// are kept, not lost.
struct Signals {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
}

impl Signals {
    fn hook() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("failed to hook SIGINT")?,
            terminate: signal(SignalKind::terminate()).context("failed to hook SIGTERM")?,
            hangup: signal(SignalKind::hangup()).context("failed to hook SIGHUP")?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.hangup.recv() => "SIGHUP",
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
