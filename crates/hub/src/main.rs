mod clock;
mod config;
mod control;
mod db;
mod mqtt;
mod scheduler;
mod shutdown;
mod state;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, sync::Arc, time::Duration};
use time::UtcOffset;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clock::{Clock, SystemClock};
use control::Controller;
use db::Db;
use mqtt::{Bridge, Publisher};
use scheduler::Scheduler;
use state::{ScheduleConfig, SystemState};

/// How long to wait for the MQTT disconnect to be flushed on shutdown.
const DISCONNECT_GRACE: Duration = Duration::from_secs(3);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // The local offset can only be read soundly while the process is still
    // single-threaded, i.e. before the runtime starts.
    let local_offset = UtcOffset::current_local_offset().ok();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(local_offset))
}

async fn run(local_offset: Option<UtcOffset>) -> Result<()> {
    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    let offset = match (cfg.fixed_offset(), local_offset) {
        (Some(o), _) => o,
        (None, Some(o)) => o,
        (None, None) => {
            warn!("could not determine local UTC offset, using UTC");
            UtcOffset::UTC
        }
    };
    let system_clock = SystemClock::new(offset);
    info!(offset = %system_clock.offset(), "clock ready");
    let clock: Arc<dyn Clock> = Arc::new(system_clock);

    // ── Log store ───────────────────────────────────────────────────
    let db = Db::connect(&cfg.db_url).await?;
    db.migrate().await?;
    info!(db_url = %cfg.db_url, "log store ready");

    // ── Shared state ────────────────────────────────────────────────
    let shared = state::shared(SystemState::new(ScheduleConfig::new(
        cfg.scheduler.duration_sec,
    )));
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    mqttoptions.set_keep_alive(cfg.keep_alive());
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);
    let publisher: Arc<dyn Publisher> = Arc::new(client.clone());

    // Separate stop signals: the scheduler must stop (and queue its final
    // pump OFF) while the bridge is still flushing outgoing messages.
    let (stop_bridge, bridge_shutdown) = shutdown::channel();
    let (stop_scheduler, scheduler_shutdown) = shutdown::channel();

    let bridge = Bridge::new(
        Arc::clone(&shared),
        db.clone(),
        Arc::clone(&clock),
        cfg.topics.sensor.clone(),
    );
    let bridge_task = tokio::spawn(bridge.run(client.clone(), eventloop, bridge_shutdown));

    // ── Scheduler ───────────────────────────────────────────────────
    let scheduler = Scheduler::new(
        Arc::clone(&shared),
        Arc::clone(&publisher),
        Arc::clone(&clock),
        cfg.topics.pump.clone(),
        cfg.poll_interval(),
    );
    let scheduler_task = tokio::spawn(scheduler.run(scheduler_shutdown));

    // ── Web server (runs until a stop signal) ───────────────────────
    let controller = Controller::new(
        Arc::clone(&shared),
        db.clone(),
        publisher,
        clock,
        cfg.topics.clone(),
    );
    let served = web::serve(controller, cfg.web.port, stop_signal()).await;

    // ── Teardown ────────────────────────────────────────────────────
    info!("shutting down");
    stop_scheduler.trigger();
    if let Err(e) = scheduler_task.await {
        warn!(error = %e, "scheduler task ended abnormally");
    }

    // The bridge exits by itself once the disconnect has gone out; stop it
    // explicitly if the broker is unreachable.
    if let Err(e) = client.try_disconnect() {
        warn!(error = %e, "mqtt disconnect failed");
    }
    let mut bridge_task = bridge_task;
    if tokio::time::timeout(DISCONNECT_GRACE, &mut bridge_task)
        .await
        .is_err()
    {
        stop_bridge.trigger();
        if let Err(e) = bridge_task.await {
            warn!(error = %e, "bridge task ended abnormally");
        }
    }
    db.close().await;

    served
}

async fn stop_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("stop signal received");
}
