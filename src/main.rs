//! extrema - daily min/max derived sensors
//!
//! Tracks the running minimum or maximum of one or more source sensors over
//! a rolling 24-hour window, resetting at a configured wall-clock time each
//! day (or only on manual trigger). Sensor updates arrive as JSON lines on
//! stdin, derived value changes leave as JSON lines on stdout, and state
//! survives restarts through a JSON snapshot file.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release < events.jsonl
//! ```
//!
//! ## Environment Variables
//!
//! - EXTREMA_CONFIG_PATH - Sensor definitions file (default: extrema.json)
//! - EXTREMA_STATE_PATH - State snapshot file (default: extrema_state.json)
//! - EXTREMA_AUTOSAVE_SECS - Snapshot autosave interval (default: 60)
//! - EXTREMA_CHANNEL_BUFFER - Per-instance event buffer (default: 64)
//! - RUST_LOG - Logging level (optional, default: info)

#[cfg(test)]
mod tests;

mod aggregate;
mod config;
mod coordinator;
mod input;
mod persistence;
mod scheduler;
mod tracker;

use {
    aggregate::{current_timestamp, AggregatorState},
    config::{load_definitions, resolve_all, RuntimeConfig},
    coordinator::{coordinator_task, Notification},
    input::{input_task, Router},
    persistence::{persistence_task, JsonSnapshotStore, SnapshotStore},
    scheduler::reset_scheduler_task,
    std::sync::Arc,
    std::time::Duration,
    tokio::io::AsyncWriteExt,
    tokio::sync::{mpsc, watch},
    tokio::task::JoinHandle,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let runtime = RuntimeConfig::from_env();

    log::info!("🚀 Starting extrema...");
    log::info!("   Definitions: {}", runtime.config_path.display());
    log::info!("   State file: {}", runtime.state_path.display());
    log::info!("   Autosave: {}s", runtime.autosave_secs);

    let definitions = load_definitions(&runtime.config_path)?;
    let sensors = resolve_all(&definitions);
    if sensors.is_empty() {
        return Err("no valid sensor definitions, nothing to run".into());
    }
    log::info!("📊 {} derived sensor(s) configured", sensors.len());

    let store: Arc<dyn SnapshotStore> =
        Arc::new(JsonSnapshotStore::new(runtime.state_path.clone()));
    let persisted = match store.load().await {
        Ok(persisted) => persisted,
        Err(e) => {
            log::warn!("Could not load state file: {}", e);
            Default::default()
        }
    };

    let (notify_tx, notify_rx) = mpsc::channel::<Notification>(runtime.channel_buffer);
    let (snapshot_tx, snapshot_rx) = mpsc::channel(runtime.channel_buffer);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let persistence_handle = tokio::spawn(persistence_task(
        snapshot_rx,
        store,
        Duration::from_secs(runtime.autosave_secs),
    ));
    let writer_handle = tokio::spawn(notification_writer_task(notify_rx));

    let mut router = Router::new();
    let mut coordinators: Vec<JoinHandle<()>> = Vec::new();
    let mut schedulers: Vec<JoinHandle<()>> = Vec::new();

    let started_at = current_timestamp();
    for sensor in sensors {
        let mut state = AggregatorState::new(
            sensor.name.clone(),
            sensor.mode,
            sensor.entity_ids.clone(),
            sensor.reset_policy,
            sensor.round_digits,
            started_at,
        );
        if let Some(snapshot) = persisted.get(&sensor.name) {
            state.restore(snapshot.clone());
        }

        let (tx, rx) = mpsc::channel(runtime.channel_buffer);
        router.register(&sensor.name, &sensor.entity_ids, tx.clone());

        if let Some(at) = sensor.reset_policy.daily_time() {
            schedulers.push(tokio::spawn(reset_scheduler_task(
                sensor.name.clone(),
                at,
                tx,
                shutdown_rx.clone(),
            )));
        }

        // Seed the state file so creation time survives a restart that
        // happens before the first sample
        let _ = snapshot_tx.send((sensor.name.clone(), state.snapshot())).await;

        log::info!(
            "   └─ {} ({}, {} source(s))",
            state.name(),
            state.mode().as_str(),
            state.count_sensors()
        );

        coordinators.push(tokio::spawn(coordinator_task(
            state,
            rx,
            notify_tx.clone(),
            snapshot_tx.clone(),
        )));
    }

    drop(notify_tx);
    drop(snapshot_tx);
    drop(shutdown_rx);

    log::info!("✅ Pipeline configured, reading events from stdin...");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    tokio::select! {
        _ = input_task(stdin, router) => {
            log::info!("Input finished, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupt received, shutting down");
        }
    }

    // Schedulers first: after the signal no further ResetDue is sent, and
    // their event channel clones drop as each task exits
    let _ = shutdown_tx.send(true);
    for handle in schedulers {
        let _ = handle.await;
    }

    // With every sender gone the coordinators drain their queues and exit
    for handle in coordinators {
        let _ = handle.await;
    }

    // Coordinators dropped their snapshot senders; the persistence task runs
    // its final flush and stops
    let _ = persistence_handle.await;
    let _ = writer_handle.await;

    log::info!("✅ Shutdown complete");
    Ok(())
}

/// Writes one JSON line to stdout per derived value change
async fn notification_writer_task(mut rx: mpsc::Receiver<Notification>) {
    let mut stdout = tokio::io::stdout();

    while let Some(notification) = rx.recv().await {
        log::debug!("{} -> {:?}", notification.name, notification.value);

        let line = match serde_json::to_string(&notification) {
            Ok(line) => line,
            Err(e) => {
                log::error!("Failed to encode notification: {}", e);
                continue;
            }
        };

        let write = async {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await
        };
        if let Err(e) = write.await {
            log::warn!("Output stream closed ({}), notifications stop", e);
            break;
        }
    }
}
