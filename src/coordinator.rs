//! Event serialization per instance
//!
//! One coordinator task per derived sensor owns that sensor's state and is
//! the only writer. Sensor samples, scheduled resets and manual resets all
//! arrive through the same mpsc channel, so whatever interleaving the
//! producers race into becomes one ordered stream here. A sample that was
//! delayed past a reset lands in the new period: arrival order decides, not
//! any source-side timestamp.

use {
    crate::aggregate::{AggregatorState, InstanceSnapshot},
    serde::Serialize,
    tokio::sync::mpsc,
};

/// Message consumed by a coordinator task
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum Event {
    Sample {
        source_id: String,
        value: f64,
        unit: Option<String>,
    },
    /// Scheduled boundary crossing (from the reset scheduler)
    ResetDue { at: i64 },
    /// Explicit external trigger
    ManualReset { at: i64 },
    Shutdown,
}

/// Derived value change record, written to the output wire as one JSON line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub name: String,
    pub value: Option<f64>,
    pub extremum_source: Option<String>,
    pub last_value: Option<f64>,
    pub last_source: Option<String>,
    pub count_sensors: usize,
    pub unit: Option<String>,
    pub last_reset_at: i64,
}

impl Notification {
    fn from_state(state: &AggregatorState) -> Self {
        Self {
            name: state.name().to_string(),
            value: state.current_value(),
            extremum_source: state.extremum_source().map(str::to_string),
            last_value: state.last_value(),
            last_source: state.last_source().map(str::to_string),
            count_sensors: state.count_sensors(),
            unit: state.unit().map(str::to_string),
            last_reset_at: state.last_reset_at(),
        }
    }
}

/// Coordinator task for one instance.
///
/// Applies events in arrival order, emits a notification only when the
/// published value changed, and forwards a snapshot to the persistence task
/// after every applied event. Runs until the channel closes or a `Shutdown`
/// message arrives.
pub async fn coordinator_task(
    mut state: AggregatorState,
    mut rx: mpsc::Receiver<Event>,
    notify_tx: mpsc::Sender<Notification>,
    snapshot_tx: mpsc::Sender<(String, InstanceSnapshot)>,
) {
    log::debug!("[{}] coordinator started", state.name());

    while let Some(event) = rx.recv().await {
        let before = state.current_value();

        match event {
            Event::Sample {
                source_id,
                value,
                unit,
            } => {
                state.apply_sample(&source_id, value, unit.as_deref());
            }
            Event::ResetDue { at } => {
                state.apply_reset(at);
            }
            Event::ManualReset { at } => {
                log::info!("[{}] manual reset", state.name());
                state.apply_reset(at);
            }
            Event::Shutdown => break,
        }

        if before != state.current_value() {
            if notify_tx
                .send(Notification::from_state(&state))
                .await
                .is_err()
            {
                log::debug!("[{}] notification channel closed", state.name());
            }
        }

        if snapshot_tx
            .send((state.name().to_string(), state.snapshot()))
            .await
            .is_err()
        {
            log::debug!("[{}] snapshot channel closed", state.name());
        }
    }

    log::debug!("[{}] coordinator stopped", state.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ResetPolicy;
    use crate::tracker::Mode;
    use chrono::NaiveTime;
    use std::time::Duration;
    use tokio::time::timeout;

    fn make_state(mode: Mode, sources: &[&str]) -> AggregatorState {
        AggregatorState::new(
            "kitchen max".to_string(),
            mode,
            sources.iter().map(|s| s.to_string()).collect(),
            ResetPolicy::DailyAt(NaiveTime::from_hms_opt(0, 0, 0).unwrap()),
            2,
            1_000,
        )
    }

    fn sample(source: &str, value: f64) -> Event {
        Event::Sample {
            source_id: source.to_string(),
            value,
            unit: None,
        }
    }

    async fn recv_notification(rx: &mut mpsc::Receiver<Notification>) -> Notification {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("notification channel closed")
    }

    #[tokio::test]
    async fn test_notifications_only_on_value_change() {
        // Samples 10, 7, 15: two notifications (10 and 15), nothing for 7
        let (tx, rx) = mpsc::channel(16);
        let (notify_tx, mut notify_rx) = mpsc::channel(16);
        let (snapshot_tx, mut snapshot_rx) = mpsc::channel(16);

        let handle = tokio::spawn(coordinator_task(
            make_state(Mode::Max, &["sensor.a"]),
            rx,
            notify_tx,
            snapshot_tx,
        ));

        tx.send(sample("sensor.a", 10.0)).await.unwrap();
        tx.send(sample("sensor.a", 7.0)).await.unwrap();
        tx.send(sample("sensor.a", 15.0)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(recv_notification(&mut notify_rx).await.value, Some(10.0));
        assert_eq!(recv_notification(&mut notify_rx).await.value, Some(15.0));
        assert!(notify_rx.recv().await.is_none());

        // Every applied event forwarded a snapshot, including the silent one
        let mut snapshots = 0;
        while snapshot_rx.recv().await.is_some() {
            snapshots += 1;
        }
        assert_eq!(snapshots, 3);
    }

    #[tokio::test]
    async fn test_reset_notifies_absent_then_new_period() {
        // A=5, B=3, reset, B=9: notifications 5, 3, absent, 9
        let (tx, rx) = mpsc::channel(16);
        let (notify_tx, mut notify_rx) = mpsc::channel(16);
        let (snapshot_tx, _snapshot_rx) = mpsc::channel(64);

        let handle = tokio::spawn(coordinator_task(
            make_state(Mode::Min, &["sensor.a", "sensor.b"]),
            rx,
            notify_tx,
            snapshot_tx,
        ));

        tx.send(sample("sensor.a", 5.0)).await.unwrap();
        tx.send(sample("sensor.b", 3.0)).await.unwrap();
        tx.send(Event::ResetDue { at: 2_000 }).await.unwrap();
        tx.send(sample("sensor.b", 9.0)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(recv_notification(&mut notify_rx).await.value, Some(5.0));
        assert_eq!(recv_notification(&mut notify_rx).await.value, Some(3.0));

        let after_reset = recv_notification(&mut notify_rx).await;
        assert_eq!(after_reset.value, None);
        assert_eq!(after_reset.last_reset_at, 2_000);

        assert_eq!(recv_notification(&mut notify_rx).await.value, Some(9.0));
        assert!(notify_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_late_sample_lands_in_current_period() {
        // A sample that raced a reset but arrived after it in the stream
        // belongs to the new period, whatever its origin time was.
        let (tx, rx) = mpsc::channel(16);
        let (notify_tx, mut notify_rx) = mpsc::channel(16);
        let (snapshot_tx, _snapshot_rx) = mpsc::channel(64);

        let handle = tokio::spawn(coordinator_task(
            make_state(Mode::Max, &["sensor.a"]),
            rx,
            notify_tx,
            snapshot_tx,
        ));

        tx.send(sample("sensor.a", 50.0)).await.unwrap();
        tx.send(Event::ResetDue { at: 2_000 }).await.unwrap();
        tx.send(sample("sensor.a", 1.0)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(recv_notification(&mut notify_rx).await.value, Some(50.0));
        assert_eq!(recv_notification(&mut notify_rx).await.value, None);
        // The delayed (smaller) sample seeds the new period
        assert_eq!(recv_notification(&mut notify_rx).await.value, Some(1.0));
    }

    #[tokio::test]
    async fn test_double_reset_emits_once() {
        let (tx, rx) = mpsc::channel(16);
        let (notify_tx, mut notify_rx) = mpsc::channel(16);
        let (snapshot_tx, _snapshot_rx) = mpsc::channel(64);

        let handle = tokio::spawn(coordinator_task(
            make_state(Mode::Max, &["sensor.a"]),
            rx,
            notify_tx,
            snapshot_tx,
        ));

        tx.send(sample("sensor.a", 8.0)).await.unwrap();
        tx.send(Event::ResetDue { at: 2_000 }).await.unwrap();
        tx.send(Event::ResetDue { at: 2_001 }).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(recv_notification(&mut notify_rx).await.value, Some(8.0));
        assert_eq!(recv_notification(&mut notify_rx).await.value, None);
        // Second reset left the published value unchanged
        assert!(notify_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_message_stops_task() {
        let (tx, rx) = mpsc::channel(16);
        let (notify_tx, _notify_rx) = mpsc::channel(16);
        let (snapshot_tx, _snapshot_rx) = mpsc::channel(16);

        let handle = tokio::spawn(coordinator_task(
            make_state(Mode::Max, &["sensor.a"]),
            rx,
            notify_tx,
            snapshot_tx,
        ));

        tx.send(Event::Shutdown).await.unwrap();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("coordinator did not stop")
            .unwrap();
    }
}
