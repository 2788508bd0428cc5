#[cfg(test)]
mod tests {
    use {
        crate::aggregate::AggregatorState,
        crate::coordinator::{coordinator_task, Notification},
        crate::input::Router,
        crate::persistence::{persistence_task, JsonSnapshotStore, SnapshotStore},
        crate::scheduler::ResetPolicy,
        crate::tracker::Mode,
        chrono::NaiveTime,
        std::collections::HashSet,
        std::sync::Arc,
        std::time::Duration,
        tokio::sync::mpsc,
        tokio::time::timeout,
    };

    fn sources(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn make_instance(name: &str, mode: Mode, ids: &[&str], policy: ResetPolicy) -> AggregatorState {
        AggregatorState::new(name.to_string(), mode, sources(ids), policy, 2, 1_000)
    }

    fn midnight() -> ResetPolicy {
        ResetPolicy::DailyAt(NaiveTime::from_hms_opt(0, 0, 0).unwrap())
    }

    async fn recv(rx: &mut mpsc::Receiver<Notification>) -> Notification {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("notification channel closed")
    }

    /// Wire-level flow: JSON lines in, derived value notifications out.
    #[tokio::test]
    async fn test_wire_to_notification_flow() {
        let instance = make_instance("porch min", Mode::Min, &["sensor.a", "sensor.b"], midnight());

        let (event_tx, event_rx) = mpsc::channel(16);
        let (notify_tx, mut notify_rx) = mpsc::channel(16);
        let (snapshot_tx, _snapshot_rx) = mpsc::channel(64);

        let mut router = Router::new();
        router.register("porch min", &sources(&["sensor.a", "sensor.b"]), event_tx);

        let handle = tokio::spawn(coordinator_task(instance, event_rx, notify_tx, snapshot_tx));

        router
            .dispatch(r#"{"entity_id": "sensor.a", "state": "5.0"}"#)
            .await;
        router
            .dispatch(r#"{"entity_id": "sensor.b", "state": 3}"#)
            .await;
        // Unavailable state: consumed, no event, no notification
        router
            .dispatch(r#"{"entity_id": "sensor.a", "state": "unavailable"}"#)
            .await;
        router.dispatch(r#"{"action": "reset"}"#).await;
        router
            .dispatch(r#"{"entity_id": "sensor.b", "state": 9}"#)
            .await;

        drop(router);
        handle.await.unwrap();

        assert_eq!(recv(&mut notify_rx).await.value, Some(5.0));
        assert_eq!(recv(&mut notify_rx).await.value, Some(3.0));
        assert_eq!(recv(&mut notify_rx).await.value, None);
        assert_eq!(recv(&mut notify_rx).await.value, Some(9.0));
        assert!(notify_rx.recv().await.is_none());
    }

    /// Manual-only instance: nothing resets it except the explicit action.
    #[tokio::test]
    async fn test_manual_only_resets_on_trigger_alone() {
        let instance = make_instance("peak", Mode::Max, &["sensor.a"], ResetPolicy::ManualOnly);

        let (event_tx, event_rx) = mpsc::channel(16);
        let (notify_tx, mut notify_rx) = mpsc::channel(16);
        let (snapshot_tx, _snapshot_rx) = mpsc::channel(64);

        let mut router = Router::new();
        router.register("peak", &sources(&["sensor.a"]), event_tx);

        let handle = tokio::spawn(coordinator_task(instance, event_rx, notify_tx, snapshot_tx));

        router
            .dispatch(r#"{"entity_id": "sensor.a", "state": 42}"#)
            .await;
        router
            .dispatch(r#"{"action": "reset", "name": "peak"}"#)
            .await;

        drop(router);
        handle.await.unwrap();

        assert_eq!(recv(&mut notify_rx).await.value, Some(42.0));
        assert_eq!(recv(&mut notify_rx).await.value, None);
        assert!(notify_rx.recv().await.is_none());
    }

    /// Restart round trip: everything flows through the channel into the
    /// store, and a matching instance picks the value back up.
    #[tokio::test]
    async fn test_restart_round_trip_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SnapshotStore> =
            Arc::new(JsonSnapshotStore::new(dir.path().join("state.json")));

        // First process lifetime
        {
            let mut instance =
                make_instance("kitchen max", Mode::Max, &["sensor.a"], midnight());
            instance.apply_sample("sensor.a", 21.5, Some("°C"));

            let (snapshot_tx, snapshot_rx) = mpsc::channel(16);
            let handle = tokio::spawn(persistence_task(
                snapshot_rx,
                store.clone(),
                Duration::from_secs(3_600),
            ));

            snapshot_tx
                .send(("kitchen max".to_string(), instance.snapshot()))
                .await
                .unwrap();
            drop(snapshot_tx);
            handle.await.unwrap();
        }

        // Second process lifetime, same configuration
        let persisted = store.load().await.unwrap();
        let mut revived = make_instance("kitchen max", Mode::Max, &["sensor.a"], midnight());
        revived.restore(persisted["kitchen max"].clone());

        assert_eq!(revived.current_value(), Some(21.5));
        assert_eq!(revived.unit(), Some("°C"));
        assert_eq!(revived.last_reset_at(), 1_000);
    }

    /// Restart with changed configuration: the persisted extremum is
    /// discarded, the instance starts unknown.
    #[tokio::test]
    async fn test_restart_with_changed_mode_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path().join("state.json"));

        let mut old = make_instance("sensor", Mode::Min, &["sensor.a"], midnight());
        old.apply_sample("sensor.a", 7.0, None);

        let mut instances = std::collections::HashMap::new();
        instances.insert("sensor".to_string(), old.snapshot());
        store.save(&instances).await.unwrap();

        let persisted = store.load().await.unwrap();
        let mut revived = make_instance("sensor", Mode::Max, &["sensor.a"], midnight());
        revived.restore(persisted["sensor"].clone());

        assert_eq!(revived.current_value(), None);
    }
}
