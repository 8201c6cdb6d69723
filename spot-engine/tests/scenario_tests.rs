//! End-to-end reservation scenarios through the engine facade

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use spot_engine::{
    notify::{NoticeKind, NotificationDispatcher, ReservationNotice},
    store::MemoryStore,
    Config, Direction, Error, GeoPoint, HoldRequest, HolderId, ReservationState, Spot,
    SpotEngine, SpotId, SpotStatus, ZoneId,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingDispatcher {
    notices: Mutex<Vec<ReservationNotice>>,
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn notify(&self, _holder_id: &HolderId, notice: &ReservationNotice) -> spot_engine::Result<()> {
        self.notices.lock().push(notice.clone());
        Ok(())
    }
}

async fn create_test_engine() -> (SpotEngine, Arc<RecordingDispatcher>) {
    let mut config = Config::default();
    config.sweeper.enabled = false;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let engine = SpotEngine::open_with(config, Arc::new(MemoryStore::new()), dispatcher.clone())
        .await
        .unwrap();

    engine
        .register_spot(Spot::new("S1", GeoPoint::new(52.5200, 13.4050), "Z1", "Level 1 - A1"))
        .unwrap();
    engine
        .register_spot(Spot::new("S2", GeoPoint::new(52.5201, 13.4052), "Z1", "Level 1 - A2"))
        .unwrap();

    (engine, dispatcher)
}

fn driver(name: &str) -> HolderId {
    HolderId::new(name)
}

#[tokio::test]
async fn test_hold_deny_confirm_release_rehold() {
    let (engine, _) = create_test_engine().await;
    let s1 = SpotId::new("S1");
    let a = driver("driver-a");
    let b = driver("driver-b");

    let r1 = engine
        .hold(
            &a,
            &s1,
            HoldRequest {
                ttl: Some(Duration::from_secs(5 * 60)),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(r1.state, ReservationState::Pending);
    assert_eq!(engine.spot(&s1).unwrap().status, SpotStatus::Held);

    let err = engine.hold(&b, &s1, HoldRequest::default()).unwrap_err();
    assert!(matches!(err, Error::SpotUnavailable(_)));

    let active = engine.confirm(&a, &r1.id, &r1.check_in_token).unwrap();
    assert_eq!(active.state, ReservationState::Active);
    assert_eq!(engine.spot(&s1).unwrap().status, SpotStatus::Occupied);

    let done = engine.release(&a, &r1.id).unwrap();
    assert_eq!(done.state, ReservationState::Completed);
    assert_eq!(engine.spot(&s1).unwrap().status, SpotStatus::Free);

    let r2 = engine.hold(&b, &s1, HoldRequest::default()).unwrap();
    assert_eq!(r2.state, ReservationState::Pending);
    assert_ne!(r2.id, r1.id);
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let (engine, _) = create_test_engine().await;
    let a = driver("driver-a");
    let held = engine.hold(&a, &SpotId::new("S1"), HoldRequest::default()).unwrap();
    engine.confirm(&a, &held.id, &held.check_in_token).unwrap();

    let first = engine.release(&a, &held.id).unwrap();
    let second = engine.release(&a, &held.id).unwrap();
    assert_eq!(first, second);
    assert_eq!(engine.metrics().releases_total.get(), 1);
}

#[tokio::test]
async fn test_expiry_without_sweep() {
    let (engine, dispatcher) = create_test_engine().await;
    let s1 = SpotId::new("S1");
    let a = driver("driver-a");

    let held = engine
        .hold(
            &a,
            &s1,
            HoldRequest {
                ttl: Some(Duration::from_millis(30)),
                ..Default::default()
            },
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    // No sweep ran, yet every read sees the hold as lapsed
    assert_eq!(
        engine.reservation(&a, &held.id).unwrap().state,
        ReservationState::Expired
    );
    assert_eq!(engine.spot(&s1).unwrap().status, SpotStatus::Free);
    assert_eq!(engine.snapshot(&ZoneId::new("Z1")).unwrap().free_count, 2);

    let err = engine.confirm(&a, &held.id, &held.check_in_token).unwrap_err();
    assert!(matches!(err, Error::AlreadyExpired(_)));

    let next = engine.hold(&driver("driver-b"), &s1, HoldRequest::default()).unwrap();
    assert_eq!(next.state, ReservationState::Pending);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(dispatcher
        .notices
        .lock()
        .iter()
        .any(|n| n.kind == NoticeKind::Expired && n.reservation_id == held.id));
}

#[tokio::test]
async fn test_gate_scans_are_audited() {
    let (engine, dispatcher) = create_test_engine().await;
    let a = driver("driver-a");
    let held = engine.hold(&a, &SpotId::new("S2"), HoldRequest::default()).unwrap();
    let payload = spot_engine::checkin::qr_payload(&held);

    let err = engine.scan(&payload, Direction::Out).unwrap_err();
    assert!(matches!(err, Error::WrongState { .. }));

    let active = engine.scan(&payload, Direction::In).unwrap();
    assert_eq!(active.state, ReservationState::Active);
    let done = engine.scan(&payload, Direction::Out).unwrap();
    assert_eq!(done.state, ReservationState::Completed);

    engine.flush().await.unwrap();
    let records = engine.audit().for_reservation(&held.id);
    assert_eq!(records.len(), 3);
    engine.audit().verify_integrity().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let kinds: Vec<_> = dispatcher.notices.lock().iter().map(|n| n.kind).collect();
    assert_eq!(kinds, vec![NoticeKind::Confirmed, NoticeKind::Released]);
}

#[tokio::test]
async fn test_subscribers_see_changes() {
    let (engine, _) = create_test_engine().await;
    let zone = ZoneId::new("Z1");
    let mut updates = engine.subscribe(&zone).unwrap();

    let initial = updates.next().await.unwrap();
    assert_eq!(initial.free_count, 2);

    let held = engine
        .hold(&driver("driver-a"), &SpotId::new("S1"), HoldRequest::default())
        .unwrap();
    engine.flush().await.unwrap();

    let next = tokio::time::timeout(Duration::from_secs(1), updates.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.free_count, 1);
    assert_eq!(next.spot_statuses[&SpotId::new("S1")], SpotStatus::Held);
    assert!(next.as_of_version > initial.as_of_version);

    engine.cancel(&driver("driver-a"), &held.id).unwrap();
    engine.flush().await.unwrap();
    let last = tokio::time::timeout(Duration::from_secs(1), updates.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.free_count, 2);
}

#[tokio::test]
async fn test_out_of_service_blocks_holds() {
    let (engine, _) = create_test_engine().await;
    let s2 = SpotId::new("S2");

    let spot = engine.spot(&s2).unwrap();
    let spot = engine.set_out_of_service(&s2, true, spot.version).unwrap();
    assert_eq!(spot.status, SpotStatus::OutOfService);

    let err = engine
        .hold(&driver("driver-a"), &s2, HoldRequest::default())
        .unwrap_err();
    assert!(matches!(err, Error::SpotUnavailable(_)));

    let nearby = engine
        .nearby(&GeoPoint::new(52.5200, 13.4050), 100.0, None, true)
        .unwrap();
    assert_eq!(nearby.len(), 1);
    assert_eq!(nearby[0].spot.id, SpotId::new("S1"));

    engine.set_out_of_service(&s2, false, spot.version).unwrap();
    engine.hold(&driver("driver-a"), &s2, HoldRequest::default()).unwrap();
}

#[tokio::test]
async fn test_holder_is_reminded_before_expiry() {
    let (engine, dispatcher) = create_test_engine().await;
    let a = driver("driver-a");
    let held = engine
        .hold(
            &a,
            &SpotId::new("S1"),
            HoldRequest {
                ttl: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        )
        .unwrap();

    // A second live hold by the same driver is refused
    let err = engine
        .hold(&a, &SpotId::new("S2"), HoldRequest::default())
        .unwrap_err();
    assert!(matches!(err, Error::HolderLimitReached { .. }));

    let reminded = engine.ledger().remind_expiring(Duration::from_secs(60)).unwrap();
    assert_eq!(reminded.len(), 1);
    assert!(engine
        .ledger()
        .remind_expiring(Duration::from_secs(60))
        .unwrap()
        .is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let notices = dispatcher.notices.lock();
    let reminders: Vec<_> = notices
        .iter()
        .filter(|n| n.kind == NoticeKind::ExpiringSoon)
        .collect();
    assert_eq!(reminders.len(), 1);
    assert_eq!(reminders[0].reservation_id, held.id);
    assert_eq!(engine.metrics().reminders_total.get(), 1);
}
