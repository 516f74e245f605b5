mod common;

use chrono::{Duration, Utc};
use common::TestEngine;
use reserve_api::entities::ReservationStatus;
use reserve_api::services::CreateReservationRequest;
use reserve_api::ServiceError;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn create_request(user_id: Uuid, quantity: i32) -> CreateReservationRequest {
    CreateReservationRequest {
        user_id,
        product_id: 1,
        quantity,
        customer_info: None,
        idempotency_key: None,
    }
}

#[tokio::test]
async fn reaper_expires_overdue_holds_and_releases_stock() {
    let engine = TestEngine::new().await;
    engine.seed_product(1, dec!(5.00), true).await;
    engine.seed_stock(1, 10).await;
    let user = Uuid::new_v4();

    let held = engine
        .service
        .create_reservation(create_request(user, 5))
        .await
        .unwrap();
    assert_eq!(engine.stock(1).await.reserved, 5);

    // 61 seconds past a one-minute TTL.
    engine
        .force_expiry(held.id, Utc::now() - Duration::seconds(61))
        .await;

    let reaped = engine
        .service
        .reap_expired(Utc::now(), 500)
        .await
        .unwrap();
    assert_eq!(reaped, 1);

    let row = engine.reservation(held.id).await;
    assert_eq!(row.status(), Some(ReservationStatus::Expired));
    assert!(row.cancelled_at.is_some());

    let stock = engine.stock(1).await;
    assert_eq!((stock.on_hand, stock.reserved), (10, 0));

    // The expiry event reaches the bus.
    let publisher = engine.publisher();
    publisher.drain_once().await.unwrap();
    let messages = engine.queue.delivered_for_key(&user.to_string());
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].payload["event_type"], "reservation.expired");

    // A later confirm finds a terminal row.
    let err = engine
        .service
        .confirm_reservation(held.id, user)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotPending));
}

#[tokio::test]
async fn reap_is_a_no_op_on_rows_that_already_left_pending() {
    let engine = TestEngine::new().await;
    engine.seed_product(1, dec!(5.00), true).await;
    engine.seed_stock(1, 10).await;
    let user = Uuid::new_v4();

    let confirmed = engine
        .service
        .create_reservation(create_request(user, 2))
        .await
        .unwrap();
    engine
        .service
        .confirm_reservation(confirmed.id, user)
        .await
        .unwrap();

    // Backdating a confirmed row must not make the reaper touch it.
    engine
        .force_expiry(confirmed.id, Utc::now() - Duration::seconds(120))
        .await;

    let reaped = engine
        .service
        .reap_expired(Utc::now(), 500)
        .await
        .unwrap();
    assert_eq!(reaped, 0);
    assert_eq!(
        engine.reservation(confirmed.id).await.status(),
        Some(ReservationStatus::Confirmed)
    );
    // Committed stock stays committed.
    assert_eq!(engine.stock(1).await.on_hand, 8);
}

#[tokio::test]
async fn repeated_reaps_do_not_over_release() {
    let engine = TestEngine::new().await;
    engine.seed_product(1, dec!(5.00), true).await;
    engine.seed_stock(1, 10).await;
    let user = Uuid::new_v4();

    let held = engine
        .service
        .create_reservation(create_request(user, 4))
        .await
        .unwrap();
    engine
        .force_expiry(held.id, Utc::now() - Duration::seconds(61))
        .await;

    assert_eq!(engine.service.reap_expired(Utc::now(), 500).await.unwrap(), 1);
    assert_eq!(engine.service.reap_expired(Utc::now(), 500).await.unwrap(), 0);
    assert_eq!(engine.service.reap_expired(Utc::now(), 500).await.unwrap(), 0);

    let stock = engine.stock(1).await;
    assert_eq!((stock.on_hand, stock.reserved), (10, 0));
}

#[tokio::test]
async fn reaper_drains_in_batches() {
    let engine = TestEngine::new().await;
    engine.seed_product(1, dec!(1.00), true).await;
    engine.seed_stock(1, 100).await;

    let mut ids = Vec::new();
    for _ in 0..7 {
        let held = engine
            .service
            .create_reservation(create_request(Uuid::new_v4(), 1))
            .await
            .unwrap();
        ids.push(held.id);
    }
    for id in &ids {
        engine
            .force_expiry(*id, Utc::now() - Duration::seconds(61))
            .await;
    }

    // Batch of 3 at a time: 3, 3, 1, then empty.
    assert_eq!(engine.service.reap_expired(Utc::now(), 3).await.unwrap(), 3);
    assert_eq!(engine.service.reap_expired(Utc::now(), 3).await.unwrap(), 3);
    assert_eq!(engine.service.reap_expired(Utc::now(), 3).await.unwrap(), 1);
    assert_eq!(engine.service.reap_expired(Utc::now(), 3).await.unwrap(), 0);

    assert_eq!(engine.stock(1).await.reserved, 0);
}

#[tokio::test]
async fn expired_idempotency_keys_are_purged() {
    let engine = TestEngine::new().await;
    engine.seed_product(1, dec!(5.00), true).await;
    engine.seed_stock(1, 10).await;
    let user = Uuid::new_v4();

    engine
        .service
        .create_reservation(CreateReservationRequest {
            user_id: user,
            product_id: 1,
            quantity: 1,
            customer_info: None,
            idempotency_key: Some("key-1".to_string()),
        })
        .await
        .unwrap();

    // Inside the retention window nothing is purged.
    assert_eq!(
        engine
            .service
            .purge_idempotency_keys(Utc::now())
            .await
            .unwrap(),
        0
    );
    // A day later the key ages out.
    assert_eq!(
        engine
            .service
            .purge_idempotency_keys(Utc::now() + Duration::hours(25))
            .await
            .unwrap(),
        1
    );
}
