mod common;

use common::TestEngine;
use reserve_api::services::CreateReservationRequest;
use reserve_api::ServiceError;
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn exhaustion_admits_exactly_the_stock() {
    let engine = TestEngine::new().await;
    engine.seed_product(1, dec!(1.00), true).await;
    engine.seed_stock(1, 10).await;

    // 20 one-unit requests against 10 units: exactly 10 succeed. Distinct
    // users so the per-user limit stays out of the way.
    let mut successes = 0;
    let mut insufficient = 0;
    for _ in 0..20 {
        let request = CreateReservationRequest {
            user_id: Uuid::new_v4(),
            product_id: 1,
            quantity: 1,
            customer_info: None,
            idempotency_key: None,
        };
        match engine.service.create_reservation(request).await {
            Ok(_) => successes += 1,
            Err(ServiceError::InsufficientStock { .. }) => insufficient += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(successes, 10);
    assert_eq!(insufficient, 10);

    let stock = engine.stock(1).await;
    assert_eq!((stock.on_hand, stock.reserved), (10, 10));
    assert_eq!(stock.available(), 0);
}

#[tokio::test]
async fn release_is_clamped_and_idempotent() {
    let engine = TestEngine::new().await;
    engine.seed_product(1, dec!(1.00), true).await;
    engine.seed_stock(1, 10).await;
    let ledger = engine.service.ledger().clone();

    ledger.reserve(&*engine.db, 1, 4).await.unwrap();
    assert_eq!(engine.stock(1).await.reserved, 4);

    // Releasing more than is held clamps to zero instead of underflowing.
    ledger.release(&*engine.db, 1, 9).await.unwrap();
    assert_eq!(engine.stock(1).await.reserved, 0);

    // A second release of the same quantity is a no-op.
    ledger.release(&*engine.db, 1, 9).await.unwrap();
    let stock = engine.stock(1).await;
    assert_eq!((stock.on_hand, stock.reserved), (10, 0));
}

#[tokio::test]
async fn commit_requires_a_matching_hold() {
    let engine = TestEngine::new().await;
    engine.seed_product(1, dec!(1.00), true).await;
    engine.seed_stock(1, 10).await;
    let ledger = engine.service.ledger().clone();

    ledger.reserve(&*engine.db, 1, 2).await.unwrap();

    // Committing more than is reserved is a programming bug, not a business
    // condition.
    let err = ledger.commit(&*engine.db, 1, 3).await.unwrap_err();
    assert!(matches!(err, ServiceError::LedgerInvariantViolation(_)));

    ledger.commit(&*engine.db, 1, 2).await.unwrap();
    let stock = engine.stock(1).await;
    assert_eq!((stock.on_hand, stock.reserved), (8, 0));
}

#[tokio::test]
async fn set_on_hand_respects_existing_holds() {
    let engine = TestEngine::new().await;
    engine.seed_product(1, dec!(1.00), true).await;
    engine.seed_stock(1, 10).await;
    let ledger = engine.service.ledger().clone();

    ledger.reserve(&*engine.db, 1, 6).await.unwrap();

    let err = ledger.set_on_hand(&*engine.db, 1, 5).await.unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));

    ledger.set_on_hand(&*engine.db, 1, 20).await.unwrap();
    let stock = engine.stock(1).await;
    assert_eq!((stock.on_hand, stock.reserved), (20, 6));
}

#[tokio::test]
async fn version_strictly_increases_on_every_mutation() {
    let engine = TestEngine::new().await;
    engine.seed_product(1, dec!(1.00), true).await;
    engine.seed_stock(1, 10).await;
    let ledger = engine.service.ledger().clone();

    let v0 = engine.stock(1).await.version;
    ledger.reserve(&*engine.db, 1, 2).await.unwrap();
    let v1 = engine.stock(1).await.version;
    ledger.commit(&*engine.db, 1, 1).await.unwrap();
    let v2 = engine.stock(1).await.version;
    ledger.release(&*engine.db, 1, 1).await.unwrap();
    let v3 = engine.stock(1).await.version;

    assert!(v0 < v1 && v1 < v2 && v2 < v3);
}

#[tokio::test]
async fn invariants_hold_across_an_operation_sequence() {
    let engine = TestEngine::new().await;
    engine.seed_product(1, dec!(1.00), true).await;
    engine.seed_stock(1, 8).await;
    let ledger = engine.service.ledger().clone();

    // An arbitrary but representative interleaving.
    ledger.reserve(&*engine.db, 1, 3).await.unwrap();
    ledger.reserve(&*engine.db, 1, 5).await.unwrap();
    assert!(ledger.reserve(&*engine.db, 1, 1).await.is_err());
    ledger.commit(&*engine.db, 1, 3).await.unwrap();
    ledger.release(&*engine.db, 1, 2).await.unwrap();
    ledger.reserve(&*engine.db, 1, 2).await.unwrap();
    ledger.release(&*engine.db, 1, 100).await.unwrap();

    let stock = engine.stock(1).await;
    assert!(stock.on_hand >= 0);
    assert!(stock.reserved >= 0);
    assert!(stock.reserved <= stock.on_hand);
}

#[tokio::test]
async fn missing_stock_row_reports_not_found() {
    let engine = TestEngine::new().await;
    let ledger = engine.service.ledger().clone();
    let err = ledger.reserve(&*engine.db, 999, 1).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

// Requires a Postgres environment: a single SQLite connection serializes all
// writers, which defeats the point of the test.
// Run with: cargo test -- --ignored ledger_contention
#[tokio::test]
#[ignore = "requires a Postgres integration environment"]
async fn ledger_contention_admits_exactly_the_stock() {
    let engine = TestEngine::new().await;
    engine.seed_product(1, dec!(1.00), true).await;
    engine.seed_stock(1, 10).await;

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let service = engine.service.clone();
        tasks.push(tokio::spawn(async move {
            service
                .create_reservation(CreateReservationRequest {
                    user_id: Uuid::new_v4(),
                    product_id: 1,
                    quantity: 1,
                    customer_info: None,
                    idempotency_key: None,
                })
                .await
                .is_ok()
        }));
    }

    let mut successes = 0;
    for task in tasks {
        if task.await.unwrap_or(false) {
            successes += 1;
        }
    }
    assert_eq!(successes, 10);
    assert_eq!(engine.stock(1).await.reserved, 10);
}
