// Declare the common module *within this test crate*
mod common;

use std::sync::Arc;
use std::time::Duration;

use maat::validation::BusinessRule;
use maat::{
    ConflictResolution, Engine, EngineConfig, EngineDeps, ExecuteOptions, HealthStatus,
    LockConfig, OperationError, OperationKind, OperationStatus, ResourceClass, StaticSecret,
    verify_signature,
};

use common::{
    DenyingApprovals, FailingSink, GatedStore, PendingApprovals, SECRET, setup_engine,
    setup_engine_with, test_config,
};

fn rules(err: &OperationError) -> Vec<BusinessRule> {
    match err {
        OperationError::Validation { violations } => violations.iter().map(|v| v.rule).collect(),
        other => panic!("expected a validation error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_increase_commits_and_signs() {
    let t = setup_engine(test_config(ConflictResolution::Retry));
    t.store.provision("sku-1", 10, 1);

    let id = t
        .engine
        .execute(
            OperationKind::Increase,
            "sku-1",
            5,
            ExecuteOptions::default().with_actor("alice"),
        )
        .await
        .unwrap();

    let record = t.store.get("sku-1").unwrap();
    assert_eq!(record.quantity(), 15);
    assert_eq!(record.version(), 2);

    let op = t.engine.operation(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.previous_quantity, Some(10));
    assert_eq!(op.new_quantity, Some(15));
    assert_eq!(op.expected_version, Some(1));
    assert_eq!(op.resulting_version, Some(2));
    assert_eq!(op.actor, "alice");
    assert!(op.ended_at.is_some());
    assert!(t.engine.verify_signature(&op));

    for action in ["created", "state_read", "lock_acquired", "lock_released", "completed"] {
        assert!(op.has_audit_action(action), "missing audit action {}", action);
    }

    let completed = t.sink.security_of("operation_completed");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].risk_score, 10);
    assert_eq!(completed[0].operation_id, Some(id));
    assert_eq!(t.engine.active_locks(), 0);
}

#[tokio::test]
async fn test_quantity_by_operation_kind() {
    let t = setup_engine(test_config(ConflictResolution::Retry));
    let cases = [
        (OperationKind::Increase, "k-increase", 10, 4, 14),
        (OperationKind::Decrease, "k-decrease", 10, 4, 6),
        (OperationKind::Transfer, "k-transfer", 10, 4, 6),
        (OperationKind::Adjustment, "k-adjust", 10, 42, 42),
        (OperationKind::Reserve, "k-reserve", 10, 5, 5),
        (OperationKind::Release, "k-release", 10, 5, 15),
        (OperationKind::PriceUpdate, "k-price", 1000, 1200, 1200),
    ];

    for (kind, key, initial, requested, expected) in cases {
        t.store.provision(key, initial, 1);
        t.engine
            .execute(kind, key, requested, ExecuteOptions::default())
            .await
            .unwrap_or_else(|e| panic!("{} failed: {}", kind, e));
        assert_eq!(t.store.get(key).unwrap().quantity(), expected, "{}", kind);
    }
}

#[tokio::test]
async fn test_negative_adjustment_rejected_before_lock() {
    // adjustment(-5) on a record holding 3 with negative stock disallowed.
    let t = setup_engine(test_config(ConflictResolution::Retry));
    t.store.provision("sku-1", 3, 1);

    let err = t
        .engine
        .execute(
            OperationKind::Adjustment,
            "sku-1",
            -5,
            ExecuteOptions::default().with_operation_id("adjust-1"),
        )
        .await
        .unwrap_err();
    assert_eq!(
        rules(&err),
        vec![BusinessRule::NonNegativeStock, BusinessRule::PositiveQuantity]
    );

    let op = t.engine.operation(&"adjust-1".into()).unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.failure_reason.as_deref(), Some("validation_failed"));
    assert!(!op.has_audit_action("lock_acquired"));
    assert!(op.digital_signature.is_none());

    assert_eq!(t.store.write_calls(), 0);
    assert_eq!(t.store.get("sku-1").unwrap().version(), 1);
}

#[tokio::test]
async fn test_extreme_price_is_a_validation_error() {
    let t = setup_engine(test_config(ConflictResolution::Retry));
    t.store.provision("price-1", 1000, 1);

    let err = t
        .engine
        .execute(
            OperationKind::PriceUpdate,
            "price-1",
            i64::MIN,
            ExecuteOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(rules(&err).contains(&BusinessRule::PositiveQuantity));
    assert!(rules(&err).contains(&BusinessRule::PriceChangeBound));
    assert_eq!(t.store.write_calls(), 0);
    assert_eq!(t.store.get("price-1").unwrap().quantity(), 1000);
}

#[tokio::test]
async fn test_reservation_and_price_limits() {
    let t = setup_engine(test_config(ConflictResolution::Retry));
    t.store.provision("sku-1", 20, 1);
    t.store.provision("price-1", 1000, 1);

    let err = t
        .engine
        .execute(OperationKind::Reserve, "sku-1", 17, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(rules(&err), vec![BusinessRule::ReservationLimit]);

    let err = t
        .engine
        .execute(OperationKind::PriceUpdate, "price-1", 2000, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(rules(&err), vec![BusinessRule::PriceChangeBound]);

    // Within bounds both go through.
    t.engine
        .execute(OperationKind::Reserve, "sku-1", 16, ExecuteOptions::default())
        .await
        .unwrap();
    t.engine
        .execute(OperationKind::PriceUpdate, "price-1", 1500, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(t.store.get("sku-1").unwrap().quantity(), 4);
    assert_eq!(t.store.get("price-1").unwrap().quantity(), 1500);
}

#[tokio::test]
async fn test_approval_denied() {
    let mut config = test_config(ConflictResolution::Fail);
    config.classes.get_mut(&ResourceClass::Pricing).unwrap().require_approval = true;
    let t = setup_engine_with(config, |deps| {
        deps.with_approvals(Arc::new(DenyingApprovals("margin too low")))
    });
    t.store.provision("price-1", 1000, 1);

    let err = t
        .engine
        .execute(
            OperationKind::PriceUpdate,
            "price-1",
            900,
            ExecuteOptions::default().with_operation_id("price-op"),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        OperationError::ApprovalDenied {
            reason: "margin too low".to_string()
        }
    );

    let op = t.engine.operation(&"price-op".into()).unwrap();
    assert!(!op.approved);
    assert_eq!(op.failure_reason.as_deref(), Some("approval_denied"));
    assert_eq!(t.store.write_calls(), 0);
}

#[tokio::test]
async fn test_approval_timeout() {
    let config = EngineConfig {
        approval_timeout: Duration::from_millis(20),
        ..test_config(ConflictResolution::Fail)
    };
    let t = setup_engine_with(config, |deps| deps.with_approvals(Arc::new(PendingApprovals)));
    t.store.provision("sku-1", 10, 1);

    let err = t
        .engine
        .execute(
            OperationKind::Increase,
            "sku-1",
            1,
            ExecuteOptions::default().requiring_approval(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, OperationError::ApprovalTimeout);
    assert_eq!(err.reason_code(), "approval_timeout");
    assert_eq!(t.store.get("sku-1").unwrap().quantity(), 10);
}

#[tokio::test]
async fn test_approval_granted_is_recorded() {
    let t = setup_engine(test_config(ConflictResolution::Fail));
    t.store.provision("sku-1", 10, 1);

    let id = t
        .engine
        .execute(
            OperationKind::Increase,
            "sku-1",
            1,
            ExecuteOptions::default().requiring_approval(),
        )
        .await
        .unwrap();
    let op = t.engine.operation(&id).unwrap();
    assert!(op.approved);
    assert!(op.has_audit_action("approved"));
}

#[tokio::test]
async fn test_storage_failure_is_terminal_and_releases_lock() {
    let t = setup_engine(test_config(ConflictResolution::Retry));
    t.store.provision("sku-1", 10, 1);
    t.store.fail_writes(true);

    let err = t
        .engine
        .execute(
            OperationKind::Decrease,
            "sku-1",
            2,
            ExecuteOptions::default().with_operation_id("broken"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OperationError::Storage(_)));
    assert!(!err.is_conflict());

    let op = t.engine.operation(&"broken".into()).unwrap();
    assert_eq!(op.failure_reason.as_deref(), Some("storage_error"));
    assert!(op.has_audit_action("lock_released"));
    assert_eq!(op.retry_count, 0);
    assert_eq!(t.engine.active_locks(), 0);
    assert_eq!(t.store.write_calls(), 1);
}

#[tokio::test]
async fn test_exhausted_version_is_a_storage_error() {
    let t = setup_engine(test_config(ConflictResolution::Retry));
    t.store.provision("sku-1", 10, u64::MAX);

    let err = t
        .engine
        .execute(OperationKind::Increase, "sku-1", 1, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OperationError::Storage(_)));
    assert_eq!(t.store.write_calls(), 0);
    assert_eq!(t.store.get("sku-1").unwrap().quantity(), 10);
    assert_eq!(t.engine.active_locks(), 0);
}

#[tokio::test]
async fn test_unknown_record_is_a_storage_error() {
    let t = setup_engine(test_config(ConflictResolution::Retry));
    let err = t
        .engine
        .execute(OperationKind::Increase, "ghost", 1, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OperationError::Storage(_)));
}

#[test]
fn test_engine_requires_signing_secret() {
    let deps = EngineDeps::new(
        Arc::new(GatedStore::new()),
        Arc::new(StaticSecret::new(Vec::new())),
    );
    let result = Engine::new(test_config(ConflictResolution::Retry), deps);
    assert!(matches!(result, Err(OperationError::Configuration(_))));
}

#[tokio::test]
async fn test_missing_class_policy_is_a_configuration_error() {
    let mut config = test_config(ConflictResolution::Retry);
    config.classes.remove(&ResourceClass::Pricing);
    let t = setup_engine(config);
    t.store.provision("price-1", 1000, 1);

    let err = t
        .engine
        .execute(OperationKind::PriceUpdate, "price-1", 1100, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OperationError::Configuration(_)));
    assert_eq!(t.store.write_calls(), 0);
}

#[tokio::test]
async fn test_replaying_an_operation_id() {
    let t = setup_engine(test_config(ConflictResolution::Retry));
    t.store.provision("sku-1", 10, 1);
    let options = ExecuteOptions::default().with_operation_id("order-42");

    let first = t
        .engine
        .execute(OperationKind::Increase, "sku-1", 5, options.clone())
        .await
        .unwrap();
    let replay = t
        .engine
        .execute(OperationKind::Increase, "sku-1", 5, options)
        .await
        .unwrap();
    assert_eq!(first, replay);
    assert_eq!(t.store.write_calls(), 1);
    assert_eq!(t.store.get("sku-1").unwrap().quantity(), 15);

    let op = t.engine.operation(&first).unwrap();
    assert!(op.has_audit_action("replay_ignored"));
    assert_eq!(op.status, OperationStatus::Completed);

    // A failed id stays failed.
    let failing = ExecuteOptions::default().with_operation_id("order-43");
    t.engine
        .execute(OperationKind::Adjustment, "sku-1", -1, failing.clone())
        .await
        .unwrap_err();
    let err = t
        .engine
        .execute(OperationKind::Adjustment, "sku-1", -1, failing)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        OperationError::AlreadyFailed {
            id: "order-43".into(),
            reason: "validation_failed".to_string(),
        }
    );
}

#[tokio::test]
async fn test_signature_covers_every_field() {
    let t = setup_engine(test_config(ConflictResolution::Retry));
    t.store.provision("sku-1", 10, 1);
    let id = t
        .engine
        .execute(OperationKind::Decrease, "sku-1", 3, ExecuteOptions::default())
        .await
        .unwrap();

    let op = t.engine.operation(&id).unwrap();
    assert!(verify_signature(&op, SECRET));
    assert!(!verify_signature(&op, b"wrong-secret"));

    let mut tampered = op.clone();
    tampered.new_quantity = Some(100);
    assert!(!t.engine.verify_signature(&tampered));

    let mut tampered = op.clone();
    tampered.requested_quantity = 1;
    assert!(!t.engine.verify_signature(&tampered));

    let mut tampered = op;
    tampered.signed_at = tampered.signed_at.map(|at| at + chrono::Duration::seconds(1));
    assert!(!t.engine.verify_signature(&tampered));
}

#[tokio::test]
async fn test_sink_failures_do_not_roll_back() {
    let t = setup_engine_with(test_config(ConflictResolution::Retry), |deps| {
        deps.with_audit_sink(Arc::new(FailingSink))
            .with_security_sink(Arc::new(FailingSink))
    });
    t.store.provision("sku-1", 10, 1);

    let id = t
        .engine
        .execute(OperationKind::Increase, "sku-1", 1, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(t.store.get("sku-1").unwrap().quantity(), 11);
    assert_eq!(
        t.engine.operation(&id).unwrap().status,
        OperationStatus::Completed
    );
}

#[tokio::test]
async fn test_one_audit_event_per_transition() {
    let t = setup_engine(test_config(ConflictResolution::Retry));
    t.store.provision("sku-1", 10, 1);
    t.engine
        .execute(OperationKind::Increase, "sku-1", 1, ExecuteOptions::default())
        .await
        .unwrap();

    // pending -> locked -> executing -> completed
    assert_eq!(t.sink.count_audit("transition"), 3);
    assert_eq!(t.sink.count_audit("operation_created"), 1);
}

#[tokio::test]
async fn test_stats_and_health() {
    let t = setup_engine(test_config(ConflictResolution::Retry));
    t.store.provision("sku-1", 10, 1);

    t.engine
        .execute(OperationKind::Increase, "sku-1", 1, ExecuteOptions::default())
        .await
        .unwrap();
    t.engine
        .execute(OperationKind::Decrease, "sku-1", 100, ExecuteOptions::default())
        .await
        .unwrap_err();

    let stats = t.engine.get_stats();
    assert_eq!(stats.total_operations, 2);
    assert_eq!(stats.successful_operations, 1);
    assert_eq!(stats.failed_operations, 1);
    assert_eq!(stats.lock_acquisitions, 1);
    assert_eq!(stats.lock_timeouts, 0);

    let report = t.engine.health_check();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.unresolved_conflicts, 0);
    assert_eq!(report.stats.total_operations, 2);

    t.engine.reset_stats();
    assert_eq!(t.engine.get_stats().total_operations, 0);
}

#[tokio::test]
async fn test_reload_config() {
    let t = setup_engine(test_config(ConflictResolution::Retry));
    t.store.provision("sku-1", 20, 1);

    let invalid = EngineConfig {
        reservation_limit_fraction: 2.0,
        ..test_config(ConflictResolution::Retry)
    };
    assert!(t.engine.reload_config(invalid).is_err());

    let stricter = EngineConfig {
        reservation_limit_fraction: 0.5,
        ..test_config(ConflictResolution::Retry)
    };
    t.engine.reload_config(stricter).unwrap();

    let err = t
        .engine
        .execute(OperationKind::Reserve, "sku-1", 15, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(rules(&err), vec![BusinessRule::ReservationLimit]);

    let relaxed = test_config(ConflictResolution::Retry).with_class(
        ResourceClass::Reservation,
        LockConfig {
            enforce_reservation_limit: false,
            ..LockConfig::default()
        },
    );
    t.engine.reload_config(relaxed).unwrap();
    t.engine
        .execute(OperationKind::Reserve, "sku-1", 15, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(t.store.get("sku-1").unwrap().quantity(), 5);
}
