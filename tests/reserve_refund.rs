use std::sync::Arc;

use capledger::{
    competition::NewCompetition,
    core::service::{
        Adjustment, CapacityError, CapacityService, Duplicate, Entity, Outcome, RefundRequest,
        ReserveRequest,
    },
    ledger::{ChangeReason, LedgerQuery, net_change},
    persist::sqlite::SqliteStore,
    reservation::{NewReservation, ReservationStatus},
};

fn setup(total: i64) -> CapacityService {
    let store = SqliteStore::open_in_memory().expect("open");
    store
        .insert_competition(&NewCompetition {
            id: "c1".to_string(),
            total_tokens: total,
        })
        .expect("competition");
    for (id, spaces) in [("r1", 12), ("r2", 10), ("r3", 4)] {
        store
            .insert_reservation(&NewReservation {
                id: id.to_string(),
                competition_id: "c1".to_string(),
                studio_id: format!("studio-{id}"),
                spaces_requested: spaces,
            })
            .expect("reservation");
    }
    CapacityService::new(Arc::new(store))
}

fn reserve(reservation_id: &str, spaces: i64) -> ReserveRequest {
    ReserveRequest {
        competition_id: "c1".to_string(),
        reservation_id: reservation_id.to_string(),
        spaces,
        acting_user: "cd".to_string(),
    }
}

fn refund(reservation_id: &str, spaces: i64, reason: ChangeReason, key: &str) -> RefundRequest {
    RefundRequest {
        competition_id: "c1".to_string(),
        reservation_id: Some(reservation_id.to_string()),
        spaces,
        reason,
        acting_user: "cd".to_string(),
        idempotency_key: key.to_string(),
    }
}

#[test]
fn approve_reject_cancel_scenario_reconciles() {
    let svc = setup(20);

    let outcome = svc.reserve(&reserve("r1", 12)).expect("reserve r1");
    let change = outcome.change().expect("applied").clone();
    assert_eq!((change.available_before, change.available_after), (20, 8));
    assert_eq!(svc.get_available("c1").expect("available"), 8);

    let ledger = svc.get_ledger("c1", &LedgerQuery::default()).expect("ledger");
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].change_amount, -12);
    assert_eq!(ledger[0].reason, ChangeReason::ReservationApproval);
    assert_eq!(ledger[0].reservation_id.as_deref(), Some("r1"));
    assert_eq!(ledger[0].id, change.entry_id);

    let err = svc.reserve(&reserve("r2", 10)).expect_err("not enough left");
    assert!(matches!(
        err,
        CapacityError::InsufficientCapacity {
            requested: 10,
            available: 8
        }
    ));
    assert!(err.is_user_facing());
    assert_eq!(svc.get_available("c1").expect("available"), 8);

    svc.refund(&refund("r1", 12, ChangeReason::ReservationCancellation, "cancel-r1"))
        .expect("refund r1");
    assert_eq!(svc.get_available("c1").expect("available"), 20);

    let ledger = svc.get_ledger("c1", &LedgerQuery::default()).expect("ledger");
    assert_eq!(ledger.len(), 2);
    assert_eq!(net_change(&ledger), 0);
    assert_eq!(ledger[0].reason, ChangeReason::ReservationCancellation);

    let report = svc.reconcile("c1").expect("reconcile");
    assert_eq!(report.discrepancy, 0);
    assert!(report.is_accurate);
    assert_eq!(report.expected_available, 20);
    assert_eq!(report.allocated, 0);
    assert_eq!(report.ledger_entry_count, 2);
}

#[test]
fn approval_updates_reservation_record() {
    let svc = setup(20);
    svc.reserve(&reserve("r1", 11)).expect("reserve");

    let r = svc.store().reservation("r1").expect("read").expect("exists");
    assert_eq!(r.status, ReservationStatus::Approved);
    assert_eq!(r.spaces_requested, 12);
    assert_eq!(r.spaces_confirmed, Some(11));
    assert_eq!(r.approved_by.as_deref(), Some("cd"));
    assert!(r.approved_at_ms.is_some());
}

#[test]
fn second_reserve_is_idempotent_skip() {
    let svc = setup(20);
    assert!(svc.reserve(&reserve("r1", 12)).expect("first").is_applied());

    let second = svc.reserve(&reserve("r1", 12)).expect("second");
    assert_eq!(
        second,
        Outcome::AlreadyApplied(Duplicate::ReservationNotPending(ReservationStatus::Approved))
    );
    assert_eq!(svc.get_available("c1").expect("available"), 8);

    let approvals = svc
        .get_ledger("c1", &LedgerQuery::for_reservation("r1"))
        .expect("ledger")
        .into_iter()
        .filter(|e| e.reason == ChangeReason::ReservationApproval)
        .count();
    assert_eq!(approvals, 1);
}

#[test]
fn rejected_reserve_changes_nothing() {
    let svc = setup(5);
    let err = svc.reserve(&reserve("r1", 6)).expect_err("too many");
    assert!(matches!(err, CapacityError::InsufficientCapacity { .. }));

    assert_eq!(svc.get_available("c1").expect("available"), 5);
    let r = svc.store().reservation("r1").expect("read").expect("exists");
    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(r.spaces_confirmed, None);
    assert!(svc.get_ledger("c1", &LedgerQuery::default()).expect("ledger").is_empty());
}

#[test]
fn reserve_exactly_remaining_capacity_succeeds() {
    let svc = setup(12);
    svc.reserve(&reserve("r1", 12)).expect("reserve all");
    assert_eq!(svc.get_available("c1").expect("available"), 0);
    let err = svc.reserve(&reserve("r3", 1)).expect_err("pool empty");
    assert!(matches!(
        err,
        CapacityError::InsufficientCapacity {
            requested: 1,
            available: 0
        }
    ));
}

#[test]
fn reserve_then_refund_restores_available() {
    let svc = setup(30);
    svc.reserve(&reserve("r3", 4)).expect("warm up");
    let before = svc.get_available("c1").expect("available");

    svc.reserve(&reserve("r2", 7)).expect("reserve");
    svc.refund(&refund("r2", 7, ChangeReason::ReservationCancellation, "cancel-r2"))
        .expect("refund");

    assert_eq!(svc.get_available("c1").expect("available"), before);
}

#[test]
fn refund_above_total_is_rejected() {
    let svc = setup(20);
    let err = svc
        .refund(&refund("r1", 1, ChangeReason::SummaryRefund, "summary-r1"))
        .expect_err("ceiling");
    assert!(matches!(
        err,
        CapacityError::RefundExceedsCapacity {
            requested: 1,
            available: 20,
            total: 20
        }
    ));
    assert!(!err.is_user_facing());
    assert_eq!(svc.get_available("c1").expect("available"), 20);
    assert!(svc.get_ledger("c1", &LedgerQuery::default()).expect("ledger").is_empty());
}

#[test]
fn partial_summary_refund_then_double_refund_is_caught() {
    let svc = setup(20);
    svc.reserve(&reserve("r1", 12)).expect("reserve");

    svc.refund(&refund("r1", 5, ChangeReason::SummaryRefund, "summary-r1"))
        .expect("summary refund");
    assert_eq!(svc.get_available("c1").expect("available"), 13);

    let replay = svc
        .refund(&refund("r1", 5, ChangeReason::SummaryRefund, "summary-r1"))
        .expect("replay");
    assert!(matches!(
        replay,
        Outcome::AlreadyApplied(Duplicate::IdempotencyKeyUsed(_))
    ));
    assert_eq!(svc.get_available("c1").expect("available"), 13);

    let err = svc
        .refund(&refund("r1", 8, ChangeReason::ReservationCancellation, "cancel-r1"))
        .expect_err("would exceed total");
    assert!(matches!(err, CapacityError::RefundExceedsCapacity { .. }));
    assert!(svc.reconcile("c1").expect("reconcile").is_accurate);
}

#[test]
fn invalid_arguments_are_rejected_before_any_write() {
    let svc = setup(20);

    for spaces in [0, -3] {
        let err = svc.reserve(&reserve("r1", spaces)).expect_err("non-positive");
        assert!(matches!(err, CapacityError::InvalidArgument(_)));
        let err = svc
            .refund(&refund("r1", spaces, ChangeReason::SummaryRefund, "k"))
            .expect_err("non-positive");
        assert!(matches!(err, CapacityError::InvalidArgument(_)));
    }

    let err = svc
        .refund(&refund("r1", 1, ChangeReason::ReservationApproval, "k"))
        .expect_err("approval reason");
    assert!(matches!(err, CapacityError::InvalidArgument(_)));

    let err = svc
        .refund(&refund("r1", 1, ChangeReason::SummaryRefund, "  "))
        .expect_err("blank key");
    assert!(matches!(err, CapacityError::InvalidArgument(_)));

    assert!(svc.get_ledger("c1", &LedgerQuery::default()).expect("ledger").is_empty());
}

#[test]
fn missing_records_are_not_found() {
    let svc = setup(20);

    let err = svc.reserve(&reserve("ghost", 1)).expect_err("no reservation");
    assert!(matches!(
        err,
        CapacityError::NotFound {
            entity: Entity::Reservation,
            ..
        }
    ));

    let mut req = reserve("r1", 1);
    req.competition_id = "ghost".to_string();
    assert!(matches!(
        svc.reserve(&req).expect_err("no competition"),
        CapacityError::NotFound {
            entity: Entity::Competition,
            ..
        }
    ));
    assert_eq!(
        svc.store().reservation("r1").expect("read").expect("exists").status,
        ReservationStatus::Pending
    );

    let err = svc.get_available("nope").expect_err("no competition");
    assert!(matches!(
        err,
        CapacityError::NotFound {
            entity: Entity::Competition,
            ..
        }
    ));

    let err = svc.reconcile("nope").expect_err("no competition");
    assert!(matches!(err, CapacityError::NotFound { .. }));

    let mut req = refund("r1", 1, ChangeReason::SummaryRefund, "k1");
    req.competition_id = "nope".to_string();
    assert!(matches!(
        svc.refund(&req).expect_err("no competition"),
        CapacityError::NotFound {
            entity: Entity::Competition,
            ..
        }
    ));

    let req = refund("ghost", 1, ChangeReason::SummaryRefund, "k2");
    assert!(matches!(
        svc.refund(&req).expect_err("no reservation"),
        CapacityError::NotFound {
            entity: Entity::Reservation,
            ..
        }
    ));

    assert!(svc.get_ledger("nope", &LedgerQuery::default()).expect("ledger").is_empty());
}

#[test]
fn manual_adjustments_honour_floor_and_ceiling() {
    let svc = setup(20);
    let adj = |change: i64, key: &str| Adjustment {
        competition_id: "c1".to_string(),
        reservation_id: None,
        change,
        reason: ChangeReason::ManualAdjustment,
        acting_user: "admin".to_string(),
        idempotency_key: key.to_string(),
    };

    svc.adjust(&adj(-5, "a1")).expect("consume");
    assert_eq!(svc.get_available("c1").expect("available"), 15);

    assert!(matches!(
        svc.adjust(&adj(-16, "a2")).expect_err("floor"),
        CapacityError::InsufficientCapacity {
            requested: 16,
            available: 15
        }
    ));
    assert!(matches!(
        svc.adjust(&adj(6, "a3")).expect_err("ceiling"),
        CapacityError::RefundExceedsCapacity { .. }
    ));
    assert!(matches!(
        svc.adjust(&adj(0, "a4")).expect_err("zero"),
        CapacityError::InvalidArgument(_)
    ));

    svc.adjust(&adj(5, "a5")).expect("return");
    assert_eq!(svc.get_available("c1").expect("available"), 20);

    let ledger = svc.get_ledger("c1", &LedgerQuery::default()).expect("ledger");
    assert_eq!(ledger.len(), 2);
    let meta = ledger[0].metadata.as_ref().expect("metadata");
    assert_eq!((meta.available_before, meta.available_after, meta.requested), (15, 20, 5));
    assert!(svc.reconcile("c1").expect("reconcile").is_accurate);
}

#[test]
fn ledger_is_newest_first_and_filterable() {
    let svc = setup(30);
    svc.reserve(&reserve("r1", 12)).expect("r1");
    svc.reserve(&reserve("r2", 10)).expect("r2");
    svc.refund(&refund("r1", 2, ChangeReason::SummaryRefund, "summary-r1"))
        .expect("refund");

    let all = svc.get_ledger("c1", &LedgerQuery::default()).expect("ledger");
    let ids: Vec<_> = all.iter().map(|e| e.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_by(|a, b| b.cmp(a));
    assert_eq!(ids, sorted);
    assert_eq!(all[0].reason, ChangeReason::SummaryRefund);

    let r1 = svc
        .get_ledger("c1", &LedgerQuery::for_reservation("r1"))
        .expect("ledger");
    assert_eq!(r1.len(), 2);
    assert!(r1.iter().all(|e| e.reservation_id.as_deref() == Some("r1")));

    let capped = svc
        .get_ledger("c1", &LedgerQuery::default().with_limit(1))
        .expect("ledger");
    assert_eq!(capped.len(), 1);
    assert_eq!(capped[0].id, all[0].id);
}

#[test]
fn out_of_range_adjustment_is_rejected_and_store_stays_usable() {
    let svc = setup(20);
    let adj = |change: i64| Adjustment {
        competition_id: "c1".to_string(),
        reservation_id: None,
        change,
        reason: ChangeReason::CdAdjustmentDecrease,
        acting_user: "cd".to_string(),
        idempotency_key: format!("huge-{change}"),
    };

    assert!(matches!(
        svc.adjust(&adj(i64::MIN)).expect_err("unrepresentable"),
        CapacityError::InvalidArgument(_)
    ));
    assert!(matches!(
        svc.adjust(&adj(i64::MIN + 1)).expect_err("floor"),
        CapacityError::InsufficientCapacity { .. }
    ));

    assert_eq!(svc.get_available("c1").expect("available"), 20);
    svc.reserve(&reserve("r1", 12)).expect("reserve after rejection");
    assert!(svc.reconcile("c1").expect("reconcile").is_accurate);
}

#[test]
fn idempotency_keys_are_scoped_per_competition() {
    let svc = setup(20);
    svc.store()
        .insert_competition(&NewCompetition {
            id: "c2".to_string(),
            total_tokens: 20,
        })
        .expect("c2");
    svc.store()
        .insert_reservation(&NewReservation {
            id: "q1".to_string(),
            competition_id: "c2".to_string(),
            studio_id: "studio-q".to_string(),
            spaces_requested: 5,
        })
        .expect("q1");

    svc.reserve(&reserve("r1", 12)).expect("reserve r1");
    svc.reserve(&ReserveRequest {
        competition_id: "c2".to_string(),
        reservation_id: "q1".to_string(),
        spaces: 5,
        acting_user: "cd".to_string(),
    })
    .expect("reserve q1");

    svc.refund(&refund("r1", 5, ChangeReason::SummaryRefund, "evt-1"))
        .expect("c1 refund");
    let c2 = svc
        .refund(&RefundRequest {
            competition_id: "c2".to_string(),
            reservation_id: Some("q1".to_string()),
            spaces: 5,
            reason: ChangeReason::SummaryRefund,
            acting_user: "cd".to_string(),
            idempotency_key: "evt-1".to_string(),
        })
        .expect("c2 refund");
    assert!(c2.is_applied());
    assert_eq!(svc.get_available("c1").expect("available"), 13);
    assert_eq!(svc.get_available("c2").expect("available"), 20);
}

#[test]
fn reused_key_with_a_different_change_is_rejected() {
    let svc = setup(20);
    svc.reserve(&reserve("r1", 12)).expect("reserve");
    svc.refund(&refund("r1", 5, ChangeReason::SummaryRefund, "evt-1"))
        .expect("refund");

    for conflicting in [
        refund("r1", 3, ChangeReason::SummaryRefund, "evt-1"),
        refund("r1", 5, ChangeReason::ReservationCancellation, "evt-1"),
        refund("r3", 5, ChangeReason::SummaryRefund, "evt-1"),
    ] {
        let err = svc.refund(&conflicting).expect_err("conflicting reuse");
        assert!(matches!(err, CapacityError::InvalidArgument(_)));
    }

    let replay = svc
        .refund(&refund("r1", 5, ChangeReason::SummaryRefund, "evt-1"))
        .expect("replay");
    assert!(!replay.is_applied());
    assert_eq!(svc.get_available("c1").expect("available"), 13);
    assert_eq!(
        svc.get_ledger("c1", &LedgerQuery::default()).expect("ledger").len(),
        2
    );
}
