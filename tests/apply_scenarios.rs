mod common;

use std::sync::Arc;

use common::{accounts, events, init_tracing, table, test_config, with_after_insert_trigger};
use pg_apply::apply::{ApplyOutcome, RowImage, TriggerAction, WriteStamp};
use pg_apply::conflict::{ConflictKind, ConflictPolicy, Resolution};
use pg_apply::memory::{MemoryDatabase, RecordingTriggers, TriggerOp, TriggerTiming};
use pg_apply::{ErrorClass, HeapApplier};
use serde_json::json;

fn local_stamp() -> WriteStamp {
    WriteStamp {
        xid: 5,
        origin: 0,
        commit_ts: None,
        command_id: 0,
    }
}

#[test]
fn test_two_nodes_insert_same_key() {
    init_tracing();
    let config = test_config(ConflictPolicy::LastUpdateWins);
    let mut db = MemoryDatabase::new(&config);
    let mut applier = HeapApplier::new(&config);
    let rel = Arc::new(accounts());

    // local insert without a tracked commit time always loses
    db.storage
        .seed(&rel, &RowImage::from_json(&[json!(1), json!("local"), json!(10)]), local_stamp())
        .unwrap();

    db.session.begin(100, 2, None);
    let outcome = applier
        .insert(&mut db.hooks(), &rel, RowImage::from_json(&[json!(1), json!("remote"), json!(20)]))
        .unwrap();
    applier.commit(&mut db.hooks()).unwrap();

    assert_eq!(
        outcome,
        ApplyOutcome::ConflictApplied {
            kind: ConflictKind::InsertInsert,
            resolution: Resolution::ApplyRemote,
        }
    );
    assert_eq!(table(&db, &rel), vec![vec![json!(1), json!("remote"), json!(20)]]);

    let report = &db.reporter.history()[0];
    assert_eq!(report.index.as_deref(), Some("accounts_pkey"));
    assert_eq!(report.remote_origin, 2);
}

#[test]
fn test_missing_rows_are_skipped_and_reported() {
    let config = test_config(ConflictPolicy::LastUpdateWins);
    let mut db = MemoryDatabase::new(&config);
    let mut applier = HeapApplier::new(&config);
    let rel = Arc::new(accounts());
    let key = RowImage::from_options(vec![Some(json!(9)), None, None]);

    let update = applier
        .update(&mut db.hooks(), &rel, &key, RowImage::from_json(&[json!(9), json!("x"), json!(1)]))
        .unwrap();
    let delete = applier.delete(&mut db.hooks(), &rel, &key).unwrap();

    assert_eq!(update.conflict_kind(), Some(ConflictKind::UpdateDelete));
    assert_eq!(delete.conflict_kind(), Some(ConflictKind::DeleteDelete));
    assert!(table(&db, &rel).is_empty());

    let kinds: Vec<_> = db.reporter.history().iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![ConflictKind::UpdateDelete, ConflictKind::DeleteDelete]);
    assert!(db.reporter.history().iter().all(|r| r.resolution == Resolution::Skip));
}

#[test]
fn test_constraint_violation_is_classified() {
    let config = test_config(ConflictPolicy::LastUpdateWins);
    let mut db = MemoryDatabase::new(&config);
    let mut applier = HeapApplier::new(&config);
    let rel = Arc::new(accounts());

    let err = applier
        .insert(
            &mut db.hooks(),
            &rel,
            RowImage::from_options(vec![Some(json!(1)), None, Some(json!(5))]),
        )
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Constraint);
}

#[test]
fn test_defaults_for_unreplicated_columns() {
    let config = test_config(ConflictPolicy::Error);
    let mut db = MemoryDatabase::new(&config);
    let mut applier = HeapApplier::new(&config);
    let rel = Arc::new(events());

    for id in 1..=3 {
        let tup = RowImage::from_options(vec![Some(json!(id)), Some(json!("click")), None, None]);
        applier.multi_insert_add(&mut db.hooks(), &rel, tup).unwrap();
    }
    applier.commit(&mut db.hooks()).unwrap();

    let rows = table(&db, &rel);
    assert_eq!(rows.len(), 3);
    // now() is fixed for the transaction, nextval is not
    assert!(rows.iter().all(|r| r[2].is_string() && r[2] == rows[0][2]));
    let seqs: Vec<_> = rows.iter().map(|r| r[3].clone()).collect();
    assert_eq!(seqs, vec![json!(1), json!(2), json!(3)]);
}

#[test]
fn test_after_triggers_fire_once_per_batched_row() {
    let mut config = test_config(ConflictPolicy::Error);
    config.apply.multi_insert_capacity = 7;
    let mut db = MemoryDatabase::new(&config);
    let mut applier = HeapApplier::new(&config);
    let rel = Arc::new(with_after_insert_trigger(accounts()));

    for id in 1..=50 {
        let tup = RowImage::from_json(&[json!(id), json!(format!("owner{id}")), json!(0)]);
        applier.multi_insert_add(&mut db.hooks(), &rel, tup).unwrap();
        assert!(applier.buffered_rows() <= 7);
    }
    applier.commit(&mut db.hooks()).unwrap();

    assert_eq!(db.storage.row_count(rel.id), 50);
    let events = db.triggers.events_of(TriggerTiming::After, TriggerOp::Insert);
    assert_eq!(events.len(), 50);
    assert!(events.iter().all(|e| e.indexed == Some(true)));
    // 7 full batches and a final one with a single row
    assert_eq!(db.storage.stats().multi_insert_batches, 8);
}

#[test]
fn test_trigger_rewrite_applies_to_conflict_update() {
    let config = test_config(ConflictPolicy::ApplyRemote);
    let triggers = RecordingTriggers::new().on_before_update(|row| {
        row.set(2, Some(json!(0)));
        TriggerAction::Proceed
    });
    let mut db = MemoryDatabase::new(&config).with_triggers(triggers);
    let mut applier = HeapApplier::new(&config);
    let rel = Arc::new(accounts().with_triggers(pg_apply::apply::TriggerDesc {
        update_before_row: true,
        ..Default::default()
    }));

    db.storage
        .seed(&rel, &RowImage::from_json(&[json!(1), json!("local"), json!(10)]), local_stamp())
        .unwrap();
    applier
        .insert(&mut db.hooks(), &rel, RowImage::from_json(&[json!(1), json!("remote"), json!(99)]))
        .unwrap();

    assert_eq!(table(&db, &rel), vec![vec![json!(1), json!("remote"), json!(0)]]);
}
