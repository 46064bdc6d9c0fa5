use std::sync::Arc;

use serde_json::json;

use super::heap::{ApplyOutcome, HeapApplier};
use super::hooks::TriggerAction;
use super::relation::{ColumnDesc, DefaultExpr, IndexDesc, Relation, TriggerDesc};
use super::row::RowImage;
use crate::conflict::ConflictPolicy;
use crate::memory::{MemoryDatabase, RecordingTriggers, TriggerOp, TriggerTiming};
use crate::{Config, Error};

fn config(capacity: usize) -> Config {
    let mut config = Config::default();
    config.conflicts.resolver = ConflictPolicy::Error;
    config.apply.multi_insert_capacity = capacity;
    config
}

fn relation(id: u32, name: &str) -> Relation {
    Relation::new(
        id,
        "public",
        name,
        vec![ColumnDesc::new("id"), ColumnDesc::new("v")],
    )
    .with_index(IndexDesc {
        id: id * 10,
        name: format!("{name}_pkey"),
        columns: vec![0],
        unique: true,
        primary: true,
        deferrable: false,
    })
}

fn row(id: i64) -> RowImage {
    RowImage::from_json(&[json!(id), json!(format!("v{id}"))])
}

#[test]
fn test_can_multi_insert_requires_error_policy() {
    let rel = relation(1, "t");
    assert!(HeapApplier::new(&config(10)).can_multi_insert(&rel));

    let mut lww = config(10);
    lww.conflicts.resolver = ConflictPolicy::LastUpdateWins;
    assert!(!HeapApplier::new(&lww).can_multi_insert(&rel));

    let mut disabled = config(10);
    disabled.apply.multi_insert = false;
    assert!(!HeapApplier::new(&disabled).can_multi_insert(&rel));
}

#[test]
fn test_more_rows_than_capacity() {
    let config = config(4);
    let mut db = MemoryDatabase::new(&config);
    let mut applier = HeapApplier::new(&config);
    let rel = Arc::new(relation(1, "t").with_triggers(TriggerDesc {
        insert_after_row: true,
        ..Default::default()
    }));

    for id in 1..=10 {
        let outcome = applier.multi_insert_add(&mut db.hooks(), &rel, row(id)).unwrap();
        assert_eq!(outcome, ApplyOutcome::Buffered);
        assert!(applier.buffered_rows() <= 4);
    }
    assert_eq!(applier.multi_insert_capacity(), Some(4));
    applier.commit(&mut db.hooks()).unwrap();

    assert_eq!(db.storage.row_count(rel.id), 10);
    let stats = db.storage.stats();
    assert_eq!(stats.multi_insert_batches, 3);
    assert_eq!(stats.multi_inserted_rows, 10);
    assert_eq!(stats.bulk_states_opened, 1);
    assert_eq!(stats.bulk_states_closed, 1);

    let after = db.triggers.events_of(TriggerTiming::After, TriggerOp::Insert);
    assert_eq!(after.len(), 10);
    // every trigger saw its row already reachable through the index
    assert!(after.iter().all(|e| e.indexed == Some(true)));

    let mut ids: Vec<_> = after.iter().filter_map(|e| e.row_id).collect();
    ids.dedup();
    assert_eq!(ids.len(), 10);
    assert_eq!(db.triggers.open_queries(), 0);
}

#[test]
fn test_before_trigger_limits_capacity_to_one() {
    let config = config(1000);
    let mut db = MemoryDatabase::new(&config);
    let mut applier = HeapApplier::new(&config);
    let rel = Arc::new(relation(1, "t").with_triggers(TriggerDesc {
        insert_before_row: true,
        ..Default::default()
    }));

    for id in 1..=3 {
        applier.multi_insert_add(&mut db.hooks(), &rel, row(id)).unwrap();
        assert_eq!(applier.multi_insert_capacity(), Some(1));
        assert_eq!(applier.buffered_rows(), 1);
    }
    applier.commit(&mut db.hooks()).unwrap();

    assert_eq!(db.storage.row_count(rel.id), 3);
    assert_eq!(db.storage.stats().multi_insert_batches, 3);
}

#[test]
fn test_volatile_default_limits_capacity_to_one() {
    let config = config(1000);
    let mut db = MemoryDatabase::new(&config);
    let mut applier = HeapApplier::new(&config);
    let rel = Arc::new(
        Relation::new(
            1,
            "public",
            "t",
            vec![
                ColumnDesc::new("id"),
                ColumnDesc::new("created").default_expr(DefaultExpr::ClockTimestamp),
            ],
        )
        .with_attmap(vec![0]),
    );

    applier
        .multi_insert_add(&mut db.hooks(), &rel, RowImage::from_options(vec![Some(json!(1)), None]))
        .unwrap();
    assert_eq!(applier.multi_insert_capacity(), Some(1));

    applier.commit(&mut db.hooks()).unwrap();
    let rows = db.storage.rows(rel.id);
    assert!(rows[0].image.get(1).is_some());
}

#[test]
fn test_sequence_default_keeps_batching() {
    let config = config(1000);
    let mut db = MemoryDatabase::new(&config);
    let mut applier = HeapApplier::new(&config);
    let rel = Arc::new(
        Relation::new(
            1,
            "public",
            "t",
            vec![
                ColumnDesc::new("id"),
                ColumnDesc::new("seq").default_expr(DefaultExpr::NextVal("t_seq".to_string())),
            ],
        )
        .with_attmap(vec![0]),
    );

    for id in 1..=3 {
        let tup = RowImage::from_options(vec![Some(json!(id)), None]);
        applier.multi_insert_add(&mut db.hooks(), &rel, tup).unwrap();
    }
    assert_eq!(applier.multi_insert_capacity(), Some(1000));
    applier.commit(&mut db.hooks()).unwrap();

    let seqs: Vec<_> = db.storage.rows(rel.id).iter().map(|r| r.image.get(1).cloned()).collect();
    assert_eq!(seqs, vec![Some(json!(1)), Some(json!(2)), Some(json!(3))]);
}

#[test]
fn test_switching_relation_flushes() {
    let config = config(100);
    let mut db = MemoryDatabase::new(&config);
    let mut applier = HeapApplier::new(&config);
    let a = Arc::new(relation(1, "a"));
    let b = Arc::new(relation(2, "b"));

    applier.multi_insert_add(&mut db.hooks(), &a, row(1)).unwrap();
    applier.multi_insert_add(&mut db.hooks(), &a, row(2)).unwrap();
    assert_eq!(db.storage.row_count(a.id), 0);

    applier.multi_insert_add(&mut db.hooks(), &b, row(1)).unwrap();
    assert_eq!(db.storage.row_count(a.id), 2);
    assert_eq!(applier.buffered_rows(), 1);
    assert_eq!(db.storage.stats().bulk_states_closed, 1);

    applier.commit(&mut db.hooks()).unwrap();
    assert_eq!(db.storage.row_count(b.id), 1);
    assert_eq!(db.storage.stats().bulk_states_closed, 2);
}

#[test]
fn test_single_row_change_finishes_episode() {
    let config = config(100);
    let mut db = MemoryDatabase::new(&config);
    let mut applier = HeapApplier::new(&config);
    let rel = Arc::new(relation(1, "t"));

    applier.multi_insert_add(&mut db.hooks(), &rel, row(1)).unwrap();
    applier.multi_insert_add(&mut db.hooks(), &rel, row(2)).unwrap();

    // buffered rows must be visible to the lookup
    let key = RowImage::from_options(vec![Some(json!(2)), None]);
    let outcome = applier.delete(&mut db.hooks(), &rel, &key).unwrap();
    assert_eq!(outcome, ApplyOutcome::Deleted);
    assert_eq!(applier.buffered_rows(), 0);
    assert_eq!(db.storage.row_count(rel.id), 1);
}

#[test]
fn test_buffered_rows_share_the_episode_command_id() {
    let config = config(100);
    let mut db = MemoryDatabase::new(&config);
    let mut applier = HeapApplier::new(&config);
    let other = Arc::new(relation(2, "other"));
    let rel = Arc::new(relation(1, "t"));

    applier.insert(&mut db.hooks(), &other, row(1)).unwrap();
    for id in 1..=3 {
        applier.multi_insert_add(&mut db.hooks(), &rel, row(id)).unwrap();
    }
    applier.commit(&mut db.hooks()).unwrap();

    for local in db.storage.rows(rel.id) {
        assert_eq!(db.storage.row_command_id(rel.id, local.id), Some(1));
    }
    // one for the insert, one for finishing the episode
    assert_eq!(db.session.command_increments(), 2);
}

#[test]
fn test_vetoed_rows_are_not_buffered() {
    let config = config(100);
    let triggers = RecordingTriggers::new().on_before_insert(|row| {
        if row.get(0).and_then(|v| v.as_i64()).unwrap_or(0) % 2 == 1 {
            TriggerAction::Suppress
        } else {
            TriggerAction::Proceed
        }
    });
    let mut db = MemoryDatabase::new(&config).with_triggers(triggers);
    let mut applier = HeapApplier::new(&config);
    let rel = Arc::new(relation(1, "t").with_triggers(TriggerDesc {
        insert_before_row: true,
        ..Default::default()
    }));

    let outcomes: Vec<_> = (1..=4)
        .map(|id| applier.multi_insert_add(&mut db.hooks(), &rel, row(id)).unwrap())
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ApplyOutcome::Suppressed,
            ApplyOutcome::Buffered,
            ApplyOutcome::Suppressed,
            ApplyOutcome::Buffered,
        ]
    );
    applier.commit(&mut db.hooks()).unwrap();
    assert_eq!(db.storage.row_count(rel.id), 2);
}

#[test]
fn test_duplicate_keys_in_batch_fail_on_flush() {
    let config = config(100);
    let mut db = MemoryDatabase::new(&config);
    let mut applier = HeapApplier::new(&config);
    let rel = Arc::new(relation(1, "t"));

    applier.multi_insert_add(&mut db.hooks(), &rel, row(1)).unwrap();
    applier.multi_insert_add(&mut db.hooks(), &rel, row(1)).unwrap();

    let err = applier.commit(&mut db.hooks()).unwrap_err();
    assert!(matches!(err, Error::UniqueViolation { .. }));

    // a failed flush still releases the episode
    assert_eq!(applier.buffered_rows(), 0);
    assert_eq!(db.storage.stats().bulk_states_closed, 1);
    assert_eq!(db.triggers.open_queries(), 0);
}

#[test]
fn test_abort_discards_buffer() {
    let config = config(100);
    let mut db = MemoryDatabase::new(&config);
    let mut applier = HeapApplier::new(&config);
    let rel = Arc::new(relation(1, "t"));

    applier.multi_insert_add(&mut db.hooks(), &rel, row(1)).unwrap();
    assert_eq!(db.triggers.open_queries(), 1);
    applier.abort(&mut db.hooks());

    assert_eq!(applier.buffered_rows(), 0);
    assert_eq!(db.triggers.open_queries(), 0);
    let stats = db.storage.stats();
    assert_eq!(stats.bulk_states_opened, 1);
    assert_eq!(stats.bulk_states_closed, 1);
    assert_eq!(stats.multi_insert_batches, 0);

    applier.commit(&mut db.hooks()).unwrap();
    assert_eq!(db.storage.row_count(rel.id), 0);
}

#[test]
fn test_begin_releases_leftover_episode() {
    let config = config(100);
    let mut db = MemoryDatabase::new(&config);
    let mut applier = HeapApplier::new(&config);
    let rel = Arc::new(relation(1, "t"));

    applier.multi_insert_add(&mut db.hooks(), &rel, row(1)).unwrap();
    applier.begin(&mut db.hooks()).unwrap();

    assert_eq!(applier.buffered_rows(), 0);
    assert_eq!(db.triggers.open_queries(), 0);
    assert_eq!(db.storage.stats().bulk_states_closed, 1);
}
