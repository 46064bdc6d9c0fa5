#![allow(dead_code)]

use pg_apply::apply::{ColumnDesc, DefaultExpr, IndexDesc, Relation, TriggerDesc};
use pg_apply::conflict::ConflictPolicy;
use pg_apply::memory::MemoryDatabase;
use pg_apply::{Config, Replayer};
use serde_json::Value;

/// Test configuration with the given resolver and conflict history kept.
pub fn test_config(policy: ConflictPolicy) -> Config {
    let mut config = Config::default();
    config.conflicts.resolver = policy;
    config.conflicts.keep_history = true;
    config
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("pg_apply=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// `public.accounts(id pk, owner not null, balance)`
pub fn accounts() -> Relation {
    Relation::new(
        16384,
        "public",
        "accounts",
        vec![
            ColumnDesc::new("id").not_null(),
            ColumnDesc::new("owner").not_null(),
            ColumnDesc::new("balance"),
        ],
    )
    .with_index(IndexDesc {
        id: 16390,
        name: "accounts_pkey".to_string(),
        columns: vec![0],
        unique: true,
        primary: true,
        deferrable: false,
    })
}

/// `public.events(id pk, kind, created default now(), seq default nextval)`
/// with only `id` and `kind` replicated.
pub fn events() -> Relation {
    Relation::new(
        16400,
        "public",
        "events",
        vec![
            ColumnDesc::new("id").not_null(),
            ColumnDesc::new("kind"),
            ColumnDesc::new("created").default_expr(DefaultExpr::TransactionTimestamp),
            ColumnDesc::new("seq").default_expr(DefaultExpr::NextVal("events_seq".to_string())),
        ],
    )
    .with_attmap(vec![0, 1])
    .with_index(IndexDesc {
        id: 16401,
        name: "events_pkey".to_string(),
        columns: vec![0],
        unique: true,
        primary: true,
        deferrable: false,
    })
}

pub fn with_after_insert_trigger(relation: Relation) -> Relation {
    relation.with_triggers(TriggerDesc {
        insert_after_row: true,
        ..Default::default()
    })
}

pub fn replay(config: &Config, stream: &str) -> (Replayer, pg_apply::Result<()>) {
    let mut replayer = Replayer::new(config);
    let result = replayer.run(stream.as_bytes()).map(|_| ());
    (replayer, result)
}

/// Rows of a relation as JSON arrays, in placement order.
pub fn table(db: &MemoryDatabase, relation: &Relation) -> Vec<Vec<Value>> {
    db.storage
        .rows(relation.id)
        .into_iter()
        .map(|row| row.image.to_options().into_iter().map(Option::unwrap_or_default).collect())
        .collect()
}
