use serde::{Deserialize, Serialize};

use super::row::Datum;

pub type RelationId = u32;
pub type IndexId = u32;

/// Default expression attached to a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "arg")]
pub enum DefaultExpr {
    Const(Datum),
    /// `nextval('<sequence>')`
    NextVal(String),
    /// `now()`: fixed for the whole transaction.
    TransactionTimestamp,
    /// `clock_timestamp()`: changes on every evaluation.
    ClockTimestamp,
}

impl DefaultExpr {
    /// Whether the expression must be evaluated once per row.
    ///
    /// Sequences are excluded: handing out distinct values is their whole
    /// contract and does not depend on row-at-a-time evaluation.
    pub fn is_volatile(&self) -> bool {
        matches!(self, DefaultExpr::ClockTimestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    #[serde(default)]
    pub dropped: bool,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub default: Option<DefaultExpr>,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dropped: false,
            not_null: false,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn default_expr(mut self, expr: DefaultExpr) -> Self {
        self.default = Some(expr);
        self
    }

    pub fn dropped(mut self) -> Self {
        self.dropped = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDesc {
    pub id: IndexId,
    pub name: String,
    /// Physical column positions covered by the index, in key order.
    pub columns: Vec<usize>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub deferrable: bool,
}

/// Which row-level triggers are defined on a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerDesc {
    pub insert_before_row: bool,
    pub insert_after_row: bool,
    pub insert_instead_row: bool,
    pub update_before_row: bool,
    pub update_after_row: bool,
    pub delete_before_row: bool,
    pub delete_after_row: bool,
}

impl TriggerDesc {
    pub fn is_empty(&self) -> bool {
        *self == TriggerDesc::default()
    }
}

/// Local relation as seen by the apply side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: RelationId,
    pub namespace: String,
    pub name: String,
    /// Physical columns, dropped ones included.
    pub columns: Vec<ColumnDesc>,
    /// Physical positions of the columns that replication delivers.
    #[serde(default)]
    pub attmap: Vec<usize>,
    #[serde(default)]
    pub indexes: Vec<IndexDesc>,
    /// Index used to locate rows for update and delete.
    #[serde(default)]
    pub replica_identity: Option<IndexId>,
    #[serde(default)]
    pub triggers: TriggerDesc,
}

impl Relation {
    /// A relation whose attribute map covers every column.
    pub fn new(
        id: RelationId,
        namespace: impl Into<String>,
        name: impl Into<String>,
        columns: Vec<ColumnDesc>,
    ) -> Self {
        let attmap = (0..columns.len()).collect();
        Self {
            id,
            namespace: namespace.into(),
            name: name.into(),
            columns,
            attmap,
            indexes: Vec::new(),
            replica_identity: None,
            triggers: TriggerDesc::default(),
        }
    }

    pub fn with_attmap(mut self, attmap: Vec<usize>) -> Self {
        self.attmap = attmap;
        self
    }

    /// Adds a unique index; the first primary index also becomes the replica
    /// identity unless one was set.
    pub fn with_index(mut self, index: IndexDesc) -> Self {
        if index.primary && self.replica_identity.is_none() {
            self.replica_identity = Some(index.id);
        }
        self.indexes.push(index);
        self
    }

    pub fn with_replica_identity(mut self, index: IndexId) -> Self {
        self.replica_identity = Some(index);
        self
    }

    pub fn with_triggers(mut self, triggers: TriggerDesc) -> Self {
        self.triggers = triggers;
        self
    }

    /// Number of physical columns, the width of every row image.
    pub fn natts(&self) -> usize {
        self.columns.len()
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_identifier(&self.namespace), quote_identifier(&self.name))
    }

    pub fn index(&self, id: IndexId) -> Option<&IndexDesc> {
        self.indexes.iter().find(|i| i.id == id)
    }

    pub fn replica_identity_index(&self) -> Option<&IndexDesc> {
        match self.replica_identity {
            Some(id) => self.index(id),
            None => self.indexes.iter().find(|i| i.primary),
        }
    }

    pub fn in_attmap(&self, column: usize) -> bool {
        self.attmap.contains(&column)
    }

    pub fn has_constraints(&self) -> bool {
        self.columns.iter().any(|c| c.not_null && !c.dropped)
    }

    /// Whether any default that could be evaluated during apply is volatile.
    ///
    /// Only relevant when replication does not deliver every column.
    pub fn has_volatile_defaults(&self) -> bool {
        if self.attmap.len() == self.natts() {
            return false;
        }
        self.columns
            .iter()
            .filter(|c| !c.dropped)
            .filter_map(|c| c.default.as_ref())
            .any(DefaultExpr::is_volatile)
    }
}

/// Quotes an identifier when it is not a plain lower-case name.
pub fn quote_identifier(ident: &str) -> String {
    let plain = !ident.is_empty()
        && ident
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase() || c == '_')
            .unwrap_or(false)
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if plain {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}
