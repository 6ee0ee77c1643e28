//! Statement builder for partition DDL.
//!
//! Identifiers (schema, table, index and constraint names) only enter SQL
//! through [`Ident`], which accepts lower-case identifiers generated from the
//! window suffix rule and renders them quoted. Range bounds are rendered from
//! typed timestamps because PostgreSQL utility statements cannot take bind
//! parameters. Everything else a caller supplies travels as a bound parameter
//! in the repository implementations.

use std::fmt;

use crate::db::repository::{ErrorContext, RepositoryError, RepositoryResult};
use crate::models::{format_timestamp, ConstraintState, TimeRange};

/// Name of the partitioned parent table.
pub const PARENT_TABLE: &str = "orders";
/// Range partition key.
pub const ORDERING_KEY: &str = "order_time";
/// Maximum identifier length accepted by PostgreSQL.
pub const MAX_IDENT_LEN: usize = 63;

/// A trusted SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(String);

impl Ident {
    /// Validate an identifier: `[a-z_][a-z0-9_]*`, at most 63 bytes.
    pub fn new(raw: impl Into<String>) -> RepositoryResult<Self> {
        let raw = raw.into();
        let mut chars = raw.chars();
        let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
        let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !first_ok || !rest_ok || raw.len() > MAX_IDENT_LEN {
            return Err(RepositoryError::configuration_with_context(
                format!("'{}' is not an accepted identifier", raw),
                ErrorContext::new("validate_identifier").with_entity_id(&raw),
            ));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

/// `schema.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub schema: Ident,
    pub name: Ident,
}

impl QualifiedName {
    pub fn new(schema: Ident, name: Ident) -> Self {
        Self { schema, name }
    }

    /// Unquoted `schema.table`, used for log lines and map keys.
    pub fn key(&self) -> String {
        format!("{}.{}", self.schema.as_str(), self.name.as_str())
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Naming rules for the parent, its children and their dependent objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNaming {
    schema: Ident,
}

impl PartitionNaming {
    pub fn new(schema: Ident) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Ident {
        &self.schema
    }

    pub fn parent(&self) -> QualifiedName {
        QualifiedName::new(self.schema.clone(), Ident(PARENT_TABLE.to_string()))
    }

    /// `orders_<suffix>`.
    pub fn child_table(suffix: &str) -> String {
        format!("{}_{}", PARENT_TABLE, suffix)
    }

    pub fn child(&self, suffix: &str) -> RepositoryResult<QualifiedName> {
        self.relation(&Self::child_table(suffix))
    }

    /// Any relation in the managed schema.
    pub fn relation(&self, name: &str) -> RepositoryResult<QualifiedName> {
        Ok(QualifiedName::new(self.schema.clone(), Ident::new(name)?))
    }

    /// `orders_<suffix>_range`.
    pub fn range_constraint(suffix: &str) -> RepositoryResult<Ident> {
        Ident::new(format!("{}_{}_range", PARENT_TABLE, suffix))
    }

    /// `idx_orders_<suffix>_<tag>`.
    pub fn index(suffix: &str, tag: &str) -> RepositoryResult<Ident> {
        Ident::new(format!("idx_{}_{}_{}", PARENT_TABLE, suffix, tag))
    }
}

/// `'2025-01-01 00:00:00'::timestamp`.
pub fn timestamp_literal(ts: &chrono::NaiveDateTime) -> String {
    format!("'{}'::timestamp", format_timestamp(ts))
}

/// Boolean expression encoding `[lo, hi)` on the ordering key.
pub fn range_predicate(range: &TimeRange) -> String {
    format!(
        "({key} >= {lo} AND {key} < {hi})",
        key = ORDERING_KEY,
        lo = timestamp_literal(&range.lo),
        hi = timestamp_literal(&range.hi)
    )
}

/// What an index is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKey {
    Column(&'static str),
    /// `EXTRACT(EPOCH FROM order_time)`.
    EpochOfOrderTime,
}

/// Partial index predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPredicate {
    StatusEquals(&'static str),
    EpochModulo { modulus: u32, remainder: u32 },
}

/// One index on a child partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: Ident,
    pub table: QualifiedName,
    pub key: IndexKey,
    pub predicate: Option<IndexPredicate>,
}

impl IndexSpec {
    pub fn create_sql(&self) -> String {
        let key = match self.key {
            IndexKey::Column(column) => column.to_string(),
            IndexKey::EpochOfOrderTime => format!("(EXTRACT(EPOCH FROM {}))", ORDERING_KEY),
        };
        let mut sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            self.name, self.table, key
        );
        match self.predicate {
            Some(IndexPredicate::StatusEquals(status)) => {
                sql.push_str(&format!(" WHERE status = '{}'", status));
            }
            Some(IndexPredicate::EpochModulo { modulus, remainder }) => {
                sql.push_str(&format!(
                    " WHERE (EXTRACT(EPOCH FROM {})::BIGINT % {}) = {}",
                    ORDERING_KEY, modulus, remainder
                ));
            }
            None => {}
        }
        sql
    }
}

/// The index set every child carries, plus `dummy_count` mutually redundant
/// partial indexes that only exist to inflate lock counts in the lab.
pub fn child_index_set(
    table: &QualifiedName,
    suffix: &str,
    dummy_count: u32,
) -> RepositoryResult<Vec<IndexSpec>> {
    let mut specs = vec![
        IndexSpec {
            name: PartitionNaming::index(suffix, "order_time")?,
            table: table.clone(),
            key: IndexKey::Column(ORDERING_KEY),
            predicate: None,
        },
        IndexSpec {
            name: PartitionNaming::index(suffix, "customer")?,
            table: table.clone(),
            key: IndexKey::Column("customer_id"),
            predicate: None,
        },
        IndexSpec {
            name: PartitionNaming::index(suffix, "store")?,
            table: table.clone(),
            key: IndexKey::Column("store_id"),
            predicate: None,
        },
        IndexSpec {
            name: PartitionNaming::index(suffix, "status_new")?,
            table: table.clone(),
            key: IndexKey::Column(ORDERING_KEY),
            predicate: Some(IndexPredicate::StatusEquals("new")),
        },
    ];
    let modulus = dummy_count.max(1);
    for i in 0..dummy_count {
        specs.push(IndexSpec {
            name: PartitionNaming::index(suffix, &format!("dummy_{}", i))?,
            table: table.clone(),
            key: IndexKey::EpochOfOrderTime,
            predicate: Some(IndexPredicate::EpochModulo {
                modulus,
                remainder: i % modulus,
            }),
        });
    }
    Ok(specs)
}

/// DDL statement rendering.
pub mod ddl {
    use super::*;

    pub fn set_lock_timeout(timeout_ms: u64) -> String {
        format!("SET LOCAL lock_timeout = '{}ms'", timeout_ms)
    }

    pub fn create_schema(schema: &Ident) -> String {
        format!("CREATE SCHEMA IF NOT EXISTS {}", schema)
    }

    pub fn drop_parent(parent: &QualifiedName) -> String {
        format!("DROP TABLE IF EXISTS {} CASCADE", parent)
    }

    pub fn create_parent(parent: &QualifiedName) -> String {
        format!(
            "CREATE TABLE {parent} (\
             order_id UUID NOT NULL, \
             customer_id INT NOT NULL, \
             store_id INT NOT NULL, \
             status TEXT NOT NULL, \
             amount NUMERIC(12,2) NOT NULL, \
             order_time TIMESTAMP WITHOUT TIME ZONE NOT NULL, \
             updated_at TIMESTAMP WITHOUT TIME ZONE NOT NULL DEFAULT now(), \
             PRIMARY KEY (order_id, order_time)\
             ) PARTITION BY RANGE ({key})",
            parent = parent,
            key = ORDERING_KEY
        )
    }

    pub fn create_child(parent: &QualifiedName, child: &QualifiedName, range: &TimeRange) -> String {
        format!(
            "CREATE TABLE {} PARTITION OF {} FOR VALUES FROM ({}) TO ({})",
            child,
            parent,
            timestamp_literal(&range.lo),
            timestamp_literal(&range.hi)
        )
    }

    pub fn add_range_constraint(
        table: &QualifiedName,
        name: &Ident,
        range: &TimeRange,
        state: ConstraintState,
    ) -> String {
        let mut sql = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} CHECK {}",
            table,
            name,
            range_predicate(range)
        );
        if state == ConstraintState::NotValid {
            sql.push_str(" NOT VALID");
        }
        sql
    }

    pub fn drop_constraint(table: &QualifiedName, name: &Ident) -> String {
        format!("ALTER TABLE {} DROP CONSTRAINT {}", table, name)
    }

    pub fn validate_constraint(table: &QualifiedName, name: &Ident) -> String {
        format!("ALTER TABLE {} VALIDATE CONSTRAINT {}", table, name)
    }

    /// Structural clone; a plain CREATE so a concurrent clone of the same
    /// name fails on the catalog instead of sharing the table.
    pub fn clone_like(source: &QualifiedName, target: &QualifiedName) -> String {
        format!("CREATE TABLE {} (LIKE {} INCLUDING ALL)", target, source)
    }

    pub fn copy_rows(from: &QualifiedName, to: &QualifiedName) -> String {
        format!("INSERT INTO {} SELECT * FROM {}", to, from)
    }

    pub fn attach(parent: &QualifiedName, child: &QualifiedName, range: &TimeRange) -> String {
        format!(
            "ALTER TABLE {} ATTACH PARTITION {} FOR VALUES FROM ({}) TO ({})",
            parent,
            child,
            timestamp_literal(&range.lo),
            timestamp_literal(&range.hi)
        )
    }

    pub fn detach(parent: &QualifiedName, child: &QualifiedName) -> String {
        format!("ALTER TABLE {} DETACH PARTITION {}", parent, child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn naming() -> PartitionNaming {
        PartitionNaming::new(Ident::new("lab").unwrap())
    }

    fn day_range() -> TimeRange {
        let lo = NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        TimeRange::new(lo, lo + chrono::Duration::days(1)).unwrap()
    }

    #[test]
    fn identifiers_reject_injection() {
        assert!(Ident::new("public").is_ok());
        assert!(Ident::new("orders_2025_01_01").is_ok());
        assert!(Ident::new("public; DROP TABLE x").is_err());
        assert!(Ident::new("Orders").is_err());
        assert!(Ident::new("").is_err());
        assert!(Ident::new("1abc").is_err());
        assert!(Ident::new("a".repeat(64)).is_err());
    }

    #[test]
    fn child_ddl_renders_typed_bounds() {
        let n = naming();
        let child = n.child("2025_01_01").unwrap();
        let sql = ddl::create_child(&n.parent(), &child, &day_range());
        assert_eq!(
            sql,
            "CREATE TABLE \"lab\".\"orders_2025_01_01\" PARTITION OF \"lab\".\"orders\" \
             FOR VALUES FROM ('2025-01-01 00:00:00'::timestamp) TO ('2025-01-02 00:00:00'::timestamp)"
        );
    }

    #[test]
    fn not_valid_suffix_only_for_unchecked_constraints() {
        let n = naming();
        let child = n.child("wk_2025_01_01").unwrap();
        let name = PartitionNaming::range_constraint("wk_2025_01_01").unwrap();
        let unchecked =
            ddl::add_range_constraint(&child, &name, &day_range(), ConstraintState::NotValid);
        assert!(unchecked.ends_with(" NOT VALID"));
        let checked = ddl::add_range_constraint(&child, &name, &day_range(), ConstraintState::Valid);
        assert!(!checked.contains("NOT VALID"));
        assert_eq!(
            TimeRange::from_quoted_bounds(&checked),
            Some(day_range())
        );
    }

    #[test]
    fn index_set_has_fixed_and_dummy_indexes() {
        let n = naming();
        let child = n.child("2025_01_01").unwrap();
        let specs = child_index_set(&child, "2025_01_01", 3).unwrap();
        assert_eq!(specs.len(), 7);
        assert_eq!(specs[3].name.as_str(), "idx_orders_2025_01_01_status_new");
        assert!(specs[3].create_sql().ends_with("WHERE status = 'new'"));
        assert!(specs[6]
            .create_sql()
            .ends_with("WHERE (EXTRACT(EPOCH FROM order_time)::BIGINT % 3) = 2"));
    }

    #[test]
    fn zero_dummy_indexes() {
        let n = naming();
        let child = n.child("2025_01_01").unwrap();
        assert_eq!(child_index_set(&child, "2025_01_01", 0).unwrap().len(), 4);
    }
}
