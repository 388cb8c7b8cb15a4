//! Query Descriptor
//!
//! A [`QueryDescriptor`] is an immutable description of a query: the table,
//! the conjunction of conditions, ordering, paging, included associations
//! and projection flags. Every builder method borrows the receiver and
//! returns a new descriptor, so a descriptor can be shared, stored as a base
//! query, and branched freely.
//!
//! Descriptors are kept in canonical form as they are built:
//!
//! - conditions are sorted by their canonical key and deduplicated;
//! - includes and selected fields are sorted sets;
//! - ordering keeps call order, ignoring a second clause for the same field;
//! - the last `limit`/`offset` wins.
//!
//! Because of this, two descriptors built through different call orders
//! with the same meaning compare equal, fingerprint identically and compile
//! to identical backend call sequences.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::fingerprint::Fingerprint;
use crate::error::{RecordError, Result};
use crate::schema::TableSchema;
use crate::value::{ConditionValue, Scalar};

/// Comparison operator of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Like,
    ILike,
}

impl Operator {
    /// The backend's spelling of the operator.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::IsNull => "IS",
            Operator::IsNotNull => "IS NOT",
            Operator::Like => "LIKE",
            Operator::ILike => "ILIKE",
        }
    }

    fn takes_list(&self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }

    fn takes_null(&self) -> bool {
        matches!(self, Operator::IsNull | Operator::IsNotNull)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }
}

/// One predicate of the conjunction.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: ConditionValue,
}

impl Condition {
    /// Canonical key, used for ordering and fingerprinting.
    pub fn canonical(&self) -> String {
        format!(
            "{} {} {}",
            self.field,
            self.operator.as_str(),
            self.value.canonical()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderClause {
    pub field: String,
    pub direction: Direction,
}

/// An immutable query description.
#[derive(Clone)]
pub struct QueryDescriptor {
    table: &'static TableSchema,
    conditions: SmallVec<[Condition; 4]>,
    ordering: SmallVec<[OrderClause; 2]>,
    limit: Option<u64>,
    offset: Option<u64>,
    includes: SmallVec<[String; 2]>,
    select: Option<Vec<String>>,
    distinct: bool,
    single: bool,
}

impl QueryDescriptor {
    /// An unfiltered query over `table`.
    pub fn new(table: &'static TableSchema) -> Self {
        Self {
            table,
            conditions: SmallVec::new(),
            ordering: SmallVec::new(),
            limit: None,
            offset: None,
            includes: SmallVec::new(),
            select: None,
            distinct: false,
            single: false,
        }
    }

    /// The queried table.
    pub fn table(&self) -> &'static TableSchema {
        self.table
    }

    /// Conditions in canonical order.
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Order clauses in call order.
    pub fn ordering(&self) -> &[OrderClause] {
        &self.ordering
    }

    /// The limit, if one was set.
    pub fn limit_value(&self) -> Option<u64> {
        self.limit
    }

    /// The offset, if one was set.
    pub fn offset_value(&self) -> Option<u64> {
        self.offset
    }

    /// Included associations, sorted.
    pub fn includes_list(&self) -> &[String] {
        &self.includes
    }

    /// Selected fields, sorted; `None` selects every column.
    pub fn selected_fields(&self) -> Option<&[String]> {
        self.select.as_deref()
    }

    /// Whether duplicate records are removed client-side.
    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    /// Whether the query yields a single record rather than a collection.
    pub fn is_single(&self) -> bool {
        self.single
    }

    /// The canonical key of this descriptor. Equal meaning gives an equal fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }

    /// Add a condition.
    pub fn where_(
        &self,
        field: &str,
        operator: Operator,
        value: impl Into<ConditionValue>,
    ) -> Result<Self> {
        let value = value.into();
        self.check_field(field, "where")?;
        check_operand(field, operator, &value)?;

        let condition = Condition {
            field: field.to_string(),
            operator,
            value: value.normalized(),
        };
        let key = condition.canonical();

        let mut next = self.clone();
        match next
            .conditions
            .binary_search_by(|existing| existing.canonical().cmp(&key))
        {
            Ok(_) => {}
            Err(pos) => next.conditions.insert(pos, condition),
        }
        Ok(next)
    }

    /// Hash-style equality: lists become `IN`, null becomes `IS NULL`,
    /// anything else `=`.
    pub fn where_eq(&self, field: &str, value: impl Into<ConditionValue>) -> Result<Self> {
        let value = value.into();
        let operator = if value.is_list() {
            Operator::In
        } else if value.is_null() {
            Operator::IsNull
        } else {
            Operator::Eq
        };
        self.where_(field, operator, value)
    }

    /// Apply [`where_eq`](Self::where_eq) for every pair.
    pub fn where_all<'a, I>(&self, conditions: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, ConditionValue)>,
    {
        conditions
            .into_iter()
            .try_fold(self.clone(), |acc, (field, value)| acc.where_eq(field, value))
    }

    /// Require `field` to be null.
    pub fn where_null(&self, field: &str) -> Result<Self> {
        self.where_(field, Operator::IsNull, Scalar::Null)
    }

    /// Require `field` to be non-null.
    pub fn where_not_null(&self, field: &str) -> Result<Self> {
        self.where_(field, Operator::IsNotNull, Scalar::Null)
    }

    /// Append an order clause. A field that is already ordered keeps its first clause.
    pub fn order_by(&self, field: &str, direction: Direction) -> Result<Self> {
        self.check_field(field, "order_by")?;
        let mut next = self.clone();
        if !next.ordering.iter().any(|clause| clause.field == field) {
            next.ordering.push(OrderClause {
                field: field.to_string(),
                direction,
            });
        }
        Ok(next)
    }

    /// Cap the number of records. The last call wins.
    pub fn limit(&self, n: u64) -> Self {
        let mut next = self.clone();
        next.limit = Some(n);
        next
    }

    /// Skip the first `n` records. The last call wins.
    pub fn offset(&self, n: u64) -> Self {
        let mut next = self.clone();
        next.offset = Some(n);
        next
    }

    /// Include an association's rows with each record.
    pub fn includes(&self, association: &str) -> Result<Self> {
        if self.table.association(association).is_none() {
            return Err(RecordError::invalid_query(format!(
                "includes: {} has no association named {association:?}",
                self.table.name
            )));
        }
        let mut next = self.clone();
        if let Err(pos) = next.includes.binary_search_by(|a| a.as_str().cmp(association)) {
            next.includes.insert(pos, association.to_string());
        }
        Ok(next)
    }

    /// Restrict records to the given fields.
    pub fn select(&self, fields: &[&str]) -> Result<Self> {
        for field in fields {
            self.check_field(field, "select")?;
        }
        let mut next = self.clone();
        let mut selected = next.select.take().unwrap_or_default();
        selected.extend(fields.iter().map(|f| f.to_string()));
        selected.sort();
        selected.dedup();
        next.select = Some(selected);
        Ok(next)
    }

    /// Drop duplicate records.
    pub fn distinct(&self) -> Self {
        let mut next = self.clone();
        next.distinct = true;
        next
    }

    /// Yield the first matching record instead of a collection.
    pub fn one(&self) -> Self {
        let mut next = self.clone();
        next.single = true;
        next
    }

    /// The error reported when a required record is missing. Names the
    /// primary key value when the query is a lookup by id.
    pub fn not_found(&self) -> RecordError {
        let id = self
            .conditions
            .iter()
            .find(|c| c.field == self.table.primary_key && c.operator == Operator::Eq)
            .and_then(|c| c.value.as_scalar())
            .map(|scalar| match scalar {
                Scalar::Text(text) => text.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| self.fingerprint().to_string());
        RecordError::NotFound {
            table: self.table.name,
            id,
        }
    }

    fn check_field(&self, field: &str, method: &str) -> Result<()> {
        if self.table.has_column(field) {
            Ok(())
        } else {
            Err(RecordError::invalid_query(format!(
                "{method}: unknown field {field:?} on {}",
                self.table.name
            )))
        }
    }
}

fn check_operand(field: &str, operator: Operator, value: &ConditionValue) -> Result<()> {
    let problem = if operator.takes_list() {
        (!value.is_list()).then_some("requires a list value")
    } else if operator.takes_null() {
        (!value.is_null()).then_some("takes no value")
    } else {
        match value {
            ConditionValue::Many(_) => Some("requires a single value"),
            ConditionValue::One(Scalar::Null) => Some("cannot compare with null, use IS NULL"),
            ConditionValue::One(Scalar::Text(_)) => None,
            ConditionValue::One(_) if matches!(operator, Operator::Like | Operator::ILike) => {
                Some("requires a text pattern")
            }
            ConditionValue::One(_) => None,
        }
    };

    match problem {
        Some(problem) => Err(RecordError::invalid_query(format!(
            "where {field:?} {operator}: operator {problem}"
        ))),
        None => Ok(()),
    }
}

impl PartialEq for QueryDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

impl Eq for QueryDescriptor {}

impl Hash for QueryDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint().hash(state);
    }
}

impl fmt::Debug for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDescriptor")
            .field("table", &self.table.name)
            .field("conditions", &self.conditions)
            .field("ordering", &self.ordering)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("includes", &self.includes)
            .field("select", &self.select)
            .field("distinct", &self.distinct)
            .field("single", &self.single)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Association;

    static TASKS: TableSchema = TableSchema::new(
        "tasks",
        &["id", "title", "status", "job_id", "position", "discarded_at"],
    )
    .with_associations(&[Association::belongs_to("job", "jobs", "job_id")]);

    fn base() -> QueryDescriptor {
        QueryDescriptor::new(&TASKS)
    }

    #[test]
    fn builder_methods_do_not_mutate_receiver() {
        let original = base().where_eq("status", 1).unwrap();
        let before = original.fingerprint();

        let _ = original.where_eq("job_id", "J1").unwrap();
        let _ = original.order_by("position", Direction::Desc).unwrap();
        let _ = original.limit(5).offset(10).distinct().one();
        let _ = original.includes("job").unwrap();
        let _ = original.select(&["id"]).unwrap();

        assert_eq!(original.fingerprint(), before);
        assert_eq!(original.conditions().len(), 1);
        assert!(original.limit_value().is_none());
        assert!(!original.is_single());
    }

    #[test]
    fn where_order_does_not_matter() {
        let a = base()
            .where_eq("status", 1)
            .unwrap()
            .where_eq("job_id", "J1")
            .unwrap()
            .limit(10);
        let b = base()
            .limit(10)
            .where_eq("job_id", "J1")
            .unwrap()
            .where_eq("status", 1)
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(a.conditions(), b.conditions());
    }

    #[test]
    fn duplicate_conditions_collapse() {
        let d = base()
            .where_eq("status", 1)
            .unwrap()
            .where_eq("status", 1)
            .unwrap();
        assert_eq!(d.conditions().len(), 1);
    }

    #[test]
    fn where_eq_picks_operator_from_value() {
        let d = base()
            .where_eq("status", vec![1, 2])
            .unwrap()
            .where_eq("discarded_at", None::<i64>)
            .unwrap()
            .where_eq("title", "x")
            .unwrap();

        let ops: Vec<_> = d.conditions().iter().map(|c| (c.field.as_str(), c.operator)).collect();
        assert_eq!(
            ops,
            vec![
                ("discarded_at", Operator::IsNull),
                ("status", Operator::In),
                ("title", Operator::Eq),
            ]
        );
    }

    #[test]
    fn unknown_fields_fail_fast() {
        let err = base().where_eq("nope", 1).unwrap_err();
        assert!(matches!(err, RecordError::InvalidQuery(_)));
        assert!(base().order_by("nope", Direction::Asc).is_err());
        assert!(base().select(&["id", "nope"]).is_err());
        assert!(base().includes("client").is_err());
    }

    #[test]
    fn operand_shapes_are_validated() {
        assert!(base().where_("status", Operator::In, 1).is_err());
        assert!(base().where_("status", Operator::Eq, vec![1]).is_err());
        assert!(base().where_("status", Operator::Eq, Scalar::Null).is_err());
        assert!(base().where_("status", Operator::IsNull, 1).is_err());
        assert!(base().where_("title", Operator::Like, 3).is_err());
        assert!(base().where_("title", Operator::Like, "%a%").is_ok());
        assert!(base().where_not_null("discarded_at").is_ok());
    }

    #[test]
    fn ordering_keeps_call_order_and_first_clause_per_field() {
        let d = base()
            .order_by("status", Direction::Desc)
            .unwrap()
            .order_by("position", Direction::Asc)
            .unwrap()
            .order_by("status", Direction::Asc)
            .unwrap();

        let fields: Vec<_> = d
            .ordering()
            .iter()
            .map(|o| (o.field.as_str(), o.direction))
            .collect();
        assert_eq!(fields, vec![("status", Direction::Desc), ("position", Direction::Asc)]);
    }

    #[test]
    fn last_limit_and_offset_win() {
        let d = base().limit(5).offset(1).limit(20).offset(3);
        assert_eq!(d.limit_value(), Some(20));
        assert_eq!(d.offset_value(), Some(3));
    }

    #[test]
    fn select_and_includes_are_sets() {
        let d = base()
            .select(&["title", "id"])
            .unwrap()
            .select(&["id"])
            .unwrap()
            .includes("job")
            .unwrap()
            .includes("job")
            .unwrap();
        assert_eq!(d.selected_fields(), Some(&["id".to_string(), "title".to_string()][..]));
        assert_eq!(d.includes_list(), &["job".to_string()]);
    }

    #[test]
    fn not_found_names_the_looked_up_id() {
        match base().where_eq("id", "T9").unwrap().not_found() {
            RecordError::NotFound { table, id } => {
                assert_eq!(table, "tasks");
                assert_eq!(id, "T9");
            }
            other => panic!("unexpected {other:?}"),
        }

        let by_status = base().where_eq("status", 1).unwrap();
        match by_status.not_found() {
            RecordError::NotFound { id, .. } => assert_eq!(id, by_status.fingerprint().to_string()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
