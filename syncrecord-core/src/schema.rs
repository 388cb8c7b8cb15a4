//! Table schemas.
//!
//! Every model declares a `&'static TableSchema` describing its table. The
//! schema is the typed identity of a table: descriptors carry it, the
//! compiler hands it to the backend, and builder methods validate field and
//! association names against it.

/// How an association relates two tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationKind {
    /// The foreign key lives on this table (`tasks.job_id -> jobs.id`).
    BelongsTo,
    /// The foreign key lives on the target table (`jobs.id <- tasks.job_id`).
    HasMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Association {
    pub name: &'static str,
    pub target: &'static str,
    pub foreign_key: &'static str,
    pub kind: AssociationKind,
}

impl Association {
    pub const fn belongs_to(
        name: &'static str,
        target: &'static str,
        foreign_key: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            foreign_key,
            kind: AssociationKind::BelongsTo,
        }
    }

    pub const fn has_many(
        name: &'static str,
        target: &'static str,
        foreign_key: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            foreign_key,
            kind: AssociationKind::HasMany,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TableSchema {
    pub name: &'static str,
    pub primary_key: &'static str,
    pub columns: &'static [&'static str],
    pub associations: &'static [Association],
}

impl TableSchema {
    pub const fn new(name: &'static str, columns: &'static [&'static str]) -> Self {
        Self {
            name,
            primary_key: "id",
            columns,
            associations: &[],
        }
    }

    pub const fn with_primary_key(self, primary_key: &'static str) -> Self {
        Self {
            primary_key,
            ..self
        }
    }

    pub const fn with_associations(self, associations: &'static [Association]) -> Self {
        Self {
            associations,
            ..self
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| *c == column)
    }

    pub fn association(&self, name: &str) -> Option<&'static Association> {
        self.associations.iter().find(|a| a.name == name)
    }

    /// Whether the table supports soft deletion through `discarded_at`.
    pub fn is_discardable(&self) -> bool {
        self.has_column(DISCARDED_AT)
    }
}

pub(crate) const CREATED_AT: &str = "created_at";
pub(crate) const UPDATED_AT: &str = "updated_at";
pub(crate) const DISCARDED_AT: &str = "discarded_at";

#[cfg(test)]
mod tests {
    use super::*;

    static JOBS: TableSchema = TableSchema::new("jobs", &["id", "title", "discarded_at"])
        .with_associations(&[Association::has_many("tasks", "tasks", "job_id")]);

    #[test]
    fn looks_up_columns_and_associations() {
        assert!(JOBS.has_column("title"));
        assert!(!JOBS.has_column("status"));
        assert_eq!(JOBS.association("tasks").map(|a| a.kind), Some(AssociationKind::HasMany));
        assert!(JOBS.association("client").is_none());
        assert!(JOBS.is_discardable());
        assert_eq!(JOBS.primary_key, "id");
    }
}
