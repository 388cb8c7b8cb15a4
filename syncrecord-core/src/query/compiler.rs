//! Query Compiler
//!
//! Turns a [`QueryDescriptor`] into the equivalent chain of calls against
//! the backend's own query builder. Calls are always issued in the same
//! order so that identical descriptors produce identical backend call
//! sequences:
//!
//! 1. conditions (canonical order)
//! 2. included associations
//! 3. ordering clauses
//! 4. limit, then offset
//! 5. `one()` for single-record queries
//!
//! The backend has no notion of projections, so `select` and `distinct`
//! compile to a client-side [`Projection`] applied to every snapshot.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::descriptor::QueryDescriptor;
use crate::backend::{BackendQuery, SyncBackend, ViewData};
use crate::error::Result;
use crate::value::Record;

/// Client-side projection for `select` / `distinct`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    fields: Option<Vec<String>>,
    distinct: bool,
}

impl Projection {
    fn for_descriptor(descriptor: &QueryDescriptor) -> Option<Self> {
        let fields = descriptor.selected_fields().map(<[String]>::to_vec);
        if fields.is_none() && !descriptor.is_distinct() {
            return None;
        }
        Some(Self {
            fields,
            distinct: descriptor.is_distinct(),
        })
    }

    fn project(&self, record: &Record) -> Record {
        match &self.fields {
            Some(fields) => fields
                .iter()
                .filter_map(|f| record.get(f).map(|v| (f.clone(), v.clone())))
                .collect(),
            None => record.clone(),
        }
    }

    /// Apply the projection to a snapshot.
    pub fn apply(&self, data: &ViewData) -> ViewData {
        match data {
            ViewData::One(row) => ViewData::One(row.as_ref().map(|r| self.project(r))),
            ViewData::Many(rows) => {
                let projected = rows.iter().map(|r| self.project(r));
                if self.distinct {
                    let mut seen = HashSet::new();
                    ViewData::Many(
                        projected
                            .filter(|r| seen.insert(serde_json::Value::Object(r.clone()).to_string()))
                            .collect(),
                    )
                } else {
                    ViewData::Many(projected.collect())
                }
            }
        }
    }
}

/// A backend query ready to be materialized.
pub struct CompiledQuery {
    pub(crate) query: Box<dyn BackendQuery>,
    pub(crate) projection: Option<Projection>,
    pub(crate) single: bool,
}

impl CompiledQuery {
    pub fn is_single(&self) -> bool {
        self.single
    }

    pub fn projection(&self) -> Option<&Projection> {
        self.projection.as_ref()
    }
}

impl fmt::Debug for CompiledQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledQuery")
            .field("projection", &self.projection)
            .field("single", &self.single)
            .finish_non_exhaustive()
    }
}

/// Compiles descriptors against a backend handle.
#[derive(Clone)]
pub struct QueryCompiler {
    backend: Arc<dyn SyncBackend>,
}

impl QueryCompiler {
    pub fn new(backend: Arc<dyn SyncBackend>) -> Self {
        Self { backend }
    }

    pub fn compile(&self, descriptor: &QueryDescriptor) -> Result<CompiledQuery> {
        let mut query = self.backend.query(descriptor.table())?;

        for condition in descriptor.conditions() {
            query = query.where_(&condition.field, condition.operator, &condition.value);
        }
        for association in descriptor.includes_list() {
            query = query.related(association);
        }
        for clause in descriptor.ordering() {
            query = query.order_by(&clause.field, clause.direction);
        }
        if let Some(limit) = descriptor.limit_value() {
            query = query.limit(limit);
        }
        if let Some(offset) = descriptor.offset_value() {
            query = query.offset(offset);
        }
        if descriptor.is_single() {
            query = query.one();
        }

        trace!(table = descriptor.table().name, "compiled query");

        Ok(CompiledQuery {
            query,
            projection: Projection::for_descriptor(descriptor),
            single: descriptor.is_single(),
        })
    }
}

impl fmt::Debug for QueryCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCompiler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, View};
    use crate::query::{Direction, Operator};
    use crate::schema::{Association, TableSchema};
    use crate::ttl::Ttl;
    use crate::value::ConditionValue;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    static TASKS: TableSchema =
        TableSchema::new("tasks", &["id", "title", "status", "job_id", "position"])
            .with_associations(&[Association::belongs_to("job", "jobs", "job_id")]);

    /// Backend that records every builder call it receives.
    #[derive(Default)]
    struct RecordingBackend {
        calls: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingQuery {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingQuery {
        fn log(self: Box<Self>, call: String) -> Box<dyn BackendQuery> {
            self.calls.lock().push(call);
            self
        }
    }

    impl BackendQuery for RecordingQuery {
        fn where_(
            self: Box<Self>,
            field: &str,
            op: Operator,
            value: &ConditionValue,
        ) -> Box<dyn BackendQuery> {
            self.log(format!("where({field} {op} {value})"))
        }

        fn related(self: Box<Self>, association: &str) -> Box<dyn BackendQuery> {
            self.log(format!("related({association})"))
        }

        fn order_by(self: Box<Self>, field: &str, direction: Direction) -> Box<dyn BackendQuery> {
            self.log(format!("orderBy({field}, {})", direction.as_str()))
        }

        fn limit(self: Box<Self>, n: u64) -> Box<dyn BackendQuery> {
            self.log(format!("limit({n})"))
        }

        fn offset(self: Box<Self>, n: u64) -> Box<dyn BackendQuery> {
            self.log(format!("offset({n})"))
        }

        fn one(self: Box<Self>) -> Box<dyn BackendQuery> {
            self.log("one()".to_string())
        }

        fn materialize(self: Box<Self>, _ttl: Ttl) -> std::result::Result<Arc<dyn View>, BackendError> {
            Err(BackendError::Other("not materializable".into()))
        }
    }

    #[async_trait]
    impl SyncBackend for RecordingBackend {
        fn query(
            &self,
            table: &'static TableSchema,
        ) -> std::result::Result<Box<dyn BackendQuery>, BackendError> {
            self.calls.lock().push(format!("query({})", table.name));
            Ok(Box::new(RecordingQuery {
                calls: self.calls.clone(),
            }))
        }

        async fn insert(&self, _: &'static TableSchema, _: Record) -> std::result::Result<(), BackendError> {
            Ok(())
        }

        async fn update(&self, _: &'static TableSchema, _: Record) -> std::result::Result<(), BackendError> {
            Ok(())
        }
    }

    fn compile_calls(descriptor: &QueryDescriptor) -> Vec<String> {
        let backend = Arc::new(RecordingBackend::default());
        let compiler = QueryCompiler::new(backend.clone());
        compiler.compile(descriptor).unwrap();
        let calls = backend.calls.lock().clone();
        calls
    }

    #[test]
    fn emits_calls_in_canonical_order() {
        let d = QueryDescriptor::new(&TASKS)
            .limit(10)
            .order_by("position", Direction::Desc)
            .unwrap()
            .includes("job")
            .unwrap()
            .where_eq("status", 1)
            .unwrap()
            .offset(5)
            .one();

        assert_eq!(
            compile_calls(&d),
            vec![
                "query(tasks)",
                "where(status = 1)",
                "related(job)",
                "orderBy(position, desc)",
                "limit(10)",
                "offset(5)",
                "one()",
            ]
        );
    }

    #[test]
    fn equivalent_descriptors_compile_identically() {
        let a = QueryDescriptor::new(&TASKS)
            .where_eq("status", 1)
            .unwrap()
            .where_("job_id", Operator::In, vec!["J2", "J1"])
            .unwrap();
        let b = QueryDescriptor::new(&TASKS)
            .where_("job_id", Operator::In, vec!["J1", "J2"])
            .unwrap()
            .where_eq("status", 1)
            .unwrap();

        let calls = compile_calls(&a);
        assert_eq!(calls, compile_calls(&b));
        assert_eq!(calls[1], "where(job_id IN [\"J1\", \"J2\"])");
    }

    #[test]
    fn projection_only_when_requested() {
        let backend = Arc::new(RecordingBackend::default());
        let compiler = QueryCompiler::new(backend);

        let plain = compiler.compile(&QueryDescriptor::new(&TASKS)).unwrap();
        assert!(plain.projection().is_none());

        let selected = compiler
            .compile(&QueryDescriptor::new(&TASKS).select(&["status"]).unwrap().distinct())
            .unwrap();
        assert!(selected.projection().is_some());
    }

    #[test]
    fn projection_selects_and_dedups() {
        let projection = Projection {
            fields: Some(vec!["status".to_string()]),
            distinct: true,
        };
        let rows: Vec<Record> = [
            json!({"id": "a", "status": 1}),
            json!({"id": "b", "status": 1}),
            json!({"id": "c", "status": 2}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect();

        let projected = projection.apply(&ViewData::Many(rows));
        let ViewData::Many(rows) = projected else {
            panic!("expected a collection");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("status"), Some(&json!(1)));
        assert!(rows[0].get("id").is_none());
    }
}
