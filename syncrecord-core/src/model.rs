//! Models, factories and relations.
//!
//! A [`Model`] is a serde type bound to a static [`TableSchema`]. The
//! client hands out a [`ModelFactory`] per model with ActiveRecord-style
//! operations:
//!
//! - promise style (`async fn`, typed errors): `find`, `find_by`,
//!   `create`, `update`, `discard`, and `Relation::load` / `first` / `count`;
//! - reactive style (live state, errors in state): `observe_find`,
//!   `observe_find_by`, and `Relation::observe`.
//!
//! `find` of a missing id is a `NotFound` error. Queries that match nothing
//! (`where_`, `all`, `find_by`) return empty results, never an error.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::client::RecordClient;
use crate::error::{RecordError, Result, ValidationErrors};
use crate::query::{Direction, Operator, QueryDescriptor, Scope, ScopeRegistry};
use crate::reactive::{QueryOptions, ReactiveQuery, Snapshot};
use crate::schema::{TableSchema, CREATED_AT, DISCARDED_AT, UPDATED_AT};
use crate::ttl::Ttl;
use crate::value::{ConditionValue, Record};

/// A record type stored in one backend table.
///
/// ```rust,ignore
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Task { id: String, title: String, status: i64 }
///
/// impl Model for Task {
///     const SCHEMA: &'static TableSchema =
///         &TableSchema::new("tasks", &["id", "title", "status"]);
/// }
/// ```
pub trait Model: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const SCHEMA: &'static TableSchema;

    /// Named scopes available through `ModelFactory::scope`.
    fn scopes() -> &'static [Scope] {
        &[]
    }

    /// Checked before every `create` and `update`.
    fn validate(&self) -> std::result::Result<(), ValidationErrors> {
        Ok(())
    }
}

pub(crate) fn decode<M: DeserializeOwned>(record: &Record) -> Result<M> {
    Ok(serde_json::from_value(Value::Object(record.clone()))?)
}

fn encode<M: Serialize>(model: &M) -> Result<Record> {
    match serde_json::to_value(model)? {
        Value::Object(record) => Ok(record),
        other => Err(RecordError::Unknown(format!(
            "model serialized to {other}, not an object"
        ))),
    }
}

fn now_millis() -> Value {
    Value::from(chrono::Utc::now().timestamp_millis())
}

/// Split `attributes` into a record, rejecting non-objects and unknown
/// columns.
fn attributes_for(schema: &TableSchema, attributes: Value) -> Result<Record> {
    let Value::Object(record) = attributes else {
        return Err(ValidationErrors::new()
            .with("base", "attributes must be an object")
            .into());
    };
    let mut errors = ValidationErrors::new();
    for field in record.keys().filter(|k| !schema.has_column(k)) {
        errors.add(field.clone(), format!("is not a column of {}", schema.name));
    }
    errors.into_result()?;
    Ok(record)
}

fn decode_attributes<M: Model>(record: &Record) -> Result<M> {
    decode(record).map_err(|error| match error {
        RecordError::Unknown(message) => ValidationErrors::new().with("base", message).into(),
        other => other,
    })
}

/// ActiveRecord-style entry point for model `M`.
pub struct ModelFactory<M> {
    client: RecordClient,
    _model: PhantomData<fn() -> M>,
}

impl<M> Clone for ModelFactory<M> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            _model: PhantomData,
        }
    }
}

impl<M: Model> ModelFactory<M> {
    pub(crate) fn new(client: RecordClient) -> Self {
        Self {
            client,
            _model: PhantomData,
        }
    }

    pub fn schema(&self) -> &'static TableSchema {
        M::SCHEMA
    }

    pub fn scopes(&self) -> ScopeRegistry {
        ScopeRegistry::new(M::SCHEMA, M::scopes())
    }

    /// A relation over `descriptor`, which must target `M`'s table.
    pub fn relation(&self, descriptor: QueryDescriptor) -> Result<Relation<M>> {
        if descriptor.table() != M::SCHEMA {
            return Err(RecordError::invalid_query(format!(
                "descriptor targets {}, not {}",
                descriptor.table().name,
                M::SCHEMA.name
            )));
        }
        Ok(Relation::new(self.client.clone(), descriptor))
    }

    /// Every record of the table.
    pub fn all(&self) -> Relation<M> {
        Relation::new(self.client.clone(), QueryDescriptor::new(M::SCHEMA))
    }

    /// Records matching one condition.
    pub fn where_(
        &self,
        field: &str,
        op: Operator,
        value: impl Into<ConditionValue>,
    ) -> Result<Relation<M>> {
        self.all().where_(field, op, value)
    }

    /// Records where `field` equals `value` (lists become `IN`).
    pub fn where_eq(&self, field: &str, value: impl Into<ConditionValue>) -> Result<Relation<M>> {
        self.all().where_eq(field, value)
    }

    /// Records matching every `(field, value)` pair.
    pub fn where_all<'a, I>(&self, conditions: I) -> Result<Relation<M>>
    where
        I: IntoIterator<Item = (&'a str, ConditionValue)>,
    {
        self.all().where_all(conditions)
    }

    /// Records in the named scope.
    pub fn scope(&self, name: &str) -> Result<Relation<M>> {
        self.all().scope(name)
    }

    fn find_descriptor(&self, id: &str) -> Result<QueryDescriptor> {
        Ok(QueryDescriptor::new(M::SCHEMA)
            .where_eq(M::SCHEMA.primary_key, id)?
            .one())
    }

    /// The record with primary key `id`, or `NotFound`.
    pub async fn find(&self, id: &str) -> Result<M> {
        let descriptor = self.find_descriptor(id)?;
        let data = self.client.fetch(&descriptor).await?;
        Option::<M>::from_view(&data)?.ok_or_else(|| descriptor.not_found())
    }

    /// The first record matching every condition, if any.
    pub async fn find_by<'a, I>(&self, conditions: I) -> Result<Option<M>>
    where
        I: IntoIterator<Item = (&'a str, ConditionValue)>,
    {
        self.where_all(conditions)?.first().await
    }

    /// Live lookup by id. A missing record is reported as `NotFound` in
    /// the query's error state.
    pub fn observe_find(&self, id: &str) -> Result<ReactiveQuery<Option<M>>> {
        let descriptor = self.find_descriptor(id)?;
        Ok(self.client.observe(
            move || Ok(descriptor.clone()),
            QueryOptions::new().required(true),
        ))
    }

    /// Live lookup by conditions. A missing record is `None`, not an error.
    pub fn observe_find_by<'a, I>(&self, conditions: I) -> Result<ReactiveQuery<Option<M>>>
    where
        I: IntoIterator<Item = (&'a str, ConditionValue)>,
    {
        Ok(self.where_all(conditions)?.observe_first())
    }

    /// Insert a new record.
    ///
    /// Assigns a UUID primary key when none is given and stamps
    /// `created_at` / `updated_at` (epoch milliseconds) when the table has
    /// those columns.
    pub async fn create(&self, attributes: Value) -> Result<M> {
        let schema = M::SCHEMA;
        let mut record = attributes_for(schema, attributes)?;

        let has_id = record
            .get(schema.primary_key)
            .map(|id| !id.is_null())
            .unwrap_or(false);
        if !has_id {
            record.insert(
                schema.primary_key.to_string(),
                Value::String(Uuid::new_v4().to_string()),
            );
        }
        let now = now_millis();
        for column in [CREATED_AT, UPDATED_AT] {
            if schema.has_column(column) && !record.contains_key(column) {
                record.insert(column.to_string(), now.clone());
            }
        }

        let model: M = decode_attributes(&record)?;
        model.validate()?;

        let id = record.get(schema.primary_key).cloned().unwrap_or(Value::Null);
        self.client.backend().insert(schema, record).await?;
        debug!(table = schema.name, %id, "created record");
        Ok(model)
    }

    /// Apply `attributes` to the record with primary key `id`.
    pub async fn update(&self, id: &str, attributes: Value) -> Result<M> {
        let schema = M::SCHEMA;
        let mut changes = attributes_for(schema, attributes)?;
        if let Some(new_id) = changes.get(schema.primary_key) {
            if new_id.as_str() != Some(id) {
                return Err(ValidationErrors::new()
                    .with(schema.primary_key, "can't be changed")
                    .into());
            }
        }
        if schema.has_column(UPDATED_AT) {
            changes.insert(UPDATED_AT.to_string(), now_millis());
        }

        let current = self.find(id).await?;
        let mut merged = encode(&current)?;
        merged.extend(changes.clone());
        let model: M = decode_attributes(&merged)?;
        model.validate()?;

        changes.insert(schema.primary_key.to_string(), Value::String(id.to_string()));
        self.client.backend().update(schema, changes).await?;
        debug!(table = schema.name, id, "updated record");
        Ok(model)
    }

    /// Soft-delete: stamp `discarded_at`.
    pub async fn discard(&self, id: &str) -> Result<M> {
        self.set_discarded_at(id, now_millis()).await
    }

    /// Clear `discarded_at`, restoring a soft-deleted record.
    pub async fn undiscard(&self, id: &str) -> Result<M> {
        self.set_discarded_at(id, Value::Null).await
    }

    async fn set_discarded_at(&self, id: &str, value: Value) -> Result<M> {
        if !M::SCHEMA.is_discardable() {
            return Err(RecordError::invalid_query(format!(
                "{} has no {DISCARDED_AT} column",
                M::SCHEMA.name
            )));
        }
        let mut attributes = Record::new();
        attributes.insert(DISCARDED_AT.to_string(), value);
        self.update(id, Value::Object(attributes)).await
    }
}

impl<M> fmt::Debug for ModelFactory<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelFactory")
            .field("model", &std::any::type_name::<M>())
            .finish()
    }
}

/// A chainable query over model `M`.
///
/// Builder methods return a new relation. Terminals either resolve once
/// (`load`, `first`, `count`) or start a live query (`observe`).
pub struct Relation<M> {
    client: RecordClient,
    descriptor: QueryDescriptor,
    _model: PhantomData<fn() -> M>,
}

impl<M> Clone for Relation<M> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            descriptor: self.descriptor.clone(),
            _model: PhantomData,
        }
    }
}

impl<M: Model> Relation<M> {
    fn new(client: RecordClient, descriptor: QueryDescriptor) -> Self {
        Self {
            client,
            descriptor,
            _model: PhantomData,
        }
    }

    fn with(&self, descriptor: QueryDescriptor) -> Self {
        Self::new(self.client.clone(), descriptor)
    }

    /// The descriptor this relation resolves.
    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    /// Narrow by one condition. The builders below mirror [`QueryDescriptor`].
    pub fn where_(
        &self,
        field: &str,
        op: Operator,
        value: impl Into<ConditionValue>,
    ) -> Result<Self> {
        Ok(self.with(self.descriptor.where_(field, op, value)?))
    }

    pub fn where_eq(&self, field: &str, value: impl Into<ConditionValue>) -> Result<Self> {
        Ok(self.with(self.descriptor.where_eq(field, value)?))
    }

    pub fn where_all<'a, I>(&self, conditions: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, ConditionValue)>,
    {
        Ok(self.with(self.descriptor.where_all(conditions)?))
    }

    pub fn where_null(&self, field: &str) -> Result<Self> {
        Ok(self.with(self.descriptor.where_null(field)?))
    }

    pub fn where_not_null(&self, field: &str) -> Result<Self> {
        Ok(self.with(self.descriptor.where_not_null(field)?))
    }

    pub fn order_by(&self, field: &str, direction: Direction) -> Result<Self> {
        Ok(self.with(self.descriptor.order_by(field, direction)?))
    }

    pub fn limit(&self, n: u64) -> Self {
        self.with(self.descriptor.limit(n))
    }

    pub fn offset(&self, n: u64) -> Self {
        self.with(self.descriptor.offset(n))
    }

    pub fn includes(&self, association: &str) -> Result<Self> {
        Ok(self.with(self.descriptor.includes(association)?))
    }

    pub fn select(&self, fields: &[&str]) -> Result<Self> {
        Ok(self.with(self.descriptor.select(fields)?))
    }

    pub fn distinct(&self) -> Self {
        self.with(self.descriptor.distinct())
    }

    pub fn scope(&self, name: &str) -> Result<Self> {
        let registry = ScopeRegistry::new(M::SCHEMA, M::scopes());
        Ok(self.with(registry.apply(name, &self.descriptor)?))
    }

    /// Every matching record.
    pub async fn load(&self) -> Result<Vec<M>> {
        let data = self.client.fetch(&self.descriptor).await?;
        Vec::<M>::from_view(&data)
    }

    /// The first matching record, if any.
    pub async fn first(&self) -> Result<Option<M>> {
        let descriptor = self.descriptor.one();
        let data = self.client.fetch(&descriptor).await?;
        Option::<M>::from_view(&data)
    }

    /// Number of matching records.
    pub async fn count(&self) -> Result<usize> {
        let data = self.client.fetch(&self.descriptor).await?;
        Ok(data.len())
    }

    /// Live collection with the client's default TTL.
    pub fn observe(&self) -> ReactiveQuery<Vec<M>> {
        self.observe_with(QueryOptions::new())
    }

    /// Live collection whose view is kept for `ttl` after release.
    pub fn observe_with_ttl(&self, ttl: Ttl) -> ReactiveQuery<Vec<M>> {
        self.observe_with(QueryOptions::new().ttl(ttl))
    }

    /// Live collection with explicit options.
    pub fn observe_with(&self, options: QueryOptions) -> ReactiveQuery<Vec<M>> {
        let descriptor = self.descriptor.clone();
        self.client.observe(move || Ok(descriptor.clone()), options)
    }

    /// Live first record; `None` when nothing matches.
    pub fn observe_first(&self) -> ReactiveQuery<Option<M>> {
        let descriptor = self.descriptor.one();
        self.client
            .observe(move || Ok(descriptor.clone()), QueryOptions::new())
    }
}

impl<M> fmt::Debug for Relation<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}
