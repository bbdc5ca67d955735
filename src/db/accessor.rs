//! Schema-bound data accessors.
//!
//! An [`Accessor`] is bound to one tenant handle and one schema when it is
//! created, so none of its operations take a tenant or connection argument.
//! Every statement is checked against the handle's state first; a transport
//! fault marks the handle failed and surfaces as `StaleHandle`.

use crate::db::dialect::{self, Statement};
use crate::db::handle::ConnectionHandle;
use crate::db::multiplexer::ConnectionMultiplexer;
use crate::db::params::{bind_mysql_param, bind_postgres_param, bind_sqlite_param};
use crate::error::{TenantError, TenantResult, is_transport_fault};
use crate::models::{
    CREATED_AT_FIELD, Document, FieldType, Filter, ID_FIELD, SchemaDescriptor, UPDATED_AT_FIELD,
    schema::format_timestamp,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{ColumnIndex, Decode, Row, Type};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{error::Elapsed, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

#[async_trait]
pub trait Accessor: Send + Sync {
    fn schema(&self) -> &SchemaDescriptor;

    /// Documents matching every condition, newest first.
    async fn find_many(&self, filter: &Filter) -> TenantResult<Vec<Document>>;

    async fn find_by_id(&self, id: &str) -> TenantResult<Option<Document>>;

    /// Validate and store a new document; returns it as stored.
    async fn insert(&self, document: Document) -> TenantResult<Document>;

    /// Apply a partial update. `None` if no document has this id.
    async fn update_by_id(&self, id: &str, changes: Document) -> TenantResult<Option<Document>>;

    /// Remove a document, returning what was removed.
    async fn delete_by_id(&self, id: &str) -> TenantResult<Option<Document>>;
}

/// SQL-backed accessor over a tenant's pool.
pub struct SqlAccessor {
    handle: Arc<ConnectionHandle>,
    schema: Arc<SchemaDescriptor>,
    mux: Arc<ConnectionMultiplexer>,
    query_timeout: Duration,
}

type Outcome<T> = Result<Result<T, sqlx::Error>, Elapsed>;

impl SqlAccessor {
    pub fn new(
        handle: Arc<ConnectionHandle>,
        schema: Arc<SchemaDescriptor>,
        mux: Arc<ConnectionMultiplexer>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            handle,
            schema,
            mux,
            query_timeout,
        }
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    fn ensure_open(&self) -> TenantResult<()> {
        if self.handle.is_open() {
            return Ok(());
        }
        Err(TenantError::stale_handle(
            self.handle.tenant_id(),
            format!("handle is {}", self.handle.state()),
        ))
    }

    async fn fetch(&self, stmt: Statement) -> TenantResult<Vec<Document>> {
        self.ensure_open()?;
        let start = Instant::now();
        let limit = self.query_timeout;
        let schema = self.schema.as_ref();

        debug!(
            tenant_id = %self.handle.tenant_id(),
            sql = %stmt.sql,
            params = stmt.params.len(),
            "Fetching documents"
        );

        let outcome: Outcome<Vec<Document>> = crate::impl_db_dispatch!(self.handle.pool(), {
            MySql(pool) => {
                let mut query = sqlx::query(&stmt.sql);
                for param in &stmt.params {
                    query = bind_mysql_param(query, param);
                }
                timeout(limit, query.fetch_all(pool)).await.map(|rows| {
                    rows.and_then(|rows| rows.iter().map(|row| decode_document(row, schema)).collect())
                })
            },
            Postgres(pool) => {
                let mut query = sqlx::query(&stmt.sql);
                for param in &stmt.params {
                    query = bind_postgres_param(query, param);
                }
                timeout(limit, query.fetch_all(pool)).await.map(|rows| {
                    rows.and_then(|rows| rows.iter().map(|row| decode_document(row, schema)).collect())
                })
            },
            SQLite(pool) => {
                let mut query = sqlx::query(&stmt.sql);
                for param in &stmt.params {
                    query = bind_sqlite_param(query, param);
                }
                timeout(limit, query.fetch_all(pool)).await.map(|rows| {
                    rows.and_then(|rows| rows.iter().map(|row| decode_document(row, schema)).collect())
                })
            },
        });

        let documents = self.finish("query", outcome)?;
        debug!(
            rows = documents.len(),
            execution_time_ms = start.elapsed().as_millis() as u64,
            "Fetched documents"
        );
        Ok(documents)
    }

    async fn execute(&self, stmt: Statement) -> TenantResult<u64> {
        self.ensure_open()?;
        let limit = self.query_timeout;

        debug!(
            tenant_id = %self.handle.tenant_id(),
            sql = %stmt.sql,
            params = stmt.params.len(),
            "Executing write"
        );

        let outcome: Outcome<u64> = crate::impl_db_dispatch!(self.handle.pool(), {
            MySql(pool) => {
                let mut query = sqlx::query(&stmt.sql);
                for param in &stmt.params {
                    query = bind_mysql_param(query, param);
                }
                timeout(limit, query.execute(pool)).await.map(|r| r.map(|done| done.rows_affected()))
            },
            Postgres(pool) => {
                let mut query = sqlx::query(&stmt.sql);
                for param in &stmt.params {
                    query = bind_postgres_param(query, param);
                }
                timeout(limit, query.execute(pool)).await.map(|r| r.map(|done| done.rows_affected()))
            },
            SQLite(pool) => {
                let mut query = sqlx::query(&stmt.sql);
                for param in &stmt.params {
                    query = bind_sqlite_param(query, param);
                }
                timeout(limit, query.execute(pool)).await.map(|r| r.map(|done| done.rows_affected()))
            },
        });

        self.finish("write", outcome)
    }

    /// Map a driver outcome into the crate's error model.
    fn finish<T>(&self, operation: &str, outcome: Outcome<T>) -> TenantResult<T> {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if is_transport_fault(&e) => {
                warn!(
                    tenant_id = %self.handle.tenant_id(),
                    generation = self.handle.generation(),
                    error = %e,
                    "Transport fault on tenant connection"
                );
                self.mux.mark_failed(&self.handle);
                Err(TenantError::stale_handle(
                    self.handle.tenant_id(),
                    format!("connection lost during {}: {}", operation, e),
                ))
            }
            Ok(Err(e)) => Err(TenantError::from(e)),
            Err(_) => Err(TenantError::timeout(
                format!("{} on '{}'", operation, self.schema.collection),
                self.query_timeout.as_secs(),
            )),
        }
    }

    fn db_type(&self) -> crate::models::DatabaseType {
        self.handle.pool().db_type()
    }
}

#[async_trait]
impl Accessor for SqlAccessor {
    fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    async fn find_many(&self, filter: &Filter) -> TenantResult<Vec<Document>> {
        for condition in filter.conditions() {
            let known = condition.field == ID_FIELD
                || condition.field == CREATED_AT_FIELD
                || condition.field == UPDATED_AT_FIELD
                || self.schema.field(&condition.field).is_some();
            if !known {
                return Err(TenantError::invalid_input(format!(
                    "Cannot filter on unknown field '{}' of '{}'",
                    condition.field, self.schema.name
                )));
            }
        }
        self.fetch(dialect::select_many(self.db_type(), &self.schema, filter))
            .await
    }

    async fn find_by_id(&self, id: &str) -> TenantResult<Option<Document>> {
        let mut documents = self
            .fetch(dialect::select_by_id(self.db_type(), &self.schema, id))
            .await?;
        Ok(documents.pop())
    }

    async fn insert(&self, document: Document) -> TenantResult<Document> {
        let values = self.schema.prepare_insert(&document)?;
        let id = Uuid::new_v4().to_string();
        let now = format_timestamp(Utc::now());

        self.execute(dialect::insert(
            self.db_type(),
            &self.schema,
            &id,
            &now,
            values,
        ))
        .await?;

        self.find_by_id(&id).await?.ok_or_else(|| {
            TenantError::internal(format!(
                "Inserted {} '{}' could not be read back",
                self.schema.name, id
            ))
        })
    }

    async fn update_by_id(&self, id: &str, changes: Document) -> TenantResult<Option<Document>> {
        let changes = self.schema.prepare_update(&changes)?;
        let changes = changes
            .into_iter()
            .map(|(field, param)| (field.name.as_str(), param))
            .collect();
        let now = format_timestamp(Utc::now());

        // rows_affected is unreliable on MySQL for no-op updates; read back instead
        self.execute(dialect::update_by_id(
            self.db_type(),
            &self.schema,
            id,
            &now,
            changes,
        ))
        .await?;
        self.find_by_id(id).await
    }

    async fn delete_by_id(&self, id: &str) -> TenantResult<Option<Document>> {
        let Some(existing) = self.find_by_id(id).await? else {
            return Ok(None);
        };
        let removed = self
            .execute(dialect::delete_by_id(self.db_type(), &self.schema, id))
            .await?;
        Ok((removed > 0).then_some(existing))
    }
}

impl std::fmt::Debug for SqlAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlAccessor")
            .field("tenant_id", &self.handle.tenant_id())
            .field("generation", &self.handle.generation())
            .field("schema", &self.schema.name)
            .finish()
    }
}

/// Decode a row selected with [`dialect::column_names`] into a document.
fn decode_document<R>(row: &R, schema: &SchemaDescriptor) -> Result<Document, sqlx::Error>
where
    R: Row,
    usize: ColumnIndex<R>,
    String: Type<R::Database> + for<'r> Decode<'r, R::Database>,
    i64: Type<R::Database> + for<'r> Decode<'r, R::Database>,
    f64: Type<R::Database> + for<'r> Decode<'r, R::Database>,
    bool: Type<R::Database> + for<'r> Decode<'r, R::Database>,
{
    let mut document = Document::new();
    for (index, name) in [ID_FIELD, CREATED_AT_FIELD, UPDATED_AT_FIELD]
        .into_iter()
        .enumerate()
    {
        let value: Option<String> = row.try_get(index)?;
        document.insert(name.to_string(), value.map_or(JsonValue::Null, JsonValue::String));
    }

    for (offset, field) in schema.fields.iter().enumerate() {
        let index = offset + 3;
        let value = match field.kind {
            FieldType::Text | FieldType::Timestamp => row
                .try_get::<Option<String>, _>(index)?
                .map_or(JsonValue::Null, JsonValue::String),
            FieldType::Integer => row
                .try_get::<Option<i64>, _>(index)?
                .map_or(JsonValue::Null, JsonValue::from),
            FieldType::Float => row
                .try_get::<Option<f64>, _>(index)?
                .map_or(JsonValue::Null, JsonValue::from),
            FieldType::Boolean => row
                .try_get::<Option<bool>, _>(index)?
                .map_or(JsonValue::Null, JsonValue::Bool),
            FieldType::Json => match row.try_get::<Option<String>, _>(index)? {
                Some(raw) => serde_json::from_str(&raw).unwrap_or(JsonValue::String(raw)),
                None => JsonValue::Null,
            },
        };
        document.insert(field.name.clone(), value);
    }
    Ok(document)
}
