//! Postgres (Diesel) implementation of `DocumentStore`.
//!
//! Every trait call does a `spawn_blocking` over a connection borrowed
//! from the r2d2 pool (Diesel is synchronous); the ack of the message
//! that triggered the call is emitted on the same async task that
//! originated it, not on the blocking thread. `insert` uses `ON CONFLICT
//! DO NOTHING` so it never mutates an existing document: the idempotency
//! primitive lives here, not in a read-then-write.

use crate::error::StoreError;
use crate::migrations::run_pending_migrations;
use crate::model::{Collection, Filter, FilterValue, MutablePatch, StoredDocument};
use crate::schema::documents;
use crate::store_trait::DocumentStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use log::warn;
use pipeline_core::status::DocumentStatus;
use serde_json::Value;
use std::str::FromStr;

pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;

/// Indirection for injecting a real pool or, in tests, a fake one.
pub trait ConnectionProvider: Send + Sync + Clone + 'static {
    fn connection(&self) -> Result<r2d2::PooledConnection<ConnectionManager<PgConnection>>, StoreError>;
}

#[derive(Clone)]
pub struct PoolProvider {
    pub pool: PgPool,
}

impl ConnectionProvider for PoolProvider {
    fn connection(&self) -> Result<r2d2::PooledConnection<ConnectionManager<PgConnection>>, StoreError> {
        self.pool.get().map_err(StoreError::from)
    }
}

#[derive(Queryable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = documents)]
struct DocumentRow {
    collection: String,
    key: String,
    payload: Value,
    status: String,
    attempt_count: i32,
    last_attempt_time: Option<DateTime<Utc>>,
    last_updated: DateTime<Utc>,
}

impl From<DocumentRow> for StoredDocument {
    fn from(row: DocumentRow) -> Self {
        StoredDocument {
            collection_key: row.key,
            payload: row.payload,
            status: DocumentStatus::from_str(&row.status).unwrap_or(DocumentStatus::Pending),
            attempt_count: row.attempt_count.max(0) as u32,
            last_attempt_time: row.last_attempt_time,
            last_updated: row.last_updated,
        }
    }
}

fn is_retryable(e: &StoreError) -> bool {
    e.is_transient()
}

fn with_retry<F, T>(mut f: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if is_retryable(&e) && attempts < 3 => {
                let delay_ms = 15 * (attempts + 1);
                warn!("retryable store error (attempt {}): {e} -> sleeping {delay_ms}ms", attempts + 1);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}

#[derive(Clone)]
pub struct PgDocumentStore<P: ConnectionProvider> {
    provider: P,
}

impl<P: ConnectionProvider> PgDocumentStore<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    fn insert_blocking(&self, collection: Collection, key: &str, payload: Value, now: DateTime<Utc>) -> Result<String, StoreError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            let row = DocumentRow {
                collection: collection.as_str().to_string(),
                key: key.to_string(),
                payload: payload.clone(),
                status: DocumentStatus::Pending.to_string(),
                attempt_count: 0,
                last_attempt_time: None,
                last_updated: now,
            };
            diesel::insert_into(documents::table).values(&row).on_conflict_do_nothing().execute(&mut conn)?;
            Ok(key.to_string())
        })
    }

    fn get_blocking(&self, collection: Collection, key: &str) -> Result<Option<StoredDocument>, StoreError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            let row: Option<DocumentRow> = documents::table
                .filter(documents::collection.eq(collection.as_str()))
                .filter(documents::key.eq(key))
                .first(&mut conn)
                .optional()?;
            Ok(row.map(StoredDocument::from))
        })
    }

    fn query_blocking(&self, collection: Collection, filter: &Filter, limit: Option<usize>) -> Result<Vec<StoredDocument>, StoreError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            // Lifecycle fields (status/last_updated) translate to Diesel's
            // typed DSL; everything else is evaluated in memory against
            // `payload` after loading, to avoid generating dynamic SQL
            // per possible field name.
            let mut query = documents::table.filter(documents::collection.eq(collection.as_str())).into_boxed();
            let mut payload_conditions: Vec<(String, FilterValue)> = Vec::new();
            for (field, cond) in &filter.conditions {
                match field.as_str() {
                    "status" => {
                        if let FilterValue::Eq(v) = cond {
                            if let Some(s) = v.as_str() {
                                query = query.filter(documents::status.eq(s.to_string()));
                            }
                        } else if let FilterValue::In(vs) = cond {
                            let strs: Vec<String> = vs.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
                            query = query.filter(documents::status.eq_any(strs));
                        }
                    }
                    "last_updated" => match cond {
                        FilterValue::Lt(ts) => query = query.filter(documents::last_updated.lt(*ts)),
                        FilterValue::Gt(ts) => query = query.filter(documents::last_updated.gt(*ts)),
                        _ => {}
                    },
                    _ => payload_conditions.push((field.clone(), cond.clone())),
                }
            }
            if let Some(limit) = limit {
                query = query.limit(limit as i64);
            }
            let rows: Vec<DocumentRow> = query.load(&mut conn)?;
            let mut docs: Vec<StoredDocument> = rows.into_iter().map(StoredDocument::from).collect();
            if !payload_conditions.is_empty() {
                let payload_filter = Filter { conditions: payload_conditions };
                docs.retain(|d| payload_filter.matches(d));
            }
            Ok(docs)
        })
    }

    fn update_blocking(&self, collection: Collection, key: &str, patch: MutablePatch, now: DateTime<Utc>) -> Result<bool, StoreError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.transaction(|tx| {
                let existing: Option<DocumentRow> = documents::table
                    .filter(documents::collection.eq(collection.as_str()))
                    .filter(documents::key.eq(key))
                    .first(tx)
                    .optional()?;
                let Some(mut row) = existing else {
                    return Ok(false);
                };
                if let Some(status) = patch.status {
                    row.status = status.to_string();
                }
                if let Some(n) = patch.attempt_count {
                    row.attempt_count = n as i32;
                }
                if let Some(t) = patch.last_attempt_time {
                    row.last_attempt_time = Some(t);
                }
                if let Some(merge) = &patch.payload_merge {
                    merge_json(&mut row.payload, merge);
                }
                row.last_updated = now;
                diesel::update(documents::table.filter(documents::collection.eq(collection.as_str())).filter(documents::key.eq(key)))
                    .set(&row)
                    .execute(tx)?;
                Ok::<bool, diesel::result::Error>(true)
            })
            .map_err(StoreError::from)
        })
    }

    fn delete_blocking(&self, collection: Collection, key: &str) -> Result<bool, StoreError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            let affected = diesel::delete(documents::table.filter(documents::collection.eq(collection.as_str())).filter(documents::key.eq(key)))
                .execute(&mut conn)?;
            Ok(affected > 0)
        })
    }
}

fn merge_json(base: &mut Value, patch: &Value) {
    if let (Value::Object(base_map), Value::Object(patch_map)) = (base, patch) {
        for (k, v) in patch_map {
            base_map.insert(k.clone(), v.clone());
        }
    }
}

#[async_trait]
impl<P: ConnectionProvider> DocumentStore for PgDocumentStore<P> {
    async fn insert(&self, collection: Collection, key: &str, payload: Value, now: DateTime<Utc>) -> Result<String, StoreError> {
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || this.insert_blocking(collection, &key, payload, now))
            .await
            .map_err(|e| StoreError::Unknown(format!("join error: {e}")))?
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<StoredDocument>, StoreError> {
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || this.get_blocking(collection, &key)).await.map_err(|e| StoreError::Unknown(format!("join error: {e}")))?
    }

    async fn query(&self, collection: Collection, filter: &Filter, limit: Option<usize>) -> Result<Vec<StoredDocument>, StoreError> {
        let this = self.clone();
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || this.query_blocking(collection, &filter, limit))
            .await
            .map_err(|e| StoreError::Unknown(format!("join error: {e}")))?
    }

    async fn update(&self, collection: Collection, key: &str, patch: MutablePatch, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || this.update_blocking(collection, &key, patch, now))
            .await
            .map_err(|e| StoreError::Unknown(format!("join error: {e}")))?
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, StoreError> {
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || this.delete_blocking(collection, &key))
            .await
            .map_err(|e| StoreError::Unknown(format!("join error: {e}")))?
    }
}

/// Builds an r2d2 Postgres pool, running the embedded migrations before
/// handing out the first checkout.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, StoreError> {
    let validated_min = min_size.max(1);
    let validated_max = max_size.max(1).max(validated_min);
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder()
        .min_idle(Some(validated_min))
        .max_size(validated_max)
        .build(manager)
        .map_err(|e| StoreError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get().map_err(StoreError::from)?;
        run_pending_migrations(&mut conn)?;
    }
    Ok(pool)
}

pub fn build_dev_pool_from_env() -> Result<PgPool, StoreError> {
    crate::config::init_dotenv();
    let cfg = crate::config::DbConfig::from_env();
    build_pool(&cfg.url, cfg.min_connections, cfg.max_connections)
}
