use crate::config::DatabaseConfig;
use crate::error::PersistenceError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Sentinel written in place of a derivative locator when processing failed
pub const FAILED_SENTINEL: &str = "FAILED";

/// A single attribute value: scalar or list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
    List(Vec<String>),
    Json(serde_json::Value),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(value: Vec<String>) -> Self {
        AttributeValue::List(value)
    }
}

/// Named attributes of one asset
pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// Keyed attribute store for asset metadata.
///
/// Writes replace each named attribute wholesale; nested values are never
/// merged, so callers always supply complete values.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Replace the named attributes of `asset_id` and return the full
    /// attribute set after the update
    async fn update_attributes(
        &self,
        asset_id: &str,
        attributes: AttributeMap,
    ) -> Result<AttributeMap, PersistenceError>;
}

/// PostgreSQL-backed metadata store.
///
/// One row per asset; attributes live in a JSONB object merged at the top
/// level, which gives replace-by-name semantics.
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    #[instrument(skip(self, attributes), fields(attribute_count = attributes.len()))]
    async fn update_attributes(
        &self,
        asset_id: &str,
        attributes: AttributeMap,
    ) -> Result<AttributeMap, PersistenceError> {
        let (stored,): (Json<AttributeMap>,) = sqlx::query_as(
            r#"
            INSERT INTO asset_metadata (asset_id, attributes, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (asset_id) DO UPDATE
            SET attributes = asset_metadata.attributes || EXCLUDED.attributes,
                updated_at = NOW()
            RETURNING attributes
            "#,
        )
        .bind(asset_id)
        .bind(Json(&attributes))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PersistenceError::Update {
            asset_id: asset_id.to_string(),
            message: e.to_string(),
        })?;

        debug!(asset_id = %asset_id, "Asset attributes updated");

        metrics::counter!("postprod.metadata.updates").increment(1);

        Ok(stored.0)
    }
}
