//! PostgreSQL connection and rollup queries

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::models::{AggregatePoint, Payload, RollupWorkItem, SeriesKey};

use super::{RollupBackend, ScopeCatalog};

/// PostgreSQL connection pool
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Create a new PostgreSQL connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn level_to_db(level: usize) -> Result<i16> {
    i16::try_from(level)
        .map_err(|_| Error::validation(format!("rollup level {level} out of range")))
}

fn level_from_db(level: i16) -> Result<usize> {
    usize::try_from(level).map_err(|_| Error::storage(format!("negative rollup level {level}")))
}

/// Rollup points, work items and the scope catalog
#[derive(Clone)]
pub struct PgRollupBackend {
    pool: PgPool,
}

impl PgRollupBackend {
    /// Create a new rollup backend
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool.clone(),
        }
    }

    fn point_from_row(row: &PgRow) -> Result<AggregatePoint> {
        let series_key: String = row.try_get("series_key")?;
        let Json(payload): Json<Payload> = row.try_get("payload")?;
        Ok(AggregatePoint {
            agent_scope: row.try_get("agent_scope")?,
            series_key: SeriesKey::from_storage_key(&series_key)?,
            level: level_from_db(row.try_get("level")?)?,
            capture_time: row.try_get("capture_time")?,
            payload,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

const UPSERT_POINT: &str = r#"
    INSERT INTO rollup_points (agent_scope, series_key, level, capture_time, payload, expires_at)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (agent_scope, series_key, level, capture_time) DO UPDATE SET
        payload = EXCLUDED.payload,
        expires_at = EXCLUDED.expires_at
"#;

#[async_trait]
impl RollupBackend for PgRollupBackend {
    async fn write_batch(
        &self,
        agent_scope: &str,
        points: &[AggregatePoint],
        work_items: &[RollupWorkItem],
        last_capture_time: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for point in points {
            sqlx::query(UPSERT_POINT)
                .bind(&point.agent_scope)
                .bind(point.series_key.storage_key()?)
                .bind(level_to_db(point.level)?)
                .bind(point.capture_time)
                .bind(Json(&point.payload))
                .bind(point.expires_at)
                .execute(&mut *tx)
                .await?;
        }

        for item in work_items {
            sqlx::query(
                r#"
                INSERT INTO rollup_work_items
                    (agent_scope, level, bucket_end_time, series_key, update_token)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (agent_scope, level, bucket_end_time, series_key) DO UPDATE SET
                    update_token = EXCLUDED.update_token
                "#,
            )
            .bind(&item.agent_scope)
            .bind(level_to_db(item.level)?)
            .bind(item.bucket_end_time)
            .bind(item.series_key.storage_key()?)
            .bind(item.update_token)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO agent_scopes (agent_scope, last_capture_time)
            VALUES ($1, $2)
            ON CONFLICT (agent_scope) DO UPDATE SET
                last_capture_time =
                    GREATEST(agent_scopes.last_capture_time, EXCLUDED.last_capture_time)
            "#,
        )
        .bind(agent_scope)
        .bind(last_capture_time)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn read_points(
        &self,
        agent_scope: &str,
        series_key: &SeriesKey,
        level: usize,
        after: i64,
        until: i64,
    ) -> Result<Vec<AggregatePoint>> {
        let rows = sqlx::query(
            r#"
            SELECT agent_scope, series_key, level, capture_time, payload, expires_at
            FROM rollup_points
            WHERE agent_scope = $1
              AND series_key = $2
              AND level = $3
              AND capture_time > $4
              AND capture_time <= $5
            ORDER BY capture_time ASC
            "#,
        )
        .bind(agent_scope)
        .bind(series_key.storage_key()?)
        .bind(level_to_db(level)?)
        .bind(after)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::point_from_row).collect()
    }

    async fn upsert_point(&self, point: &AggregatePoint) -> Result<()> {
        sqlx::query(UPSERT_POINT)
            .bind(&point.agent_scope)
            .bind(point.series_key.storage_key()?)
            .bind(level_to_db(point.level)?)
            .bind(point.capture_time)
            .bind(Json(&point.payload))
            .bind(point.expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn read_due_work_items(
        &self,
        agent_scope: &str,
        level: usize,
        not_after: i64,
    ) -> Result<Vec<RollupWorkItem>> {
        let rows = sqlx::query(
            r#"
            SELECT bucket_end_time, series_key, update_token
            FROM rollup_work_items
            WHERE agent_scope = $1 AND level = $2 AND bucket_end_time <= $3
            ORDER BY bucket_end_time ASC
            "#,
        )
        .bind(agent_scope)
        .bind(level_to_db(level)?)
        .bind(not_after)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let series_key: String = row.try_get("series_key")?;
                let update_token: Uuid = row.try_get("update_token")?;
                Ok(RollupWorkItem {
                    agent_scope: agent_scope.to_string(),
                    level,
                    bucket_end_time: row.try_get("bucket_end_time")?,
                    series_key: SeriesKey::from_storage_key(&series_key)?,
                    update_token,
                })
            })
            .collect()
    }

    async fn delete_work_item_if(&self, item: &RollupWorkItem) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM rollup_work_items
            WHERE agent_scope = $1
              AND level = $2
              AND bucket_end_time = $3
              AND series_key = $4
              AND update_token = $5
            "#,
        )
        .bind(&item.agent_scope)
        .bind(level_to_db(item.level)?)
        .bind(item.bucket_end_time)
        .bind(item.series_key.storage_key()?)
        .bind(item.update_token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn purge_expired(&self, now: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rollup_points WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ScopeCatalog for PgRollupBackend {
    async fn scopes(&self) -> Result<Vec<String>> {
        let scopes = sqlx::query_scalar::<_, String>(
            "SELECT agent_scope FROM agent_scopes ORDER BY agent_scope",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(scopes)
    }

    async fn series(&self, agent_scope: &str) -> Result<Vec<SeriesKey>> {
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT series_key FROM rollup_points WHERE agent_scope = $1",
        )
        .bind(agent_scope)
        .fetch_all(&self.pool)
        .await?;
        let mut series = keys
            .iter()
            .map(|key| SeriesKey::from_storage_key(key))
            .collect::<Result<Vec<_>>>()?;
        series.sort();
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_conversion() {
        assert_eq!(level_to_db(2).unwrap(), 2);
        assert!(level_to_db(usize::MAX).is_err());
        assert_eq!(level_from_db(3).unwrap(), 3);
        assert!(level_from_db(-1).is_err());
    }
}
