//! Alert repository for alert configs and triggered-alert state

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::{AlertConfigSource, PostgresPool, TriggeredAlertRepository};
use crate::error::Result;
use crate::models::{AlertConfig, TriggeredAlert};

/// Repository for alert configs and triggered alerts
#[derive(Clone)]
pub struct AlertRepository {
    pool: PgPool,
}

impl AlertRepository {
    /// Create a new alert repository
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }
}

#[async_trait]
impl AlertConfigSource for AlertRepository {
    async fn alert_configs(&self, agent_scope: &str) -> Result<Vec<AlertConfig>> {
        let rows = sqlx::query_as::<_, AlertConfigRow>(
            r#"
            SELECT id, config FROM alert_configs
            WHERE agent_scope = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(agent_scope)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn all_alert_configs(&self) -> Result<Vec<AlertConfig>> {
        let rows = sqlx::query_as::<_, AlertConfigRow>(
            "SELECT id, config FROM alert_configs ORDER BY agent_scope, created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn alert_config(&self, id: Uuid) -> Result<Option<AlertConfig>> {
        let row = sqlx::query_as::<_, AlertConfigRow>(
            "SELECT id, config FROM alert_configs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn save_alert_config(&self, config: &AlertConfig) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO alert_configs
                (id, agent_scope, version, kind, config, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (id) DO UPDATE SET
                agent_scope = EXCLUDED.agent_scope,
                version = EXCLUDED.version,
                kind = EXCLUDED.kind,
                config = EXCLUDED.config,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(config.id)
        .bind(&config.agent_scope)
        .bind(config.version())
        .bind(config.kind.as_str())
        .bind(Json(config))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_alert_config(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM alert_configs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TriggeredAlertRepository for AlertRepository {
    async fn exists(&self, agent_scope: &str, alert_config_version: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM triggered_alerts
                WHERE agent_scope = $1 AND alert_config_version = $2
            )
            "#,
        )
        .bind(agent_scope)
        .bind(alert_config_version)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn insert_if_absent(&self, alert: &TriggeredAlert) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO triggered_alerts (agent_scope, alert_config_version, triggered_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (agent_scope, alert_config_version) DO NOTHING
            "#,
        )
        .bind(&alert.agent_scope)
        .bind(&alert.alert_config_version)
        .bind(alert.triggered_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_if_present(
        &self,
        agent_scope: &str,
        alert_config_version: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM triggered_alerts WHERE agent_scope = $1 AND alert_config_version = $2",
        )
        .bind(agent_scope)
        .bind(alert_config_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, agent_scope: Option<&str>) -> Result<Vec<TriggeredAlert>> {
        let rows = sqlx::query_as::<_, TriggeredAlertRow>(
            r#"
            SELECT agent_scope, alert_config_version, triggered_at
            FROM triggered_alerts
            WHERE ($1::TEXT IS NULL OR agent_scope = $1)
            ORDER BY triggered_at DESC
            "#,
        )
        .bind(agent_scope)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// Database row types for mapping

#[derive(sqlx::FromRow)]
struct AlertConfigRow {
    id: Uuid,
    config: Json<AlertConfig>,
}

impl From<AlertConfigRow> for AlertConfig {
    fn from(row: AlertConfigRow) -> Self {
        AlertConfig {
            id: row.id,
            ..row.config.0
        }
    }
}

#[derive(sqlx::FromRow)]
struct TriggeredAlertRow {
    agent_scope: String,
    alert_config_version: String,
    triggered_at: DateTime<Utc>,
}

impl From<TriggeredAlertRow> for TriggeredAlert {
    fn from(row: TriggeredAlertRow) -> Self {
        TriggeredAlert {
            agent_scope: row.agent_scope,
            alert_config_version: row.alert_config_version,
            triggered_at: row.triggered_at,
        }
    }
}
