//! PostgreSQL Primary Store Adapter
//!
//! Implements `ContentStore` and `AccountStore` over a deadpool-postgres
//! pool. IDs are stored as BIGINT and the soft-delete flag as SMALLINT.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use serde::{Deserialize, Serialize};
use tokio_postgres::{NoTls, Row};
use tracing::info;

use crate::domain::ports::{
    AccountStore, ContentItem, ContentStore, ItemId, UserId, UserRole,
};
use crate::error::{Error, Result};

/// Tables the adapters read and write.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS question (
    id          BIGINT PRIMARY KEY,
    title       TEXT,
    content     TEXT,
    tags        TEXT,
    answer      TEXT,
    user_id     BIGINT NOT NULL,
    edit_time   TIMESTAMPTZ NOT NULL DEFAULT now(),
    create_time TIMESTAMPTZ NOT NULL DEFAULT now(),
    update_time TIMESTAMPTZ NOT NULL DEFAULT now(),
    is_delete   SMALLINT NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS question_update_time_idx ON question (update_time);

CREATE TABLE IF NOT EXISTS users (
    id        BIGINT PRIMARY KEY,
    user_role TEXT NOT NULL DEFAULT 'user'
);
"#;

const QUESTION_COLUMNS: &str =
    "id, title, content, tags, answer, user_id, edit_time, create_time, update_time, is_delete";

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Pool wait/create timeout in seconds
    pub timeout_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "qbank".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_size: 16,
            timeout_secs: 30,
        }
    }
}

impl DbConfig {
    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> Result<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let timeout = Duration::from_secs(self.timeout_secs);
        let mut pool = PoolConfig::new(self.max_size);
        pool.timeouts.wait = Some(timeout);
        pool.timeouts.create = Some(timeout);
        cfg.pool = Some(pool);

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| Error::Config(format!("Failed to create Postgres pool: {}", e)))
    }
}

/// Create the tables if they do not exist yet.
pub async fn ensure_schema(pool: &Pool) -> Result<()> {
    let client = pool.get().await?;
    client.batch_execute(SCHEMA_SQL).await?;
    info!("Primary store schema ready");
    Ok(())
}

fn row_to_item(row: &Row) -> Result<ContentItem> {
    let id: i64 = row.try_get("id")?;
    let user_id: i64 = row.try_get("user_id")?;
    let is_delete: i16 = row.try_get("is_delete")?;

    Ok(ContentItem {
        id: ItemId::new(id as u64),
        user_id: UserId::new(user_id as u64),
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        tags: row.try_get("tags")?,
        answer: row.try_get("answer")?,
        edit_time: row.try_get("edit_time")?,
        create_time: row.try_get("create_time")?,
        update_time: row.try_get("update_time")?,
        is_delete: is_delete != 0,
    })
}

// ============================================================================
// CONTENT STORE
// ============================================================================

#[derive(Clone)]
pub struct PostgresContentStore {
    pool: Pool,
}

impl PostgresContentStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContentStore for PostgresContentStore {
    async fn get_item(&self, id: ItemId) -> Result<Option<ContentItem>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM question WHERE id = $1 AND is_delete = 0",
            QUESTION_COLUMNS
        );
        let row = client.query_opt(&sql, &[&(id.as_u64() as i64)]).await?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn save_item(&self, item: &ContentItem) -> Result<()> {
        let client = self.pool.get().await?;
        let sql = format!(
            "INSERT INTO question ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                content = EXCLUDED.content,
                tags = EXCLUDED.tags,
                answer = EXCLUDED.answer,
                user_id = EXCLUDED.user_id,
                edit_time = EXCLUDED.edit_time,
                create_time = EXCLUDED.create_time,
                update_time = EXCLUDED.update_time,
                is_delete = EXCLUDED.is_delete",
            QUESTION_COLUMNS
        );
        client
            .execute(
                &sql,
                &[
                    &(item.id.as_u64() as i64),
                    &item.title,
                    &item.content,
                    &item.tags,
                    &item.answer,
                    &(item.user_id.as_u64() as i64),
                    &item.edit_time,
                    &item.create_time,
                    &item.update_time,
                    &i16::from(item.is_delete),
                ],
            )
            .await?;
        Ok(())
    }

    async fn soft_delete(&self, id: ItemId, at: DateTime<Utc>) -> Result<bool> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE question SET is_delete = 1, update_time = $2 WHERE id = $1",
                &[&(id.as_u64() as i64), &at],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn changed_since(&self, since: DateTime<Utc>) -> Result<Vec<ContentItem>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM question WHERE update_time >= $1 ORDER BY update_time",
            QUESTION_COLUMNS
        );
        let rows = client.query(&sql, &[&since]).await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn health_check(&self) -> Result<bool> {
        let Ok(client) = self.pool.get().await else {
            return Ok(false);
        };
        Ok(client.simple_query("SELECT 1").await.is_ok())
    }
}

// ============================================================================
// ACCOUNT STORE
// ============================================================================

#[derive(Clone)]
pub struct PostgresAccountStore {
    pool: Pool,
}

impl PostgresAccountStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PostgresAccountStore {
    async fn get_role(&self, user_id: UserId) -> Result<Option<UserRole>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT user_role FROM users WHERE id = $1",
                &[&(user_id.as_u64() as i64)],
            )
            .await?;
        match row {
            Some(row) => {
                let role: String = row.try_get("user_role")?;
                Ok(Some(UserRole::parse(&role)))
            }
            None => Ok(None),
        }
    }

    async fn set_role(&self, user_id: UserId, role: UserRole) -> Result<bool> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE users SET user_role = $2 WHERE id = $1",
                &[&(user_id.as_u64() as i64), &role.as_str()],
            )
            .await?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults_and_yaml() {
        let config: DbConfig = serde_yaml::from_str("host: db\nmax_size: 4").unwrap();
        assert_eq!(config.host, "db");
        assert_eq!(config.max_size, 4);
        assert_eq!(config.port, 5432);
        assert_eq!(config.dbname, "qbank");
    }

    #[tokio::test]
    async fn test_pool_creation_is_lazy() {
        let config = DbConfig {
            port: 1,
            timeout_secs: 1,
            ..Default::default()
        };
        let store = PostgresContentStore::new(config.create_pool().unwrap());
        assert!(!store.health_check().await.unwrap());
    }

    #[test]
    fn test_schema_declares_both_tables() {
        assert!(SCHEMA_SQL.contains("CREATE TABLE IF NOT EXISTS question"));
        assert!(SCHEMA_SQL.contains("CREATE TABLE IF NOT EXISTS users"));
    }
}
