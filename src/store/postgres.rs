// dbbackup/src/store/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::info;

use super::{
    ArtifactUpdate, JobQuery, JobStats, MetadataStore, Page, Pagination, SortDirection, SortField,
};
use crate::errors::{StoreError, StoreResult};
use crate::model::{BackupJob, Connection, DatabaseConfig, JobStatus};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS backup_jobs (
        id TEXT PRIMARY KEY,
        db_type TEXT NOT NULL,
        host TEXT NOT NULL,
        port INTEGER,
        database_name TEXT NOT NULL,
        username TEXT,
        file_path TEXT,
        object_key TEXT,
        file_size BIGINT NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS backup_jobs_created_at_idx ON backup_jobs (created_at)",
    "CREATE INDEX IF NOT EXISTS backup_jobs_status_idx ON backup_jobs (status)",
    r#"CREATE TABLE IF NOT EXISTS database_configs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        db_type TEXT NOT NULL,
        connection JSONB NOT NULL,
        cron_expression TEXT NOT NULL DEFAULT '',
        is_active BOOLEAN NOT NULL DEFAULT FALSE,
        webhook_url TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )"#,
];

/// Postgres-backed metadata store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects and creates the tables if they do not exist yet.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Metadata schema is up to date");
        Ok(())
    }

    async fn current_status(&self, id: &str) -> StoreResult<Option<JobStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM backup_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        status.map(|s| parse_status(&s)).transpose()
    }

    /// Explains why a guarded UPDATE touched no rows.
    async fn rejected_transition(&self, id: &str, to: JobStatus) -> StoreError {
        match self.current_status(id).await {
            Ok(Some(from)) => StoreError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            },
            Ok(None) => StoreError::NotFound(id.to_string()),
            Err(e) => e,
        }
    }
}

fn parse_status(raw: &str) -> StoreResult<JobStatus> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("unknown status '{}'", raw)))
}

fn predecessor_tags(next: JobStatus) -> Vec<String> {
    JobStatus::predecessors(next)
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

fn job_from_row(row: &PgRow) -> StoreResult<BackupJob> {
    let port: Option<i32> = row.try_get("port")?;
    let file_size: i64 = row.try_get("file_size")?;
    let status: String = row.try_get("status")?;
    Ok(BackupJob {
        id: row.try_get("id")?,
        db_type: row.try_get("db_type")?,
        host: row.try_get("host")?,
        port: port.and_then(|p| u16::try_from(p).ok()),
        database: row.try_get("database_name")?,
        username: row.try_get("username")?,
        file_path: row.try_get("file_path")?,
        object_key: row.try_get("object_key")?,
        file_size: u64::try_from(file_size).unwrap_or_default(),
        status: parse_status(&status)?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn config_from_row(row: &PgRow) -> StoreResult<DatabaseConfig> {
    let connection: Json<Connection> = row.try_get("connection")?;
    Ok(DatabaseConfig {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        db_type: row.try_get("db_type")?,
        connection: connection.0,
        cron_expression: row.try_get("cron_expression")?,
        is_active: row.try_get("is_active")?,
        webhook_url: row.try_get("webhook_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn push_date_range(
    qb: &mut QueryBuilder<'_, Postgres>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) {
    if let Some(from) = from {
        qb.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = to {
        qb.push(" AND created_at <= ").push_bind(to);
    }
}

fn push_job_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &JobQuery) {
    qb.push(" WHERE TRUE");
    if !query.statuses.is_empty() {
        let statuses: Vec<String> = query.statuses.iter().map(|s| s.as_str().to_string()).collect();
        qb.push(" AND status = ANY(").push_bind(statuses).push(")");
    }
    if !query.types.is_empty() {
        qb.push(" AND db_type = ANY(").push_bind(query.canonical_types()).push(")");
    }
    if let Some(term) = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", escape_like(term));
        qb.push(" AND (host ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR database_name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR db_type ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    push_date_range(qb, query.created_from, query.created_to);
}

fn order_clause(query: &JobQuery) -> String {
    let column = match query.sort {
        SortField::CreatedAt => "created_at",
        SortField::FileSize => "file_size",
        SortField::Status => "status",
    };
    let direction = match query.direction {
        SortDirection::Asc => "ASC",
        SortDirection::Desc => "DESC",
    };
    format!(" ORDER BY {} {}, id {}", column, direction, direction)
}

async fn grouped_counts(
    pool: &PgPool,
    column: &str,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> StoreResult<Vec<(String, u64)>> {
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "SELECT {} AS key, COUNT(*) AS count FROM backup_jobs WHERE TRUE",
        column
    ));
    push_date_range(&mut qb, from, to);
    qb.push(format!(" GROUP BY {}", column));
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter()
        .map(|row| -> StoreResult<(String, u64)> {
            let key: String = row.try_get("key")?;
            let count: i64 = row.try_get("count")?;
            Ok((key, u64::try_from(count).unwrap_or_default()))
        })
        .collect()
}

#[async_trait]
impl MetadataStore for PgStore {
    async fn create_job(&self, job: &BackupJob) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO backup_jobs (id, db_type, host, port, database_name, username, file_path, \
             object_key, file_size, status, error, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(&job.id)
        .bind(&job.db_type)
        .bind(&job.host)
        .bind(job.port.map(i32::from))
        .bind(&job.database)
        .bind(&job.username)
        .bind(&job.file_path)
        .bind(&job.object_key)
        .bind(i64::try_from(job.file_size).unwrap_or(i64::MAX))
        .bind(job.status.as_str())
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> StoreResult<Option<BackupJob>> {
        let row = sqlx::query("SELECT * FROM backup_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn update_status(&self, id: &str, status: JobStatus, error: Option<&str>) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE backup_jobs SET status = $1, error = $2, updated_at = $3 \
             WHERE id = $4 AND status = ANY($5)",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .bind(predecessor_tags(status))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, status).await);
        }
        Ok(())
    }

    async fn update_artifact(&self, id: &str, update: &ArtifactUpdate) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE backup_jobs SET file_path = $1, object_key = $2, file_size = $3, status = $4, \
             error = $5, updated_at = $6 WHERE id = $7 AND status = ANY($8)",
        )
        .bind(&update.file_path)
        .bind(&update.object_key)
        .bind(i64::try_from(update.file_size).unwrap_or(i64::MAX))
        .bind(update.status.as_str())
        .bind(&update.error)
        .bind(Utc::now())
        .bind(id)
        .bind(predecessor_tags(update.status))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, update.status).await);
        }
        Ok(())
    }

    async fn list_jobs(&self, query: &JobQuery) -> StoreResult<Page<BackupJob>> {
        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM backup_jobs");
        push_job_filters(&mut count_qb, query);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM backup_jobs");
        push_job_filters(&mut qb, query);
        qb.push(order_clause(query));
        qb.push(" LIMIT ")
            .push_bind(i64::from(query.pagination.limit))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.pagination.offset()).unwrap_or(i64::MAX));
        let rows = qb.build().fetch_all(&self.pool).await?;

        Ok(Page {
            items: rows.iter().map(job_from_row).collect::<StoreResult<_>>()?,
            total: u64::try_from(total).unwrap_or_default(),
            page: query.pagination.page,
            limit: query.pagination.limit,
        })
    }

    async fn delete_job(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM backup_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn job_stats(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<JobStats> {
        let by_type = grouped_counts(&self.pool, "db_type", from, to).await?;
        let by_status = grouped_counts(&self.pool, "status", from, to).await?;
        Ok(JobStats {
            total: by_type.iter().map(|(_, n)| n).sum(),
            by_type: by_type.into_iter().collect(),
            by_status: by_status.into_iter().collect(),
        })
    }

    async fn create_config(&self, config: &DatabaseConfig) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO database_configs (id, name, db_type, connection, cron_expression, \
             is_active, webhook_url, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&config.id)
        .bind(&config.name)
        .bind(&config.db_type)
        .bind(Json(&config.connection))
        .bind(&config.cron_expression)
        .bind(config.is_active)
        .bind(&config.webhook_url)
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_config(&self, id: &str) -> StoreResult<Option<DatabaseConfig>> {
        let row = sqlx::query("SELECT * FROM database_configs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(config_from_row).transpose()
    }

    async fn list_configs(&self, pagination: Pagination) -> StoreResult<Page<DatabaseConfig>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM database_configs")
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query(
            "SELECT * FROM database_configs ORDER BY created_at DESC, id LIMIT $1 OFFSET $2",
        )
        .bind(i64::from(pagination.limit))
        .bind(i64::try_from(pagination.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: rows.iter().map(config_from_row).collect::<StoreResult<_>>()?,
            total: u64::try_from(total).unwrap_or_default(),
            page: pagination.page,
            limit: pagination.limit,
        })
    }

    async fn update_config(&self, config: &DatabaseConfig) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE database_configs SET name = $1, db_type = $2, connection = $3, \
             cron_expression = $4, is_active = $5, webhook_url = $6, updated_at = $7 WHERE id = $8",
        )
        .bind(&config.name)
        .bind(&config.db_type)
        .bind(Json(&config.connection))
        .bind(&config.cron_expression)
        .bind(config.is_active)
        .bind(&config.webhook_url)
        .bind(Utc::now())
        .bind(&config.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(config.id.clone()));
        }
        Ok(())
    }

    async fn delete_config(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM database_configs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
