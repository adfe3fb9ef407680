use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use tracing::info;

use super::{
    Contest, ContestQuestion, ProvisioningRecord, Question, QuestionCatalog, RecordStore, Team,
    TeamDirectory,
};
use crate::config::DatabaseSettings;
use crate::core::credentials::AccessCredential;
use crate::core::vm::{ContestId, ProvisioningKey, QuestionId, TeamId, VmId};
use crate::errors::{StoreError, StoreResult};

#[derive(Debug, sqlx::FromRow)]
struct ContestRow {
    id: ContestId,
    name: String,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct TeamRow {
    id: TeamId,
    name: String,
}

#[derive(Debug, sqlx::FromRow)]
struct SshKeyRow {
    team_id: TeamId,
    public_key: String,
}

#[derive(Debug, sqlx::FromRow)]
struct QuestionRow {
    id: QuestionId,
    name: String,
    category: String,
    description: String,
    template_vmid: VmId,
    answer: String,
    base_point: u32,
    cpu_cores: Option<u32>,
    memory_mb: Option<u64>,
    disk_gb: Option<u64>,
    ip: Option<String>,
    gateway: Option<String>,
    point: u32,
}

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    contest_id: ContestId,
    team_id: TeamId,
    question_id: QuestionId,
    vmid: VmId,
    node: String,
    access: String,
    filename: String,
    created_at: DateTime<Utc>,
}

impl From<RecordRow> for ProvisioningRecord {
    fn from(row: RecordRow) -> Self {
        ProvisioningRecord {
            key: ProvisioningKey::new(row.contest_id, row.team_id, row.question_id),
            vmid: row.vmid,
            node: row.node,
            access: AccessCredential::new(row.access),
            filename: row.filename,
            created_at: row.created_at,
            ips: Default::default(),
        }
    }
}

const RECORD_COLUMNS: &str =
    "contest_id, team_id, question_id, vmid, node, access, filename, created_at";

/// MySQL-backed store.
#[derive(Debug, Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub async fn connect(settings: &DatabaseSettings) -> StoreResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .connect(&settings.url)
            .await?;
        let store = Self { pool };
        if settings.run_migrations {
            store.migrate().await?;
        }
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!().run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl TeamDirectory for MySqlStore {
    async fn contest_teams(&self, contest_id: ContestId) -> StoreResult<Vec<Team>> {
        let teams: Vec<TeamRow> = sqlx::query_as(
            "SELECT t.id, t.name
               FROM teams t
               JOIN contest_teams ct ON ct.team_id = t.id
              WHERE ct.contest_id = ?
              ORDER BY t.id",
        )
        .bind(contest_id)
        .fetch_all(&self.pool)
        .await?;

        let keys: Vec<SshKeyRow> = sqlx::query_as(
            "SELECT k.team_id, k.public_key
               FROM team_ssh_keys k
               JOIN contest_teams ct ON ct.team_id = k.team_id
              WHERE ct.contest_id = ?
              ORDER BY k.id",
        )
        .bind(contest_id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_team: HashMap<TeamId, Vec<String>> = HashMap::new();
        for key in keys {
            by_team.entry(key.team_id).or_default().push(key.public_key);
        }

        Ok(teams
            .into_iter()
            .map(|row| Team {
                ssh_keys: by_team.remove(&row.id).unwrap_or_default(),
                id: row.id,
                name: row.name,
            })
            .collect())
    }
}

#[async_trait]
impl QuestionCatalog for MySqlStore {
    async fn contest(&self, contest_id: ContestId) -> StoreResult<Option<Contest>> {
        let row: Option<ContestRow> =
            sqlx::query_as("SELECT id, name, starts_at, ends_at FROM contests WHERE id = ?")
                .bind(contest_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|row| Contest {
            id: row.id,
            name: row.name,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
        }))
    }

    async fn contest_questions(&self, contest_id: ContestId) -> StoreResult<Vec<ContestQuestion>> {
        let rows: Vec<QuestionRow> = sqlx::query_as(
            "SELECT q.id, q.name, c.name AS category, q.description, q.template_vmid, q.answer,
                    q.base_point, q.cpu_cores, q.memory_mb, q.disk_gb, q.ip, q.gateway,
                    cq.point
               FROM contest_questions cq
               JOIN questions q ON q.id = cq.question_id
               JOIN categories c ON c.id = q.category_id
              WHERE cq.contest_id = ?
              ORDER BY q.id",
        )
        .bind(contest_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ContestQuestion {
                point: row.point,
                question: Question {
                    id: row.id,
                    name: row.name,
                    category: row.category,
                    description: row.description,
                    template_vmid: row.template_vmid,
                    answer: row.answer,
                    base_point: row.base_point,
                    cpu_cores: row.cpu_cores,
                    memory_mb: row.memory_mb,
                    disk_gb: row.disk_gb,
                    ip: row.ip,
                    gateway: row.gateway,
                },
            })
            .collect())
    }
}

#[async_trait]
impl RecordStore for MySqlStore {
    async fn record(&self, key: &ProvisioningKey) -> StoreResult<Option<ProvisioningRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM provisioning_records
              WHERE contest_id = ? AND team_id = ? AND question_id = ?"
        ))
        .bind(key.contest_id)
        .bind(key.team_id)
        .bind(key.question_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ProvisioningRecord::from))
    }

    async fn insert_record(&self, record: &ProvisioningRecord) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO provisioning_records ({RECORD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(record.key.contest_id)
        .bind(record.key.team_id)
        .bind(record.key.question_id)
        .bind(record.vmid)
        .bind(&record.node)
        .bind(record.access.expose())
        .bind(&record.filename)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::DuplicateRecord(record.key)
            }
            e => StoreError::Database(e),
        })?;
        Ok(())
    }

    async fn delete_record(&self, key: &ProvisioningKey) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM provisioning_records
              WHERE contest_id = ? AND team_id = ? AND question_id = ?",
        )
        .bind(key.contest_id)
        .bind(key.team_id)
        .bind(key.question_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn records_by_contest(
        &self,
        contest_id: ContestId,
    ) -> StoreResult<Vec<ProvisioningRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM provisioning_records
              WHERE contest_id = ?
              ORDER BY team_id, question_id"
        ))
        .bind(contest_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ProvisioningRecord::from).collect())
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn records_pin_their_contest_question_and_team() {
        let migrator = sqlx::migrate!();
        let schema: String = migrator.iter().map(|m| m.sql.as_ref()).collect();
        for reference in [
            "REFERENCES contests (id) ON DELETE RESTRICT",
            "REFERENCES contest_questions (contest_id, question_id) ON DELETE RESTRICT",
            "REFERENCES teams (id) ON DELETE RESTRICT",
        ] {
            assert!(schema.contains(reference), "missing {reference}");
        }
    }
}
