use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::credentials::AccessCredential;
use crate::core::vm::{ContestId, ProvisioningKey, QuestionId, TeamId, VmId};
use crate::errors::StoreResult;

pub mod memory;
pub mod mysql;

pub use memory::MemoryStore;
pub use mysql::MySqlStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contest {
    pub id: ContestId,
    pub name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub name: String,
    pub category: String,
    pub description: String,
    /// Template VM cloned for every team.
    pub template_vmid: VmId,
    #[serde(skip_serializing, default)]
    pub answer: String,
    pub base_point: u32,
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub disk_gb: Option<u64>,
    /// Static address in CIDR form; DHCP when absent.
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
}

/// A question as assigned to one contest, with its point value there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestQuestion {
    #[serde(flatten)]
    pub question: Question,
    pub point: u32,
}

/// Which VM, node and credentials belong to a (contest, team, question).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRecord {
    #[serde(flatten)]
    pub key: ProvisioningKey,
    pub vmid: VmId,
    pub node: String,
    pub access: AccessCredential,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    /// Guest addresses by interface. Filled on read, never stored.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ips: BTreeMap<String, Vec<String>>,
}

#[async_trait]
pub trait TeamDirectory: Send + Sync {
    async fn contest_teams(&self, contest_id: ContestId) -> StoreResult<Vec<Team>>;
}

#[async_trait]
pub trait QuestionCatalog: Send + Sync {
    async fn contest(&self, contest_id: ContestId) -> StoreResult<Option<Contest>>;

    async fn contest_questions(&self, contest_id: ContestId) -> StoreResult<Vec<ContestQuestion>>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn record(&self, key: &ProvisioningKey) -> StoreResult<Option<ProvisioningRecord>>;

    /// Fails with `DuplicateRecord` if the key is taken.
    async fn insert_record(&self, record: &ProvisioningRecord) -> StoreResult<()>;

    /// Returns whether a record was removed.
    async fn delete_record(&self, key: &ProvisioningKey) -> StoreResult<bool>;

    async fn records_by_contest(&self, contest_id: ContestId)
        -> StoreResult<Vec<ProvisioningRecord>>;
}

pub trait PersistenceStore: TeamDirectory + QuestionCatalog + RecordStore {}

impl<T> PersistenceStore for T where T: TeamDirectory + QuestionCatalog + RecordStore {}
