use thiserror::Error;

use crate::core::vm::{ContestId, ProvisioningKey, QuestionId, TeamId, VmId};

pub mod retry;

pub use retry::{Backoff, RetryExhausted, RetryPolicy};

pub type HypervisorResult<T> = Result<T, HypervisorError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type ProvisionResult<T> = Result<T, ProvisionError>;
pub type RangeResult<T> = Result<T, RangeError>;

/// Failures talking to the Proxmox control plane.
#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("Hypervisor transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Hypervisor request timed out: {operation}")]
    Timeout { operation: String },

    #[error("Hypervisor rejected {operation} with HTTP {status}: {message}")]
    Api {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("Unexpected hypervisor response for {operation}: {message}")]
    Decode { operation: String, message: String },

    #[error("Hypervisor client misconfigured: {0}")]
    Config(String),
}

impl HypervisorError {
    pub fn api(operation: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            operation: operation.into(),
            status,
            message: message.into(),
        }
    }

    /// Whether a retry has any chance of succeeding. The API is treated as
    /// flaky unless the status code says the request itself is wrong.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout { .. } => true,
            Self::Api { status, .. } => !matches!(status, 400 | 401 | 403 | 404 | 501),
            Self::Decode { .. } | Self::Config(_) => false,
        }
    }
}

impl From<reqwest::Error> for HypervisorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            let operation = err
                .url()
                .map(|url| url.path().to_string())
                .unwrap_or_else(|| "request".to_string());
            Self::Timeout { operation }
        } else if err.is_decode() {
            Self::Decode {
                operation: "response body".to_string(),
                message: err.to_string(),
            }
        } else {
            Self::Transport(err)
        }
    }
}

/// Failures staging or removing cloud-init snippets.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Snippet I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    RemoteCommand {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Invalid snippet filename: {0:?}")]
    InvalidFilename(String),

    #[error("Failed to render cloud-init document: {0}")]
    Render(#[from] serde_yaml::Error),
}

/// Failures of the persistence layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Provisioning record already exists for {0}")]
    DuplicateRecord(ProvisioningKey),
}

/// Pipeline step names, used in logs and fatal step errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Snapshot,
    Clone,
    Configure,
    Resize,
    Boot,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::Snapshot => "snapshot",
            Step::Clone => "clone",
            Step::Configure => "configure",
            Step::Resize => "resize",
            Step::Boot => "boot",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("No node can host {cores} cores / {memory_mb} MB / {disk_gb} GB")]
    NoCapacity {
        cores: u32,
        memory_mb: u64,
        disk_gb: u64,
    },

    #[error("Template VM {vmid} not found on the cluster")]
    TemplateNotFound { vmid: VmId },

    #[error("{step} step failed after {attempts} attempt(s): {source}")]
    StepFailed {
        step: Step,
        attempts: u32,
        #[source]
        source: HypervisorError,
    },

    #[error("Snippet storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ProvisionError {
    pub fn step(step: Step, err: RetryExhausted<HypervisorError>) -> Self {
        Self::StepFailed {
            step,
            attempts: err.attempts,
            source: err.source,
        }
    }

    /// Capacity and missing templates are configuration problems, not flakiness.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::StepFailed { source, .. } => source.is_transient(),
            Self::NoCapacity { .. } | Self::TemplateNotFound { .. } => false,
            Self::Storage(_) | Self::Store(_) => false,
        }
    }
}

/// Errors surfaced by the orchestrator to the API and CLI.
#[derive(Error, Debug)]
pub enum RangeError {
    #[error("Contest {0} not found")]
    ContestNotFound(ContestId),

    #[error("No provisioning record for contest {contest_id}, team {team_id}, question {question_id}")]
    RecordNotFound {
        contest_id: ContestId,
        team_id: TeamId,
        question_id: QuestionId,
    },

    #[error("VM {0} not found on the cluster")]
    VmNotFound(VmId),

    #[error("A {kind} run is already in progress for contest {contest_id}")]
    RunInProgress { contest_id: ContestId, kind: String },

    #[error("{failed} of {total} pairs failed")]
    PairsFailed { failed: usize, total: usize },

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("VM {vmid} {step} failed after {attempts} attempt(s): {source}")]
    Step {
        vmid: VmId,
        step: String,
        attempts: u32,
        #[source]
        source: HypervisorError,
    },
}

impl RangeError {
    pub fn record_not_found(key: &ProvisioningKey) -> Self {
        RangeError::RecordNotFound {
            contest_id: key.contest_id,
            team_id: key.team_id,
            question_id: key.question_id,
        }
    }
}
