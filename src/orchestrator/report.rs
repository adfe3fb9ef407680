use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::core::vm::{ContestId, ProvisioningKey, VmId, VmRef};
use crate::errors::{RangeError, RangeResult};
use crate::provisioning::ProvisionOutcome;
use crate::store::ProvisioningRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PairOutcome {
    Provisioned { vmid: VmId, node: String },
    AlreadyProvisioned { vmid: VmId, recorded: bool },
    InFlight,
    Cancelled,
    Failed { error: String },
}

impl From<ProvisionOutcome> for PairOutcome {
    fn from(outcome: ProvisionOutcome) -> Self {
        match outcome {
            ProvisionOutcome::Provisioned { record } => PairOutcome::Provisioned {
                vmid: record.vmid,
                node: record.node,
            },
            ProvisionOutcome::AlreadyProvisioned { vmid, record } => {
                PairOutcome::AlreadyProvisioned {
                    vmid,
                    recorded: record.is_some(),
                }
            }
            ProvisionOutcome::InFlight => PairOutcome::InFlight,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PairReport {
    #[serde(flatten)]
    pub key: ProvisioningKey,
    #[serde(flatten)]
    pub outcome: PairOutcome,
}

/// Per-pair result of a start run. Partial success is normal.
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub run_id: Uuid,
    pub contest_id: ContestId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pairs: Vec<PairReport>,
}

impl StartReport {
    pub fn begin(contest_id: ContestId) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            contest_id,
            started_at: now,
            finished_at: now,
            pairs: Vec::new(),
        }
    }

    pub fn finish(mut self) -> Self {
        self.pairs.sort_by_key(|pair| pair.key);
        self.finished_at = Utc::now();
        self
    }

    pub fn total(&self) -> usize {
        self.pairs.len()
    }

    pub fn count(&self, matches: impl Fn(&PairOutcome) -> bool) -> usize {
        self.pairs.iter().filter(|pair| matches(&pair.outcome)).count()
    }

    pub fn provisioned(&self) -> usize {
        self.count(|o| matches!(o, PairOutcome::Provisioned { .. }))
    }

    pub fn already_provisioned(&self) -> usize {
        self.count(|o| matches!(o, PairOutcome::AlreadyProvisioned { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, PairOutcome::Failed { .. }))
    }

    pub fn outcome(&self, key: &ProvisioningKey) -> Option<&PairOutcome> {
        self.pairs
            .iter()
            .find(|pair| &pair.key == key)
            .map(|pair| &pair.outcome)
    }

    /// Collapses the report into the aggregate error callers that want a
    /// single pass/fail can use.
    pub fn ensure_success(&self) -> RangeResult<()> {
        match self.failed() {
            0 => Ok(()),
            failed => Err(RangeError::PairsFailed {
                failed,
                total: self.total(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VmOutcome {
    Removed,
    AlreadyGone,
    Failed { error: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct VmReport {
    pub name: String,
    pub vmid: VmId,
    pub node: Option<String>,
    #[serde(flatten)]
    pub outcome: VmOutcome,
}

impl VmReport {
    pub fn for_record(record: &ProvisioningRecord, outcome: VmOutcome) -> Self {
        Self {
            name: record.key.name(),
            vmid: record.vmid,
            node: Some(record.node.clone()),
            outcome,
        }
    }

    pub fn for_vm(name: &str, vm: &VmRef, outcome: VmOutcome) -> Self {
        Self {
            name: name.to_string(),
            vmid: vm.vmid,
            node: Some(vm.node.clone()),
            outcome,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TeardownReport {
    pub run_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contest_id: Option<ContestId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub vms: Vec<VmReport>,
}

impl TeardownReport {
    pub fn begin() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            contest_id: None,
            started_at: now,
            finished_at: now,
            vms: Vec::new(),
        }
    }

    pub fn finish(mut self) -> Self {
        self.vms.sort_by_key(|vm| vm.vmid);
        self.finished_at = Utc::now();
        self
    }

    pub fn removed(&self) -> usize {
        self.vms
            .iter()
            .filter(|vm| matches!(vm.outcome, VmOutcome::Removed | VmOutcome::AlreadyGone))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.vms
            .iter()
            .filter(|vm| matches!(vm.outcome, VmOutcome::Failed { .. }))
            .count()
    }
}
