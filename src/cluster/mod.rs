use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::core::proxmox::HypervisorClient;
use crate::core::vm::{is_provisioning_name, ClusterResource, NodeStatus, ResourceRequest, VmId, VmRef};
use crate::errors::{HypervisorResult, ProvisionError, ProvisionResult, Step};

/// Point-in-time view of the cluster. Never cached across decisions.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    pub taken_at: DateTime<Utc>,
    pub nodes: Vec<NodeStatus>,
    pub resources: Vec<ClusterResource>,
}

impl ClusterSnapshot {
    pub async fn fetch(hypervisor: &dyn HypervisorClient) -> HypervisorResult<Self> {
        let (nodes, resources) =
            tokio::try_join!(hypervisor.list_nodes(), hypervisor.list_cluster_resources())?;
        Ok(Self {
            taken_at: Utc::now(),
            nodes,
            resources,
        })
    }

    pub fn vms(&self) -> impl Iterator<Item = &ClusterResource> {
        self.resources.iter().filter(|r| r.is_vm())
    }

    pub fn vm_named(&self, name: &str) -> Option<&ClusterResource> {
        self.vms().find(|vm| vm.name.as_deref() == Some(name))
    }

    pub fn vm_by_id(&self, vmid: VmId) -> Option<&ClusterResource> {
        self.vms().find(|vm| vm.vmid == Some(vmid))
    }

    /// Current node of a VM or template.
    pub fn locate(&self, vmid: VmId) -> Option<VmRef> {
        self.vm_by_id(vmid).and_then(ClusterResource::vm_ref)
    }

    /// Non-template VMs whose name follows the provisioning convention.
    pub fn provisioned_vms(&self) -> impl Iterator<Item = &ClusterResource> {
        self.vms().filter(|vm| {
            !vm.is_template() && vm.name.as_deref().is_some_and(is_provisioning_name)
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reservation {
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

type Ledger = Arc<Mutex<HashMap<String, Reservation>>>;

fn lock(ledger: &Ledger) -> MutexGuard<'_, HashMap<String, Reservation>> {
    ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Picks the least CPU-loaded online node that can hold `request` once the
/// capacity already promised to in-flight pipelines is subtracted.
pub fn choose_node<'a>(
    nodes: &'a [NodeStatus],
    request: &ResourceRequest,
    reserved: &HashMap<String, Reservation>,
) -> Option<&'a NodeStatus> {
    nodes
        .iter()
        .filter(|node| node.is_online())
        .filter(|node| {
            let held = reserved.get(&node.node).copied().unwrap_or_default();
            node.maxcpu >= request.cpu_cores
                && node.free_memory_bytes().saturating_sub(held.memory_bytes)
                    >= request.memory_bytes()
                && node.free_disk_bytes().saturating_sub(held.disk_bytes) >= request.disk_bytes()
        })
        .min_by(|a, b| a.cpu.total_cmp(&b.cpu).then_with(|| a.node.cmp(&b.node)))
}

/// Serialises placement decisions so concurrent pipelines see each other's
/// pending VMs.
#[derive(Debug, Clone, Default)]
pub struct NodeSelector {
    ledger: Ledger,
}

impl NodeSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn select(
        &self,
        hypervisor: &dyn HypervisorClient,
        request: &ResourceRequest,
    ) -> ProvisionResult<NodeLease> {
        let nodes = hypervisor
            .list_nodes()
            .await
            .map_err(|source| ProvisionError::StepFailed {
                step: Step::Snapshot,
                attempts: 1,
                source,
            })?;
        self.select_from(&nodes, request)
    }

    pub fn select_from(
        &self,
        nodes: &[NodeStatus],
        request: &ResourceRequest,
    ) -> ProvisionResult<NodeLease> {
        let mut ledger = lock(&self.ledger);
        let node = choose_node(nodes, request, &ledger).ok_or(ProvisionError::NoCapacity {
            cores: request.cpu_cores,
            memory_mb: request.memory_mb,
            disk_gb: request.disk_gb,
        })?;

        let reservation = Reservation {
            memory_bytes: request.memory_bytes(),
            disk_bytes: request.disk_bytes(),
        };
        let held = ledger.entry(node.node.clone()).or_default();
        held.memory_bytes = held.memory_bytes.saturating_add(reservation.memory_bytes);
        held.disk_bytes = held.disk_bytes.saturating_add(reservation.disk_bytes);
        debug!(node = %node.node, cpu = node.cpu, "Node selected");

        Ok(NodeLease {
            node: node.node.clone(),
            reservation,
            ledger: Arc::clone(&self.ledger),
        })
    }

    pub fn reserved(&self, node: &str) -> Reservation {
        lock(&self.ledger).get(node).copied().unwrap_or_default()
    }
}

/// Capacity held on a node until the pipeline that asked for it is done.
#[derive(Debug)]
pub struct NodeLease {
    node: String,
    reservation: Reservation,
    ledger: Ledger,
}

impl NodeLease {
    pub fn node(&self) -> &str {
        &self.node
    }
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        let mut ledger = lock(&self.ledger);
        if let Some(held) = ledger.get_mut(&self.node) {
            held.memory_bytes = held.memory_bytes.saturating_sub(self.reservation.memory_bytes);
            held.disk_bytes = held.disk_bytes.saturating_sub(self.reservation.disk_bytes);
            if *held == Reservation::default() {
                ledger.remove(&self.node);
            }
        }
    }
}
