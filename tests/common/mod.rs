// Shared fixtures: an in-process Proxmox stand-in plus a seeded contest.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use tempfile::TempDir;

use ctf_range_manager::config::ProvisioningSettings;
use ctf_range_manager::core::proxmox::HypervisorClient;
use ctf_range_manager::core::snippets::{LocalSnippetStorage, SnippetStorage};
use ctf_range_manager::core::vm::{
    CloneRequest, ClusterResource, GuestInterface, GuestIpAddress, NodeStatus, VmEdit, VmId,
    VmPowerState, VmRef,
};
use ctf_range_manager::errors::{HypervisorError, HypervisorResult};
use ctf_range_manager::orchestrator::ContestOrchestrator;
use ctf_range_manager::provisioning::ProvisioningPipeline;
use ctf_range_manager::store::{
    Contest, ContestQuestion, MemoryStore, PersistenceStore, Question, QuestionCatalog, Team,
    TeamDirectory,
};

pub const CONTEST: u32 = 1;
pub const WEB_TEMPLATE: VmId = 9000;
pub const PWN_TEMPLATE: VmId = 9001;
pub const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FakeVm {
    pub vmid: VmId,
    pub name: String,
    pub node: String,
    pub status: VmPowerState,
    pub template: bool,
}

#[derive(Debug, Clone)]
struct FailureRule {
    op: &'static str,
    vmid: Option<VmId>,
    remaining: Option<u32>,
    status: u16,
}

#[derive(Debug, Default)]
struct State {
    nodes: Vec<serde_json::Value>,
    vms: BTreeMap<VmId, FakeVm>,
    next_vmid: VmId,
    calls: Vec<(&'static str, Option<VmId>)>,
    failures: Vec<FailureRule>,
    stubborn: HashSet<VmId>,
    edits: HashMap<VmId, VmEdit>,
    interfaces: HashMap<VmId, Vec<GuestInterface>>,
    lost_clone_replies: u32,
    delays: HashMap<&'static str, StdDuration>,
    begun: Vec<&'static str>,
}

/// Behaves like a two-node cluster: pve1 busier than pve2.
pub struct FakeHypervisor {
    state: Mutex<State>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        let state = State {
            nodes: vec![node_json("pve1", "online", 0.6), node_json("pve2", "online", 0.1)],
            next_vmid: 100,
            ..State::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn with_templates(self) -> Self {
        self.add_template(WEB_TEMPLATE, "web-base", "pve1");
        self.add_template(PWN_TEMPLATE, "pwn-base", "pve2");
        self
    }

    pub fn add_template(&self, vmid: VmId, name: &str, node: &str) {
        self.state().vms.insert(
            vmid,
            FakeVm {
                vmid,
                name: name.to_string(),
                node: node.to_string(),
                status: VmPowerState::Stopped,
                template: true,
            },
        );
    }

    pub fn add_vm(&self, name: &str, node: &str, status: VmPowerState) -> VmId {
        let mut state = self.state();
        let vmid = state.next_vmid;
        state.next_vmid += 1;
        state.vms.insert(
            vmid,
            FakeVm {
                vmid,
                name: name.to_string(),
                node: node.to_string(),
                status,
                template: false,
            },
        );
        vmid
    }

    /// Drops a VM behind the manager's back.
    pub fn remove_vm(&self, vmid: VmId) {
        self.state().vms.remove(&vmid);
    }

    pub fn set_node_status(&self, node: &str, status: &str) {
        let mut state = self.state();
        for entry in state.nodes.iter_mut() {
            if entry["node"] == node {
                entry["status"] = json!(status);
            }
        }
    }

    /// `op` fails with `status` on every call.
    pub fn fail(&self, op: &'static str, status: u16) {
        self.push_rule(op, None, None, status);
    }

    /// `op` fails with `status` for the next `times` calls.
    pub fn fail_times(&self, op: &'static str, times: u32, status: u16) {
        self.push_rule(op, None, Some(times), status);
    }

    /// `op` fails with `status` whenever it targets `vmid`.
    pub fn fail_for(&self, op: &'static str, vmid: VmId, status: u16) {
        self.push_rule(op, Some(vmid), None, status);
    }

    fn push_rule(&self, op: &'static str, vmid: Option<VmId>, remaining: Option<u32>, status: u16) {
        self.state().failures.push(FailureRule {
            op,
            vmid,
            remaining,
            status,
        });
    }

    /// The next `times` clones create the VM but the caller sees a timeout.
    pub fn lose_clone_replies(&self, times: u32) {
        self.state().lost_clone_replies = times;
    }

    /// Every `op` (boot or shutdown) takes `delay` before it lands.
    pub fn slow(&self, op: &'static str, delay: StdDuration) {
        self.state().delays.insert(op, delay);
    }

    /// Calls to a slowed `op` that have started, landed or not.
    pub fn begun(&self, op: &str) -> usize {
        self.state().begun.iter().filter(|name| **name == op).count()
    }

    async fn pause(&self, op: &'static str) {
        let delay = {
            let mut state = self.state();
            state.begun.push(op);
            state.delays.get(op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Shutdown requests are accepted but the guest never stops.
    pub fn make_stubborn(&self, vmid: VmId) {
        self.state().stubborn.insert(vmid);
    }

    pub fn set_interfaces(&self, vmid: VmId, interfaces: Vec<GuestInterface>) {
        self.state().interfaces.insert(vmid, interfaces);
    }

    pub fn vm(&self, vmid: VmId) -> Option<FakeVm> {
        self.state().vms.get(&vmid).cloned()
    }

    pub fn vm_named(&self, name: &str) -> Option<FakeVm> {
        self.state().vms.values().find(|vm| vm.name == name).cloned()
    }

    /// Non-template guests.
    pub fn vm_count(&self) -> usize {
        self.state().vms.values().filter(|vm| !vm.template).count()
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|(name, _)| *name == op).count()
    }

    pub fn calls_for(&self, op: &str, vmid: VmId) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|(name, target)| *name == op && *target == Some(vmid))
            .count()
    }

    pub fn last_edit(&self, vmid: VmId) -> Option<VmEdit> {
        self.state().edits.get(&vmid).cloned()
    }

    /// Records the call and applies any matching failure rule.
    fn enter(&self, op: &'static str, vmid: Option<VmId>) -> HypervisorResult<()> {
        let mut state = self.state();
        state.calls.push((op, vmid));
        let rule = state.failures.iter_mut().find(|rule| {
            rule.op == op
                && rule.remaining != Some(0)
                && (rule.vmid.is_none() || rule.vmid == vmid)
        });
        if let Some(rule) = rule {
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            return Err(HypervisorError::api(op, rule.status, "injected failure"));
        }
        Ok(())
    }

    fn with_vm<T>(
        &self,
        op: &'static str,
        vm: &VmRef,
        f: impl FnOnce(&mut FakeVm) -> T,
    ) -> HypervisorResult<T> {
        self.enter(op, Some(vm.vmid))?;
        let mut state = self.state();
        match state.vms.get_mut(&vm.vmid) {
            Some(found) => Ok(f(found)),
            None => Err(HypervisorError::api(
                op,
                500,
                format!("Configuration file 'nodes/{}/qemu-server/{}.conf' does not exist", vm.node, vm.vmid),
            )),
        }
    }
}

#[async_trait]
impl HypervisorClient for FakeHypervisor {
    async fn list_nodes(&self) -> HypervisorResult<Vec<NodeStatus>> {
        self.enter("nodes", None)?;
        let nodes = self.state().nodes.clone();
        Ok(nodes
            .into_iter()
            .map(|node| serde_json::from_value(node).unwrap())
            .collect())
    }

    async fn list_cluster_resources(&self) -> HypervisorResult<Vec<ClusterResource>> {
        self.enter("resources", None)?;
        let vms: Vec<FakeVm> = self.state().vms.values().cloned().collect();
        Ok(vms
            .iter()
            .map(|vm| {
                let status = match vm.status {
                    VmPowerState::Running => "running",
                    _ => "stopped",
                };
                serde_json::from_value(json!({
                    "id": format!("qemu/{}", vm.vmid),
                    "type": "qemu",
                    "name": vm.name,
                    "node": vm.node,
                    "vmid": vm.vmid,
                    "status": status,
                    "template": u8::from(vm.template),
                    "maxcpu": 2,
                    "maxmem": 2 * GIB,
                }))
                .unwrap()
            })
            .collect())
    }

    async fn clone_vm(&self, request: &CloneRequest) -> HypervisorResult<VmId> {
        self.enter("clone", Some(request.template.vmid))?;
        let mut state = self.state();
        if !state.vms.contains_key(&request.template.vmid) {
            return Err(HypervisorError::api("clone", 500, "template does not exist"));
        }
        let vmid = state.next_vmid;
        state.next_vmid += 1;
        state.vms.insert(
            vmid,
            FakeVm {
                vmid,
                name: request.name.clone(),
                node: request.target_node.clone(),
                status: VmPowerState::Stopped,
                template: false,
            },
        );
        if state.lost_clone_replies > 0 {
            state.lost_clone_replies -= 1;
            return Err(HypervisorError::Timeout {
                operation: "clone".to_string(),
            });
        }
        Ok(vmid)
    }

    async fn configure_vm(&self, vm: &VmRef, edit: &VmEdit) -> HypervisorResult<()> {
        self.with_vm("configure", vm, |_| ())?;
        self.state().edits.insert(vm.vmid, edit.clone());
        Ok(())
    }

    async fn resize_disk(&self, vm: &VmRef, _disk: &str, _size_gb: u64) -> HypervisorResult<()> {
        self.with_vm("resize", vm, |_| ())
    }

    async fn boot(&self, vm: &VmRef) -> HypervisorResult<()> {
        self.pause("boot").await;
        self.with_vm("boot", vm, |found| found.status = VmPowerState::Running)
    }

    async fn shutdown(&self, vm: &VmRef) -> HypervisorResult<()> {
        self.pause("shutdown").await;
        let stubborn = self.state().stubborn.contains(&vm.vmid);
        self.with_vm("shutdown", vm, |found| {
            if !stubborn {
                found.status = VmPowerState::Stopped;
            }
        })
    }

    async fn force_stop(&self, vm: &VmRef) -> HypervisorResult<()> {
        self.with_vm("stop", vm, |found| found.status = VmPowerState::Stopped)
    }

    async fn vm_status(&self, vm: &VmRef) -> HypervisorResult<VmPowerState> {
        self.with_vm("status", vm, |found| found.status.clone())
    }

    async fn delete_vm(&self, vm: &VmRef) -> HypervisorResult<()> {
        let running = self.with_vm("delete", vm, |found| found.status == VmPowerState::Running)?;
        if running {
            let message = format!("VM {} is running - destroy failed", vm.vmid);
            return Err(HypervisorError::api("delete", 500, message));
        }
        self.state().vms.remove(&vm.vmid);
        Ok(())
    }

    async fn templatize(&self, vm: &VmRef) -> HypervisorResult<()> {
        self.with_vm("template", vm, |found| found.template = true)
    }

    async fn guest_interfaces(&self, vm: &VmRef) -> HypervisorResult<Vec<GuestInterface>> {
        self.with_vm("agent", vm, |_| ())?;
        Ok(self
            .state()
            .interfaces
            .get(&vm.vmid)
            .cloned()
            .unwrap_or_default())
    }
}

fn node_json(name: &str, status: &str, cpu: f64) -> serde_json::Value {
    json!({
        "node": name,
        "status": status,
        "cpu": cpu,
        "maxcpu": 16,
        "mem": 8 * GIB,
        "maxmem": 64 * GIB,
        "disk": 10 * GIB,
        "maxdisk": 500 * GIB,
    })
}

pub fn interface(name: &str, ip: &str) -> GuestInterface {
    GuestInterface {
        name: name.to_string(),
        hardware_address: Some("bc:24:11:00:00:01".to_string()),
        ip_addresses: vec![GuestIpAddress {
            ip_address: ip.to_string(),
            ip_address_type: "ipv4".to_string(),
            prefix: Some(24),
        }],
    }
}

/// Production defaults with millisecond waits.
pub fn fast_settings() -> ProvisioningSettings {
    ProvisioningSettings {
        retry_delay_ms: 1,
        shutdown_poll_attempts: 3,
        shutdown_poll_delay_ms: 1,
        ..ProvisioningSettings::default()
    }
}

pub fn question(id: u32, template_vmid: VmId) -> Question {
    Question {
        id,
        name: format!("question-{id}"),
        category: "web".to_string(),
        description: String::new(),
        template_vmid,
        answer: "flag{test}".to_string(),
        base_point: 100,
        cpu_cores: None,
        memory_mb: None,
        disk_gb: None,
        ip: None,
        gateway: None,
    }
}

/// Contest 1: teams 1 and 2, question 10 (web) and 11 (pwn, 20 GB disk).
pub async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    store
        .add_contest(Contest {
            id: CONTEST,
            name: "finals".to_string(),
            starts_at: now,
            ends_at: now + Duration::hours(8),
        })
        .await;
    for (id, name) in [(1, "blue"), (2, "red")] {
        store
            .add_team(Team {
                id,
                name: name.to_string(),
                ssh_keys: vec![format!("ssh-ed25519 AAAA{name} {name}@ctf")],
            })
            .await;
        store.assign_team(CONTEST, id).await;
    }

    store.add_question(question(10, WEB_TEMPLATE)).await;
    store
        .add_question(Question {
            disk_gb: Some(20),
            ip: Some("10.10.0.11/24".to_string()),
            gateway: Some("10.10.0.1".to_string()),
            ..question(11, PWN_TEMPLATE)
        })
        .await;
    store.assign_question(CONTEST, 10, 100).await;
    store.assign_question(CONTEST, 11, 300).await;
    store
}

pub struct Harness {
    pub hv: Arc<FakeHypervisor>,
    pub store: Arc<MemoryStore>,
    pub snippets: Arc<LocalSnippetStorage>,
    pub snippet_dir: TempDir,
    pub settings: ProvisioningSettings,
}

impl Harness {
    pub async fn new() -> Self {
        let snippet_dir = tempfile::tempdir().unwrap();
        Self {
            hv: Arc::new(FakeHypervisor::new().with_templates()),
            store: seeded_store().await,
            snippets: Arc::new(LocalSnippetStorage::new("local", snippet_dir.path())),
            snippet_dir,
            settings: fast_settings(),
        }
    }

    fn parts(
        &self,
    ) -> (
        Arc<dyn HypervisorClient>,
        Arc<dyn SnippetStorage>,
        Arc<dyn PersistenceStore>,
    ) {
        let hv: Arc<dyn HypervisorClient> = self.hv.clone();
        let snippets: Arc<dyn SnippetStorage> = self.snippets.clone();
        let store: Arc<dyn PersistenceStore> = self.store.clone();
        (hv, snippets, store)
    }

    pub fn pipeline(&self) -> ProvisioningPipeline {
        let (hv, snippets, store) = self.parts();
        ProvisioningPipeline::new(hv, snippets, store, &self.settings)
    }

    pub fn orchestrator(&self) -> ContestOrchestrator {
        let (hv, snippets, store) = self.parts();
        ContestOrchestrator::new(hv, snippets, store, &self.settings)
    }

    pub fn snippet_exists(&self, filename: &str) -> bool {
        self.snippet_dir.path().join(filename).exists()
    }

    pub async fn team(&self, id: u32) -> Team {
        self.store
            .contest_teams(CONTEST)
            .await
            .unwrap()
            .into_iter()
            .find(|team| team.id == id)
            .unwrap()
    }

    pub async fn question(&self, id: u32) -> ContestQuestion {
        self.store
            .contest_questions(CONTEST)
            .await
            .unwrap()
            .into_iter()
            .find(|q| q.question.id == id)
            .unwrap()
    }
}
