use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterSnapshot, NodeSelector};
use crate::config::ProvisioningSettings;
use crate::core::cloudinit::{CloudInitBuilder, CloudInitDocument};
use crate::core::credentials::CredentialGenerator;
use crate::core::proxmox::HypervisorClient;
use crate::core::snippets::SnippetStorage;
use crate::core::vm::{
    CloneRequest, ClusterResource, ContestId, ProvisioningKey, ResourceRequest, VmEdit, VmId, VmRef,
};
use crate::errors::{HypervisorError, ProvisionError, ProvisionResult, RetryPolicy, Step};
use crate::store::{ContestQuestion, PersistenceStore, ProvisioningRecord, Question, Team};

/// Result of one `provision` call that did not fail.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProvisionOutcome {
    Provisioned { record: ProvisioningRecord },
    /// The cluster already has a VM with this name. `record` is `None` when
    /// the VM exists but its record was never written.
    AlreadyProvisioned {
        vmid: VmId,
        record: Option<ProvisioningRecord>,
    },
    /// Another run is provisioning the same key right now.
    InFlight,
}

/// Keys currently being provisioned in this process.
#[derive(Debug, Clone, Default)]
pub struct ClaimRegistry {
    claimed: Arc<Mutex<HashSet<ProvisioningKey>>>,
}

impl ClaimRegistry {
    pub fn try_claim(&self, key: ProvisioningKey) -> Option<Claim> {
        let mut claimed = self
            .claimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !claimed.insert(key) {
            return None;
        }
        Some(Claim {
            key,
            claimed: Arc::clone(&self.claimed),
        })
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct Claim {
    key: ProvisioningKey,
    claimed: Arc<Mutex<HashSet<ProvisioningKey>>>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut claimed = self
            .claimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        claimed.remove(&self.key);
    }
}

/// Turns a template into a running, configured VM for one key.
pub struct ProvisioningPipeline {
    hypervisor: Arc<dyn HypervisorClient>,
    snippets: Arc<dyn SnippetStorage>,
    store: Arc<dyn PersistenceStore>,
    selector: NodeSelector,
    claims: ClaimRegistry,
    credentials: CredentialGenerator,
    cloud_init: CloudInitBuilder,
    retry: RetryPolicy,
    settings: ProvisioningSettings,
}

impl ProvisioningPipeline {
    pub fn new(
        hypervisor: Arc<dyn HypervisorClient>,
        snippets: Arc<dyn SnippetStorage>,
        store: Arc<dyn PersistenceStore>,
        settings: &ProvisioningSettings,
    ) -> Self {
        Self {
            hypervisor,
            snippets,
            store,
            selector: NodeSelector::new(),
            claims: ClaimRegistry::default(),
            credentials: CredentialGenerator::new(settings.credential_length),
            cloud_init: CloudInitBuilder::from_settings(settings),
            retry: settings.retry_policy(),
            settings: settings.clone(),
        }
    }

    pub fn selector(&self) -> &NodeSelector {
        &self.selector
    }

    pub fn resource_request(&self, question: &Question) -> ResourceRequest {
        ResourceRequest {
            cpu_cores: question.cpu_cores.unwrap_or(self.settings.default_cores),
            memory_mb: question.memory_mb.unwrap_or(self.settings.default_memory_mb),
            disk_gb: question.disk_gb.unwrap_or(self.settings.default_disk_gb),
        }
    }

    pub async fn provision(
        &self,
        contest_id: ContestId,
        team: &Team,
        question: &ContestQuestion,
    ) -> ProvisionResult<ProvisionOutcome> {
        let question = &question.question;
        let key = ProvisioningKey::new(contest_id, team.id, question.id);
        let Some(_claim) = self.claims.try_claim(key) else {
            debug!(%key, "Already being provisioned by another run");
            return Ok(ProvisionOutcome::InFlight);
        };

        // The cluster is the source of truth for "does this exist".
        let snapshot = ClusterSnapshot::fetch(self.hypervisor.as_ref())
            .await
            .map_err(|source| ProvisionError::StepFailed {
                step: Step::Snapshot,
                attempts: 1,
                source,
            })?;
        let existing = self.store.record(&key).await?;

        if let Some(vm) = snapshot.vm_named(&key.name()) {
            let vmid = vm.vmid.unwrap_or_default();
            if existing.is_none() {
                warn!(%key, vmid, "VM exists without a provisioning record, leaving it alone");
            }
            return Ok(ProvisionOutcome::AlreadyProvisioned {
                vmid,
                record: existing,
            });
        }

        if let Some(stale) = existing {
            info!(%key, vmid = stale.vmid, "VM is gone, dropping stale record and re-provisioning");
            self.store.delete_record(&key).await?;
        }

        let credential = self.credentials.generate();
        let document = self.cloud_init.render(&key, &credential, &team.ssh_keys)?;
        self.snippets
            .stage(&document.filename, &document.contents)
            .await?;

        let vm = match self.build_vm(&key, question, &snapshot, &document).await {
            Ok(vm) => vm,
            Err(err) => {
                self.discard_snippet(&document.filename).await;
                return Err(err);
            }
        };

        let record = ProvisioningRecord {
            key,
            vmid: vm.vmid,
            node: vm.node,
            access: credential,
            filename: document.filename,
            created_at: Utc::now(),
            ips: Default::default(),
        };
        self.store.insert_record(&record).await?;

        info!(%key, vmid = record.vmid, node = %record.node, "🚀 VM provisioned");
        Ok(ProvisionOutcome::Provisioned { record })
    }

    /// Steps 4 to 8. On error nothing is left on the cluster, best-effort.
    async fn build_vm(
        &self,
        key: &ProvisioningKey,
        question: &Question,
        snapshot: &ClusterSnapshot,
        document: &CloudInitDocument,
    ) -> ProvisionResult<VmRef> {
        let request = self.resource_request(question);
        let lease = self.selector.select(self.hypervisor.as_ref(), &request).await?;
        let template = snapshot
            .locate(question.template_vmid)
            .ok_or(ProvisionError::TemplateNotFound {
                vmid: question.template_vmid,
            })?;

        let clone = CloneRequest {
            template,
            name: key.name(),
            target_node: lease.node().to_string(),
            linked: self.settings.linked_clone,
        };
        let vmid = match self.hypervisor.clone_vm(&clone).await {
            Ok(vmid) => vmid,
            Err(source) => {
                // A lost reply or a server-side failure may still leave the clone behind.
                if source.is_transient() {
                    self.reap_lost_clone(key).await;
                }
                return Err(ProvisionError::StepFailed {
                    step: Step::Clone,
                    attempts: 1,
                    source,
                });
            }
        };
        let vm = VmRef::new(lease.node(), vmid);

        let edit = self.vm_edit(question, &request, document);
        if let Err((step, err)) = self.finish_vm(&vm, question, &edit).await {
            self.rollback(&vm, step).await;
            return Err(err);
        }
        Ok(vm)
    }

    async fn finish_vm(
        &self,
        vm: &VmRef,
        question: &Question,
        edit: &VmEdit,
    ) -> Result<(), (Step, ProvisionError)> {
        let transient = HypervisorError::is_transient;

        self.retry
            .run("configure", transient, || self.hypervisor.configure_vm(vm, edit))
            .await
            .map_err(|e| (Step::Configure, ProvisionError::step(Step::Configure, e)))?;

        if let Some(size_gb) = question.disk_gb {
            let disk = self.settings.primary_disk.as_str();
            self.retry
                .run("resize", transient, || {
                    self.hypervisor.resize_disk(vm, disk, size_gb)
                })
                .await
                .map_err(|e| (Step::Resize, ProvisionError::step(Step::Resize, e)))?;
        }

        self.retry
            .run("boot", transient, || self.hypervisor.boot(vm))
            .await
            .map_err(|e| (Step::Boot, ProvisionError::step(Step::Boot, e)))?;
        Ok(())
    }

    fn vm_edit(
        &self,
        question: &Question,
        request: &ResourceRequest,
        document: &CloudInitDocument,
    ) -> VmEdit {
        let ipconfig0 = match (&question.ip, &question.gateway) {
            (Some(ip), Some(gateway)) => format!("ip={ip},gw={gateway}"),
            (Some(ip), None) => format!("ip={ip}"),
            _ => "ip=dhcp".to_string(),
        };
        VmEdit {
            cores: Some(request.cpu_cores),
            memory_mb: Some(request.memory_mb),
            cicustom: Some(format!(
                "user={}",
                self.snippets.volume_ref(&document.filename)
            )),
            ipconfig0: Some(ipconfig0),
            net0: self
                .settings
                .bridge
                .as_ref()
                .map(|bridge| format!("virtio,bridge={bridge}")),
        }
    }

    /// Deletes a half-built VM. Failures are logged and swallowed so the
    /// caller still reports the original error.
    async fn rollback(&self, vm: &VmRef, failed: Step) {
        warn!(vm = %vm, step = %failed, "Rolling back partially provisioned VM");

        // A boot that timed out may still have started the guest.
        if failed == Step::Boot {
            if let Err(e) = self.hypervisor.shutdown(vm).await {
                debug!(vm = %vm, error = %e, "Shutdown before rollback failed");
            }
        }

        match self
            .retry
            .run("rollback delete", HypervisorError::is_transient, || {
                self.hypervisor.delete_vm(vm)
            })
            .await
        {
            Ok(()) => info!(vm = %vm, "Rollback complete"),
            Err(e) => error!(
                vm = %vm,
                error = %e,
                "Rollback failed, VM must be removed by hand or by the sweep"
            ),
        }
    }

    /// Removes a VM carrying `key`'s name that a failed clone call created
    /// anyway, so the next run does not mistake it for a provisioned pair.
    async fn reap_lost_clone(&self, key: &ProvisioningKey) {
        let snapshot = match ClusterSnapshot::fetch(self.hypervisor.as_ref()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(%key, error = %e, "Cannot check for a VM left by the failed clone");
                return;
            }
        };
        match snapshot.vm_named(&key.name()).and_then(ClusterResource::vm_ref) {
            Some(vm) => self.rollback(&vm, Step::Clone).await,
            None => debug!(%key, "Failed clone left nothing behind"),
        }
    }

    async fn discard_snippet(&self, filename: &str) {
        if let Err(e) = self.snippets.remove(filename).await {
            warn!(filename, error = %e, "Failed to remove staged snippet");
        }
    }
}
