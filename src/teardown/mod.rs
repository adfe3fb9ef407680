use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::ClusterSnapshot;
use crate::config::ProvisioningSettings;
use crate::core::proxmox::HypervisorClient;
use crate::core::snippets::SnippetStorage;
use crate::core::vm::{ContestId, ProvisioningKey, VmPowerState, VmRef};
use crate::errors::{HypervisorError, RangeError, RangeResult, RetryExhausted, RetryPolicy};
use crate::orchestrator::report::{TeardownReport, VmOutcome, VmReport};
use crate::store::{PersistenceStore, ProvisioningRecord};

#[derive(Debug, Error)]
enum PowerWait {
    #[error("VM is still {0:?}")]
    StillUp(VmPowerState),
    #[error(transparent)]
    Hypervisor(HypervisorError),
}

impl PowerWait {
    fn keep_waiting(&self) -> bool {
        match self {
            PowerWait::StillUp(_) => true,
            PowerWait::Hypervisor(e) => e.is_transient(),
        }
    }
}

/// Shuts down and deletes manager-owned VMs, one independent unit per VM.
pub struct TeardownEngine {
    hypervisor: Arc<dyn HypervisorClient>,
    snippets: Arc<dyn SnippetStorage>,
    store: Arc<dyn PersistenceStore>,
    retry: RetryPolicy,
    stop_poll: RetryPolicy,
    concurrency: usize,
}

impl TeardownEngine {
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
            retry: settings.retry_policy(),
            stop_poll: settings.shutdown_poll_policy(),
            concurrency: settings.concurrency(),
        }
    }

    /// Removes every VM and record of a contest. A record is only dropped
    /// once its VM is confirmed gone.
    pub async fn stop_contest(
        &self,
        contest_id: ContestId,
        cancel: &CancellationToken,
    ) -> RangeResult<TeardownReport> {
        let mut report = TeardownReport::begin();
        let records = self.store.records_by_contest(contest_id).await?;
        if records.is_empty() {
            info!(contest_id, "Nothing to tear down");
            return Ok(report.finish());
        }
        let snapshot = ClusterSnapshot::fetch(self.hypervisor.as_ref()).await?;
        info!(contest_id, vms = records.len(), "Tearing down contest");

        report.vms = stream::iter(records)
            .map(|record| {
                let snapshot = &snapshot;
                async move {
                    if cancel.is_cancelled() {
                        return VmReport::for_record(&record, VmOutcome::Cancelled);
                    }
                    let outcome = self.remove_record(&record, snapshot).await;
                    VmReport::for_record(&record, outcome)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        Ok(report.finish())
    }

    async fn remove_record(&self, record: &ProvisioningRecord, snapshot: &ClusterSnapshot) -> VmOutcome {
        let key = record.key;
        let name = key.name();
        // The id may have been reused by an unrelated VM; only touch it if the name still matches.
        let located = snapshot
            .vm_by_id(record.vmid)
            .filter(|vm| vm.name.as_deref() == Some(name.as_str()))
            .and_then(|vm| vm.vm_ref());

        let outcome = match located {
            Some(vm) => match self.destroy_vm(&vm).await {
                Ok(()) => VmOutcome::Removed,
                Err(e) => {
                    error!(%key, vm = %vm, error = %e, "VM delete failed, keeping record");
                    return VmOutcome::Failed {
                        error: e.to_string(),
                    };
                }
            },
            None => {
                info!(%key, vmid = record.vmid, "VM already gone");
                VmOutcome::AlreadyGone
            }
        };

        self.discard_snippet(&record.filename).await;
        match self.store.delete_record(&key).await {
            Ok(_) => outcome,
            Err(e) => {
                error!(%key, error = %e, "Failed to delete provisioning record");
                VmOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Deletes every non-template VM whose name follows the provisioning
    /// convention, regardless of what the store says.
    pub async fn sweep(&self, cancel: &CancellationToken) -> RangeResult<TeardownReport> {
        let mut report = TeardownReport::begin();
        let snapshot = ClusterSnapshot::fetch(self.hypervisor.as_ref()).await?;
        let targets: Vec<(String, VmRef)> = snapshot
            .provisioned_vms()
            .filter_map(|vm| Some((vm.name.clone()?, vm.vm_ref()?)))
            .collect();
        warn!(vms = targets.len(), "💣 Sweeping all provisioned VMs");

        report.vms = stream::iter(targets)
            .map(|(name, vm)| async move {
                if cancel.is_cancelled() {
                    return VmReport::for_vm(&name, &vm, VmOutcome::Cancelled);
                }
                let outcome = match self.destroy_vm(&vm).await {
                    Ok(()) => {
                        self.forget(&name, &vm).await;
                        VmOutcome::Removed
                    }
                    Err(e) => {
                        error!(vm = %vm, name = %name, error = %e, "Sweep failed to delete VM");
                        VmOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                };
                VmReport::for_vm(&name, &vm, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        Ok(report.finish())
    }

    /// Drops the record and snippet matching a swept VM, if they point at it.
    async fn forget(&self, name: &str, vm: &VmRef) {
        let Some(key) = ProvisioningKey::parse(name) else {
            return;
        };
        match self.store.record(&key).await {
            Ok(Some(record)) if record.vmid == vm.vmid => {
                self.discard_snippet(&record.filename).await;
                if let Err(e) = self.store.delete_record(&key).await {
                    warn!(%key, error = %e, "Failed to delete record of swept VM");
                }
            }
            Ok(None) => self.discard_snippet(&key.snippet_filename()).await,
            // record belongs to a different VM with the same name
            Ok(Some(_)) => {}
            Err(e) => warn!(%key, error = %e, "Failed to look up record of swept VM"),
        }
    }

    /// Best-effort shutdown, wait for the guest to stop, then delete. The
    /// cluster refuses to destroy a running guest, so a failed shutdown falls
    /// back to a hard stop.
    pub async fn destroy_vm(&self, vm: &VmRef) -> RangeResult<()> {
        if self.power_off(vm).await.is_err() {
            debug!(vm = %vm, "No clean shutdown, forcing stop");
            if let Err(e) = self.hypervisor.force_stop(vm).await {
                warn!(vm = %vm, error = %e, "Forced stop failed, trying delete anyway");
            }
        }
        self.retry
            .run("delete", HypervisorError::is_transient, || {
                self.hypervisor.delete_vm(vm)
            })
            .await
            .map_err(|e| step_error(vm, e))?;
        info!(vm = %vm, "🗑️ VM deleted");
        Ok(())
    }

    /// Requests shutdown and polls until the VM reports stopped.
    pub async fn power_off(&self, vm: &VmRef) -> RangeResult<()> {
        if let Err(e) = self.hypervisor.shutdown(vm).await {
            warn!(vm = %vm, error = %e, "Shutdown request failed");
            return Err(RangeError::Step {
                vmid: vm.vmid,
                step: "shutdown".to_string(),
                attempts: 1,
                source: e,
            });
        }

        let waited = self
            .stop_poll
            .run("wait for stop", PowerWait::keep_waiting, || async {
                match self.hypervisor.vm_status(vm).await {
                    Ok(VmPowerState::Stopped) => Ok(()),
                    Ok(state) => Err(PowerWait::StillUp(state)),
                    Err(e) => Err(PowerWait::Hypervisor(e)),
                }
            })
            .await;

        match waited {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(vm = %vm, attempts = e.attempts, error = %e.source, "VM did not stop in time");
                let source = match e.source {
                    PowerWait::Hypervisor(source) => source,
                    PowerWait::StillUp(state) => HypervisorError::Timeout {
                        operation: format!("shutdown (still {state:?})"),
                    },
                };
                Err(RangeError::Step {
                    vmid: vm.vmid,
                    step: "shutdown".to_string(),
                    attempts: e.attempts,
                    source,
                })
            }
        }
    }

    async fn discard_snippet(&self, filename: &str) {
        if let Err(e) = self.snippets.remove(filename).await {
            warn!(filename, error = %e, "Failed to remove snippet");
        }
    }
}

fn step_error(vm: &VmRef, e: RetryExhausted<HypervisorError>) -> RangeError {
    RangeError::Step {
        vmid: vm.vmid,
        step: e.operation,
        attempts: e.attempts,
        source: e.source,
    }
}
