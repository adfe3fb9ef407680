use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::cluster::ClusterSnapshot;
use crate::config::ProvisioningSettings;
use crate::core::proxmox::HypervisorClient;
use crate::core::snippets::SnippetStorage;
use crate::core::vm::{ContestId, GuestInterface, ProvisioningKey, VmId, VmRef};
use crate::errors::{HypervisorError, RangeError, RangeResult, RetryPolicy};
use crate::provisioning::ProvisioningPipeline;
use crate::store::{ContestQuestion, PersistenceStore, ProvisioningRecord, Team};
use crate::teardown::TeardownEngine;

pub mod report;

pub use report::{PairOutcome, PairReport, StartReport, TeardownReport, VmOutcome, VmReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Start,
    Stop,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Start => f.write_str("start"),
            RunKind::Stop => f.write_str("stop"),
        }
    }
}

type Runs = Arc<Mutex<HashMap<ContestId, (RunKind, CancellationToken)>>>;

/// At most one start or stop run per contest at a time.
#[derive(Debug, Clone, Default)]
struct RunRegistry {
    runs: Runs,
}

impl RunRegistry {
    fn begin(
        &self,
        contest_id: ContestId,
        kind: RunKind,
        parent: &CancellationToken,
    ) -> RangeResult<RunGuard> {
        let mut runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((running, _)) = runs.get(&contest_id) {
            return Err(RangeError::RunInProgress {
                contest_id,
                kind: running.to_string(),
            });
        }
        let token = parent.child_token();
        runs.insert(contest_id, (kind, token.clone()));
        Ok(RunGuard {
            contest_id,
            token,
            runs: Arc::clone(&self.runs),
        })
    }

    fn cancel(&self, contest_id: ContestId) -> bool {
        let runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        match runs.get(&contest_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

struct RunGuard {
    contest_id: ContestId,
    token: CancellationToken,
    runs: Runs,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        runs.remove(&self.contest_id);
    }
}

/// Entry point for everything that touches contest VMs.
pub struct ContestOrchestrator {
    hypervisor: Arc<dyn HypervisorClient>,
    store: Arc<dyn PersistenceStore>,
    pipeline: ProvisioningPipeline,
    teardown: TeardownEngine,
    runs: RunRegistry,
    shutdown: CancellationToken,
    concurrency: usize,
    retry: RetryPolicy,
}

impl ContestOrchestrator {
    pub fn new(
        hypervisor: Arc<dyn HypervisorClient>,
        snippets: Arc<dyn SnippetStorage>,
        store: Arc<dyn PersistenceStore>,
        settings: &ProvisioningSettings,
    ) -> Self {
        Self {
            pipeline: ProvisioningPipeline::new(
                Arc::clone(&hypervisor),
                Arc::clone(&snippets),
                Arc::clone(&store),
                settings,
            ),
            teardown: TeardownEngine::new(
                Arc::clone(&hypervisor),
                snippets,
                Arc::clone(&store),
                settings,
            ),
            hypervisor,
            store,
            runs: RunRegistry::default(),
            shutdown: CancellationToken::new(),
            concurrency: settings.concurrency(),
            retry: settings.retry_policy(),
        }
    }

    /// Ties every run to `token`; cancelling it stops all runs from picking
    /// up new pairs.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Provisions every (team, question) pair of a contest that does not
    /// have a VM yet. Safe to call again to top up.
    #[instrument(skip(self))]
    pub async fn start_contest(&self, contest_id: ContestId) -> RangeResult<StartReport> {
        let run = self.runs.begin(contest_id, RunKind::Start, &self.shutdown)?;
        if self.store.contest(contest_id).await?.is_none() {
            return Err(RangeError::ContestNotFound(contest_id));
        }

        let teams = self.store.contest_teams(contest_id).await?;
        let questions = self.store.contest_questions(contest_id).await?;
        info!(
            teams = teams.len(),
            questions = questions.len(),
            concurrency = self.concurrency,
            "🏁 Starting contest"
        );

        let mut report = StartReport::begin(contest_id);
        let pairs: Vec<(Team, ContestQuestion)> = teams
            .iter()
            .flat_map(|team| {
                questions
                    .iter()
                    .map(move |question| (team.clone(), question.clone()))
            })
            .collect();

        report.pairs = stream::iter(pairs)
            .map(|(team, question)| {
                let token = &run.token;
                async move {
                    let key = ProvisioningKey::new(contest_id, team.id, question.question.id);
                    if token.is_cancelled() {
                        return PairReport {
                            key,
                            outcome: PairOutcome::Cancelled,
                        };
                    }
                    let outcome = match self.pipeline.provision(contest_id, &team, &question).await {
                        Ok(outcome) => outcome.into(),
                        Err(e) => {
                            error!(%key, error = %e, "Provisioning failed");
                            PairOutcome::Failed {
                                error: e.to_string(),
                            }
                        }
                    };
                    PairReport { key, outcome }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let report = report.finish();
        info!(
            run_id = %report.run_id,
            provisioned = report.provisioned(),
            already = report.already_provisioned(),
            failed = report.failed(),
            "Contest start finished"
        );
        Ok(report)
    }

    /// Shuts down and deletes the VMs of a contest and their records.
    #[instrument(skip(self))]
    pub async fn stop_contest(&self, contest_id: ContestId) -> RangeResult<TeardownReport> {
        let run = self.runs.begin(contest_id, RunKind::Stop, &self.shutdown)?;
        let mut report = self.teardown.stop_contest(contest_id, &run.token).await?;
        report.contest_id = Some(contest_id);
        info!(
            run_id = %report.run_id,
            removed = report.removed(),
            failed = report.failed(),
            "Contest stop finished"
        );
        Ok(report)
    }

    /// Cancels a running start or stop. Pairs already in progress finish.
    pub fn cancel(&self, contest_id: ContestId) -> bool {
        let cancelled = self.runs.cancel(contest_id);
        if cancelled {
            warn!(contest_id, "Run cancelled");
        }
        cancelled
    }

    /// Administrative sweep over every convention-named VM on the cluster.
    #[instrument(skip(self))]
    pub async fn delete_all_vms(&self) -> RangeResult<TeardownReport> {
        let token = self.shutdown.child_token();
        let report = self.teardown.sweep(&token).await?;
        info!(
            run_id = %report.run_id,
            removed = report.removed(),
            failed = report.failed(),
            "Sweep finished"
        );
        Ok(report)
    }

    /// The stored record for a key, with live guest addresses attached.
    pub async fn connection_info(&self, key: &ProvisioningKey) -> RangeResult<ProvisioningRecord> {
        let mut record = self
            .store
            .record(key)
            .await?
            .ok_or_else(|| RangeError::record_not_found(key))?;

        let vm = VmRef::new(record.node.clone(), record.vmid);
        match self.hypervisor.guest_interfaces(&vm).await {
            Ok(interfaces) => record.ips = guest_addresses(interfaces),
            // Agent not up yet; the credential is still useful.
            Err(e) => warn!(%key, vm = %vm, error = %e, "Guest agent query failed"),
        }
        Ok(record)
    }

    pub async fn cluster_snapshot(&self) -> RangeResult<ClusterSnapshot> {
        Ok(ClusterSnapshot::fetch(self.hypervisor.as_ref()).await?)
    }

    /// Powers a prepared VM down and turns it into a clone source.
    #[instrument(skip(self))]
    pub async fn templatize(&self, vmid: VmId) -> RangeResult<()> {
        let snapshot = self.cluster_snapshot().await?;
        let resource = snapshot.vm_by_id(vmid).ok_or(RangeError::VmNotFound(vmid))?;
        if resource.is_template() {
            info!(vmid, "Already a template");
            return Ok(());
        }
        let vm = resource.vm_ref().ok_or(RangeError::VmNotFound(vmid))?;

        if resource.status.as_deref() != Some("stopped") {
            self.teardown.power_off(&vm).await?;
        }
        self.retry
            .run("template", HypervisorError::is_transient, || {
                self.hypervisor.templatize(&vm)
            })
            .await
            .map_err(|e| RangeError::Step {
                vmid,
                step: e.operation,
                attempts: e.attempts,
                source: e.source,
            })?;
        info!(vm = %vm, "📦 VM converted to template");
        Ok(())
    }
}

/// Interface name to addresses, skipping loopback.
fn guest_addresses(interfaces: Vec<GuestInterface>) -> BTreeMap<String, Vec<String>> {
    interfaces
        .into_iter()
        .filter(|iface| iface.name != "lo")
        .map(|iface| {
            let ips = iface
                .ip_addresses
                .into_iter()
                .map(|addr| addr.ip_address)
                .collect();
            (iface.name, ips)
        })
        .collect()
}
