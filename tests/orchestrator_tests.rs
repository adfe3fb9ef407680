// Contest start/stop, sweep and admin operations end to end.

mod common;

use std::time::Duration;

use common::{interface, Harness, CONTEST, WEB_TEMPLATE};
use ctf_range_manager::core::vm::{ProvisioningKey, VmPowerState};
use ctf_range_manager::errors::RangeError;
use ctf_range_manager::orchestrator::{PairOutcome, VmOutcome};
use ctf_range_manager::store::RecordStore;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn starting_twice_provisions_once() {
    let h = Harness::new().await;
    let orchestrator = h.orchestrator();

    let first = orchestrator.start_contest(CONTEST).await.unwrap();
    assert_eq!(first.total(), 4);
    assert_eq!(first.provisioned(), 4);
    assert!(first.ensure_success().is_ok());

    let second = orchestrator.start_contest(CONTEST).await.unwrap();
    assert_eq!(second.already_provisioned(), 4);
    assert_eq!(second.provisioned(), 0);

    assert_eq!(h.hv.calls("clone"), 4);
    assert_eq!(h.hv.vm_count(), 4);
    assert_eq!(h.store.record_count().await, 4);
    for (team, question) in [(1, 10), (1, 11), (2, 10), (2, 11)] {
        assert!(h.hv.vm_named(&format!("1-{team}-{question}")).is_some());
    }
}

#[tokio::test]
async fn one_bad_question_does_not_sink_the_contest() {
    let h = Harness::new().await;
    h.hv.fail_for("clone", common::PWN_TEMPLATE, 400);

    let report = h.orchestrator().start_contest(CONTEST).await.unwrap();

    assert_eq!(report.provisioned(), 2);
    assert_eq!(report.failed(), 2);
    assert!(matches!(
        report.outcome(&ProvisioningKey::new(CONTEST, 2, 11)),
        Some(PairOutcome::Failed { .. })
    ));
    assert!(matches!(
        report.outcome(&ProvisioningKey::new(CONTEST, 2, 10)),
        Some(PairOutcome::Provisioned { .. })
    ));
    assert!(matches!(
        report.ensure_success(),
        Err(RangeError::PairsFailed { failed: 2, total: 4 })
    ));
}

#[tokio::test]
async fn unknown_contest_is_not_found() {
    let h = Harness::new().await;
    let err = h.orchestrator().start_contest(99).await.unwrap_err();
    assert!(matches!(err, RangeError::ContestNotFound(99)));
    assert_eq!(h.hv.calls("clone"), 0);
}

#[tokio::test]
async fn shutdown_token_cancels_before_any_pair() {
    let h = Harness::new().await;
    let token = CancellationToken::new();
    token.cancel();
    let orchestrator = h.orchestrator().with_shutdown(token);

    let report = orchestrator.start_contest(CONTEST).await.unwrap();

    assert_eq!(report.count(|o| matches!(o, PairOutcome::Cancelled)), 4);
    assert_eq!(h.hv.calls("clone"), 0);
}

/// Resolves once the fake cluster has seen `op` start.
async fn started(h: &Harness, op: &str) {
    while h.hv.begun(op) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn cancel_mid_start_lets_the_running_pair_finish() {
    let mut h = Harness::new().await;
    h.settings.max_concurrency = 1;
    h.hv.slow("boot", Duration::from_millis(50));
    let orchestrator = h.orchestrator();

    let (report, cancelled) = tokio::join!(orchestrator.start_contest(CONTEST), async {
        started(&h, "boot").await;
        orchestrator.cancel(CONTEST)
    });
    let report = report.unwrap();

    assert!(cancelled);
    assert_eq!(report.provisioned(), 1);
    assert!(matches!(
        report.outcome(&ProvisioningKey::new(CONTEST, 1, 10)),
        Some(PairOutcome::Provisioned { .. })
    ));
    assert_eq!(report.count(|o| matches!(o, PairOutcome::Cancelled)), 3);
    assert_eq!(h.hv.vm_count(), 1);
    assert_eq!(h.store.record_count().await, 1);
    // the run is over, so there is nothing left to cancel
    assert!(!orchestrator.cancel(CONTEST));
}

#[tokio::test]
async fn cancel_mid_stop_keeps_the_remaining_vms_and_records() {
    let mut h = Harness::new().await;
    h.settings.max_concurrency = 1;
    let orchestrator = h.orchestrator();
    orchestrator.start_contest(CONTEST).await.unwrap();
    h.hv.slow("shutdown", Duration::from_millis(50));

    let (report, cancelled) = tokio::join!(orchestrator.stop_contest(CONTEST), async {
        started(&h, "shutdown").await;
        orchestrator.cancel(CONTEST)
    });
    let report = report.unwrap();

    assert!(cancelled);
    assert_eq!(report.removed(), 1);
    let skipped = report
        .vms
        .iter()
        .filter(|vm| vm.outcome == VmOutcome::Cancelled)
        .count();
    assert_eq!(skipped, 3);
    assert_eq!(h.hv.vm_count(), 3);
    assert_eq!(h.store.record_count().await, 3);
}

#[tokio::test]
async fn cancel_without_a_run_is_a_no_op() {
    let h = Harness::new().await;
    assert!(!h.orchestrator().cancel(CONTEST));
}

#[tokio::test]
async fn stop_removes_every_vm_even_if_one_shutdown_fails() {
    let h = Harness::new().await;
    let orchestrator = h.orchestrator();
    orchestrator.start_contest(CONTEST).await.unwrap();

    let stubborn = h.hv.vm_named("1-1-10").unwrap().vmid;
    let broken = h.hv.vm_named("1-2-11").unwrap().vmid;
    h.hv.make_stubborn(stubborn);
    h.hv.fail_for("shutdown", broken, 500);

    let report = orchestrator.stop_contest(CONTEST).await.unwrap();

    assert_eq!(report.contest_id, Some(CONTEST));
    assert_eq!(report.vms.len(), 4);
    assert_eq!(report.removed(), 4);
    assert_eq!(report.failed(), 0);
    assert_eq!(h.hv.vm_count(), 0);
    assert_eq!(h.store.record_count().await, 0);
    assert!(!h.snippet_exists("1-1-10.yaml"));
    // polled until the attempts ran out, then hard-stopped
    assert_eq!(h.hv.calls_for("status", stubborn), 3);
    assert_eq!(h.hv.calls_for("stop", stubborn), 1);
    // a clean shutdown needs no hard stop
    assert_eq!(h.hv.calls("stop"), 2);
}

#[tokio::test]
async fn failed_shutdown_request_hard_stops_before_delete() {
    let h = Harness::new().await;
    let orchestrator = h.orchestrator();
    orchestrator.start_contest(CONTEST).await.unwrap();
    let vmid = h.hv.vm_named("1-1-11").unwrap().vmid;
    h.hv.fail_for("shutdown", vmid, 500);
    h.hv.fail_for("stop", vmid, 500);

    let report = orchestrator.stop_contest(CONTEST).await.unwrap();

    // the cluster will not destroy a running guest
    let entry = report.vms.iter().find(|vm| vm.vmid == vmid).unwrap();
    assert!(matches!(entry.outcome, VmOutcome::Failed { .. }));
    assert_eq!(h.hv.calls_for("stop", vmid), 1);
    assert_eq!(h.hv.calls_for("delete", vmid), 5);
    assert!(h.hv.vm(vmid).is_some());
    assert_eq!(report.removed(), 3);
}

#[tokio::test]
async fn failed_delete_keeps_the_record() {
    let h = Harness::new().await;
    let orchestrator = h.orchestrator();
    orchestrator.start_contest(CONTEST).await.unwrap();
    let stuck = h.hv.vm_named("1-1-11").unwrap().vmid;
    h.hv.fail_for("delete", stuck, 403);

    let report = orchestrator.stop_contest(CONTEST).await.unwrap();

    assert_eq!(report.failed(), 1);
    assert_eq!(report.removed(), 3);
    assert!(h.hv.vm(stuck).is_some());
    let key = ProvisioningKey::new(CONTEST, 1, 11);
    assert_eq!(h.store.record(&key).await.unwrap().unwrap().vmid, stuck);
    assert!(h.snippet_exists("1-1-11.yaml"));
}

#[tokio::test]
async fn vms_deleted_by_hand_count_as_gone() {
    let h = Harness::new().await;
    let orchestrator = h.orchestrator();
    orchestrator.start_contest(CONTEST).await.unwrap();
    let gone = h.hv.vm_named("1-2-10").unwrap().vmid;
    h.hv.remove_vm(gone);

    let report = orchestrator.stop_contest(CONTEST).await.unwrap();

    let entry = report.vms.iter().find(|vm| vm.vmid == gone).unwrap();
    assert_eq!(entry.outcome, VmOutcome::AlreadyGone);
    assert_eq!(h.hv.calls_for("delete", gone), 0);
    assert_eq!(h.store.record_count().await, 0);
}

#[tokio::test]
async fn reused_vmid_is_not_touched() {
    let h = Harness::new().await;
    let orchestrator = h.orchestrator();
    orchestrator.start_contest(CONTEST).await.unwrap();
    let vm = h.hv.vm_named("1-1-10").unwrap();
    h.hv.remove_vm(vm.vmid);
    // someone else's VM now owns the id
    h.hv.add_template(vm.vmid, "unrelated", "pve1");

    let report = orchestrator.stop_contest(CONTEST).await.unwrap();

    let entry = report.vms.iter().find(|r| r.vmid == vm.vmid).unwrap();
    assert_eq!(entry.outcome, VmOutcome::AlreadyGone);
    assert!(h.hv.vm(vm.vmid).is_some());
}

#[tokio::test]
async fn stopping_an_empty_contest_is_fine() {
    let h = Harness::new().await;
    let report = h.orchestrator().stop_contest(CONTEST).await.unwrap();
    assert!(report.vms.is_empty());
    assert_eq!(h.hv.calls("resources"), 0);
}

#[tokio::test]
async fn sweep_only_touches_convention_names() {
    let h = Harness::new().await;
    let orchestrator = h.orchestrator();
    orchestrator.start_contest(CONTEST).await.unwrap();
    let bystander = h.hv.add_vm("web-frontend", "pve1", VmPowerState::Running);
    let unrecorded = h.hv.add_vm("3-4-5", "pve2", VmPowerState::Running);
    h.hv.add_template(8000, "7-7-7", "pve1");

    let report = orchestrator.delete_all_vms().await.unwrap();

    assert_eq!(report.vms.len(), 5);
    assert_eq!(report.removed(), 5);
    assert!(report.contest_id.is_none());
    assert!(h.hv.vm(bystander).is_some());
    assert!(h.hv.vm(unrecorded).is_none());
    assert!(h.hv.vm(8000).is_some());
    assert!(h.hv.vm(WEB_TEMPLATE).is_some());
    assert_eq!(h.hv.vm_count(), 1);
    assert_eq!(h.store.record_count().await, 0);
    assert!(!h.snippet_exists("1-2-11.yaml"));
}

#[tokio::test]
async fn connection_info_lists_guest_addresses() {
    let h = Harness::new().await;
    let orchestrator = h.orchestrator();
    orchestrator.start_contest(CONTEST).await.unwrap();
    let key = ProvisioningKey::new(CONTEST, 2, 10);
    let vmid = h.hv.vm_named("1-2-10").unwrap().vmid;
    h.hv.set_interfaces(
        vmid,
        vec![interface("lo", "127.0.0.1"), interface("eth0", "10.10.2.10")],
    );

    let record = orchestrator.connection_info(&key).await.unwrap();

    assert_eq!(record.vmid, vmid);
    assert_eq!(record.ips.len(), 1);
    assert_eq!(record.ips["eth0"], vec!["10.10.2.10".to_string()]);
}

#[tokio::test]
async fn connection_info_survives_a_silent_agent() {
    let h = Harness::new().await;
    let orchestrator = h.orchestrator();
    orchestrator.start_contest(CONTEST).await.unwrap();
    h.hv.fail("agent", 500);

    let record = orchestrator
        .connection_info(&ProvisioningKey::new(CONTEST, 1, 11))
        .await
        .unwrap();

    assert!(record.ips.is_empty());
    assert!(!record.access.expose().is_empty());
}

#[tokio::test]
async fn connection_info_for_unknown_pair() {
    let h = Harness::new().await;
    let err = h
        .orchestrator()
        .connection_info(&ProvisioningKey::new(CONTEST, 9, 9))
        .await
        .unwrap_err();
    assert!(matches!(err, RangeError::RecordNotFound { team_id: 9, .. }));
}

#[tokio::test]
async fn templatize_powers_off_first() {
    let h = Harness::new().await;
    let vmid = h.hv.add_vm("crypto-base", "pve2", VmPowerState::Running);

    h.orchestrator().templatize(vmid).await.unwrap();

    let vm = h.hv.vm(vmid).unwrap();
    assert!(vm.template);
    assert_eq!(vm.status, VmPowerState::Stopped);
    assert_eq!(h.hv.calls_for("shutdown", vmid), 1);
    assert_eq!(h.hv.calls_for("template", vmid), 1);
}

#[tokio::test]
async fn templatize_is_idempotent_and_checks_existence() {
    let h = Harness::new().await;
    let orchestrator = h.orchestrator();

    orchestrator.templatize(WEB_TEMPLATE).await.unwrap();
    assert_eq!(h.hv.calls("template"), 0);

    let err = orchestrator.templatize(4242).await.unwrap_err();
    assert!(matches!(err, RangeError::VmNotFound(4242)));
}
