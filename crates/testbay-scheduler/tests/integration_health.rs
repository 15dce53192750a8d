//! Integration tests for the health-check pass.

mod common;

use chrono::{Duration, Utc};
use common::fixtures::{self, DeviceBuilder, HEALTH_CHECK};
use common::TestFleet;
use testbay_scheduler::store::JobFilter;
use testbay_scheduler::{DeviceHealth, DeviceState, JobHealth, JobId, JobState};

async fn panda_fleet(device_type: testbay_scheduler::DeviceType) -> TestFleet {
    let fleet = TestFleet::new();
    fleet.add_device_type(device_type).await;
    fleet.add_worker(fixtures::worker("worker-1", 0)).await;
    fleet
        .add_device(DeviceBuilder::new("panda-01", "panda", "worker-1").build())
        .await;
    fleet.policy.set_health_check("panda", HEALTH_CHECK);
    fleet
}

/// Id of the health check currently scheduled on a device.
async fn scheduled_health_check(fleet: &TestFleet, hostname: &str) -> Option<JobId> {
    fleet
        .store
        .list_jobs(
            &JobFilter::new()
                .on_device(hostname)
                .with_state(JobState::Scheduled)
                .with_health_check(true),
        )
        .await
        .first()
        .map(|j| j.id)
}

/// Runs the first health check so the device becomes GOOD.
async fn pass_health_check(fleet: &TestFleet, hostname: &str) -> JobId {
    fleet.tick().await;
    let id = scheduled_health_check(fleet, hostname).await.unwrap();
    fleet.run_to_completion(id, JobHealth::Complete).await;
    assert_eq!(fleet.device(hostname).await.health, DeviceHealth::Good);
    id
}

#[tokio::test]
async fn failed_health_check_marks_device_bad() {
    let fleet = panda_fleet(fixtures::per_hour_type("panda", 24)).await;
    fleet.tick().await;
    let id = scheduled_health_check(&fleet, "panda-01").await.unwrap();

    fleet.run_to_completion(id, JobHealth::Incomplete).await;

    let device = fleet.device("panda-01").await;
    assert_eq!(device.health, DeviceHealth::Bad);
    assert_eq!(device.state, DeviceState::Idle);
    assert_eq!(
        fleet.device_log("panda-01"),
        vec![format!("Unknown → Bad (health-check [{id}] failed)")]
    );

    // Bad devices are not checked again
    let report = fleet.tick().await;
    assert!(report.health_checks.is_empty());
}

#[tokio::test]
async fn infrastructure_error_still_fails_a_health_check() {
    let fleet = panda_fleet(fixtures::per_hour_type("panda", 24)).await;
    fleet.tick().await;
    let id = scheduled_health_check(&fleet, "panda-01").await.unwrap();

    fleet.scheduler.go_state_running(id).await.unwrap();
    fleet
        .scheduler
        .go_state_finished(id, JobHealth::Incomplete, true)
        .await
        .unwrap();

    assert_eq!(fleet.device("panda-01").await.health, DeviceHealth::Bad);
}

#[tokio::test]
async fn ordinary_job_outcome_leaves_health_alone() {
    let fleet = panda_fleet(fixtures::per_hour_type("panda", 24)).await;
    pass_health_check(&fleet, "panda-01").await;
    let job_id = fleet.submit(fixtures::job("panda")).await;
    fleet.tick().await;
    assert_eq!(fleet.job(job_id).await.state, JobState::Scheduled);

    fleet.scheduler.go_state_running(job_id).await.unwrap();
    fleet
        .scheduler
        .go_state_finished(job_id, JobHealth::Incomplete, true)
        .await
        .unwrap();

    let device = fleet.device("panda-01").await;
    assert_eq!(device.health, DeviceHealth::Good);
    assert_eq!(device.state, DeviceState::Idle);
}

#[tokio::test]
async fn per_hour_check_is_due_after_the_interval() {
    let fleet = panda_fleet(fixtures::per_hour_type("panda", 2)).await;
    let first = pass_health_check(&fleet, "panda-01").await;
    let checked_at = fleet.job(first).await.submit_time;

    let report = fleet.tick_at(checked_at + Duration::minutes(119)).await;
    assert!(report.health_checks.is_empty());
    assert_eq!(report.available.get("panda"), Some(&vec!["panda-01".to_owned()]));

    let report = fleet.tick_at(checked_at + Duration::hours(2)).await;
    assert_eq!(report.health_checks.get("panda"), Some(&vec!["panda-01".to_owned()]));
    assert!(report.available.get("panda").unwrap().is_empty());
}

#[tokio::test]
async fn per_job_check_is_due_after_enough_jobs() {
    let fleet = panda_fleet(fixtures::per_job_type("panda", 2)).await;
    pass_health_check(&fleet, "panda-01").await;

    for round in 0..2 {
        let job_id = fleet.submit(fixtures::job("panda")).await;
        let report = fleet.tick().await;
        assert!(report.health_checks.is_empty(), "round {round}");
        assert_eq!(report.assignments.len(), 1);
        fleet.run_to_completion(job_id, JobHealth::Complete).await;
    }

    let queued = fleet.submit(fixtures::job("panda")).await;
    let report = fleet.tick().await;
    assert_eq!(report.health_checks.get("panda"), Some(&vec!["panda-01".to_owned()]));
    assert!(report.assignments.is_empty());
    assert_eq!(fleet.job(queued).await.state, JobState::Submitted);
}

#[tokio::test]
async fn looping_device_is_always_rechecked() {
    let fleet = panda_fleet(fixtures::per_hour_type("panda", 24)).await;
    fleet
        .scheduler
        .set_device_health("admin", "panda-01", DeviceHealth::Looping, Some("burn-in"))
        .await
        .unwrap();
    let queued = fleet.submit(fixtures::job("panda")).await;

    for outcome in [JobHealth::Complete, JobHealth::Incomplete, JobHealth::Complete] {
        let report = fleet.tick().await;
        assert_eq!(report.health_checks.get("panda"), Some(&vec!["panda-01".to_owned()]));
        let id = scheduled_health_check(&fleet, "panda-01").await.unwrap();
        fleet.run_to_completion(id, outcome).await;
        assert_eq!(fleet.device("panda-01").await.health, DeviceHealth::Looping);
    }
    assert_eq!(fleet.job(queued).await.state, JobState::Submitted);

    let log = fleet.device_log("panda-01");
    assert_eq!(log[0], "Unknown → Looping (burn-in)");
    assert_eq!(log.len(), 2);
    assert!(log[1].starts_with("Looping → Looping (Looping health-check ["));
    assert!(log[1].ends_with("] failed)"));

    // Only an explicit override ends the loop
    fleet
        .scheduler
        .set_device_health("admin", "panda-01", DeviceHealth::Good, None)
        .await
        .unwrap();
    assert_eq!(fleet.device("panda-01").await.health, DeviceHealth::Good);
}

#[tokio::test]
async fn malformed_health_check_marks_only_that_device_bad() {
    let fleet = TestFleet::new();
    fleet.add_device_type(fixtures::per_hour_type("panda", 24)).await;
    fleet.add_device_type(fixtures::per_hour_type("beagle", 24)).await;
    fleet.add_worker(fixtures::worker("worker-1", 0)).await;
    fleet
        .add_device(DeviceBuilder::new("panda-01", "panda", "worker-1").build())
        .await;
    fleet
        .add_device(DeviceBuilder::new("beagle-01", "beagle", "worker-1").build())
        .await;
    fleet.policy.set_health_check("panda", "job_name: [unterminated");
    fleet.policy.set_health_check("beagle", HEALTH_CHECK);

    let report = fleet.tick().await;

    assert_eq!(fleet.device("panda-01").await.health, DeviceHealth::Bad);
    assert_eq!(
        fleet.device_log("panda-01"),
        vec!["Unknown → Bad (Invalid health check)".to_owned()]
    );
    assert_eq!(fleet.device("panda-01").await.state, DeviceState::Idle);
    assert_eq!(report.health_checks.get("beagle"), Some(&vec!["beagle-01".to_owned()]));
    assert!(report.health_checks.get("panda").is_none());

    // The failed attempt left no job behind
    let panda_jobs = fleet
        .store
        .list_jobs(&JobFilter::new().with_device_type("panda"))
        .await;
    assert!(panda_jobs.is_empty());
}

#[tokio::test]
async fn unconfigured_device_is_not_checked() {
    let fleet = TestFleet::new();
    fleet.add_device_type(fixtures::per_hour_type("panda", 24)).await;
    fleet.add_worker(fixtures::worker("worker-1", 0)).await;
    fleet
        .add_unconfigured_device(DeviceBuilder::new("panda-01", "panda", "worker-1").build())
        .await;
    fleet.policy.set_health_check("panda", HEALTH_CHECK);

    let report = fleet.tick().await;

    assert!(report.health_checks.is_empty());
    assert_eq!(fleet.device("panda-01").await.health, DeviceHealth::Bad);
    assert_eq!(
        fleet.device_log("panda-01"),
        vec!["Unknown → Bad (Invalid device configuration)".to_owned()]
    );
}

#[tokio::test]
async fn device_without_health_check_is_available() {
    let fleet = TestFleet::new();
    fleet.add_device_type(fixtures::per_hour_type("panda", 24)).await;
    fleet.add_worker(fixtures::worker("worker-1", 0)).await;
    fleet
        .add_device(DeviceBuilder::new("panda-01", "panda", "worker-1").build())
        .await;
    let job_id = fleet.submit(fixtures::job("panda")).await;

    let report = fleet.tick().await;

    assert!(report.health_checks.is_empty());
    assert_eq!(report.available.get("panda"), Some(&vec!["panda-01".to_owned()]));
    assert_eq!(report.assignments[0].job_id, job_id);
}

#[tokio::test]
async fn disabled_health_checks_list_idle_devices() {
    let fleet = TestFleet::new();
    fleet.add_device_type(fixtures::unchecked_type("qemu")).await;
    fleet.add_worker(fixtures::worker("worker-1", 0)).await;
    fleet
        .add_device(DeviceBuilder::new("qemu-01", "qemu", "worker-1").good().build())
        .await;
    fleet
        .add_device(DeviceBuilder::new("qemu-02", "qemu", "worker-1").build())
        .await;
    fleet
        .add_device(
            DeviceBuilder::new("qemu-03", "qemu", "worker-1")
                .with_health(DeviceHealth::Looping)
                .build(),
        )
        .await;
    fleet.policy.set_health_check("qemu", HEALTH_CHECK);

    let report = fleet.tick().await;

    assert!(report.health_checks.is_empty());
    assert_eq!(
        report.available.get("qemu"),
        Some(&vec!["qemu-01".to_owned(), "qemu-02".to_owned()])
    );
}

#[tokio::test]
async fn hidden_device_types_are_ignored() {
    let mut hidden = fixtures::per_hour_type("panda", 24);
    hidden.display = false;
    let fleet = panda_fleet(hidden).await;

    let report = fleet.tick().await;

    assert!(report.health_checks.is_empty());
    assert!(report.available.is_empty());
}

#[tokio::test]
async fn activity_narrows_the_pass() {
    let fleet = panda_fleet(fixtures::per_hour_type("panda", 24)).await;
    fleet.add_device_type(fixtures::per_hour_type("beagle", 24)).await;
    fleet
        .add_device(DeviceBuilder::new("beagle-01", "beagle", "worker-1").build())
        .await;
    fleet.policy.set_health_check("beagle", HEALTH_CHECK);

    let workers = fleet.workers(Utc::now()).await;
    let activity = ["beagle".to_owned()].into_iter().collect();
    let report = fleet.scheduler.schedule(&activity, &workers).await.unwrap();

    assert_eq!(report.health_checks.keys().collect::<Vec<_>>(), vec!["beagle"]);
    assert!(scheduled_health_check(&fleet, "panda-01").await.is_none());
}

#[tokio::test]
async fn health_checks_respect_the_job_limit() {
    let fleet = TestFleet::new();
    fleet.add_device_type(fixtures::per_hour_type("panda", 24)).await;
    fleet.add_worker(fixtures::worker("worker-1", 1)).await;
    for hostname in ["panda-01", "panda-02"] {
        fleet
            .add_device(DeviceBuilder::new(hostname, "panda", "worker-1").build())
            .await;
    }
    fleet.policy.set_health_check("panda", HEALTH_CHECK);

    let report = fleet.tick().await;

    assert_eq!(report.health_checks.get("panda").map(Vec::len), Some(1));
    let busy = fleet
        .store
        .list_devices()
        .await
        .iter()
        .filter(|d| d.state.is_busy())
        .count();
    assert_eq!(busy, 1);
}

#[tokio::test]
async fn canceled_health_check_marks_device_bad() {
    let fleet = panda_fleet(fixtures::per_hour_type("panda", 24)).await;
    fleet.tick().await;
    let id = scheduled_health_check(&fleet, "panda-01").await.unwrap();

    fleet.scheduler.go_state_running(id).await.unwrap();
    fleet.scheduler.go_state_canceling(id).await.unwrap();
    fleet
        .scheduler
        .go_state_finished(id, JobHealth::Complete, false)
        .await
        .unwrap();

    assert_eq!(fleet.job(id).await.health, JobHealth::Canceled);
    assert_eq!(fleet.device("panda-01").await.health, DeviceHealth::Bad);
    assert_eq!(
        fleet.device_log("panda-01"),
        vec![format!("Unknown → Bad (health-check [{id}] canceled)")]
    );
}
