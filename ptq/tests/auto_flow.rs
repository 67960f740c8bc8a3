//! Tests for the automatic reserve → run → fetch → release flow.
//!
//! The recording reservation manager hands out the `local` sentinel as the
//! reserved host, so the whole flow runs against the prepared local
//! workspace.

use std::fs;

use ptq::auto::{AutoRequest, release_job, run_auto};
use ptq::controller::LaunchOptions;
use ptq::core::layout;
use ptq::core::lifecycle::JobState;
use ptq::core::types::Task;
use ptq::error::{Stage, stage_of};
use ptq::io::reservation::ReservationRequest;
use ptq::test_support::{RecordingReservations, StaticIssues, TestEnv, sample_issue};

fn request(task: Task, follow: bool) -> AutoRequest {
    AutoRequest {
        task,
        reservation: ReservationRequest {
            gpu_type: "h100".to_string(),
            gpu_count: 1,
            hours: 2.0,
        },
        launch: LaunchOptions {
            follow,
            create_pr: true,
            ..LaunchOptions::default()
        },
    }
}

/// Verifies a bad issue number fails before anything is reserved or created.
#[test]
fn invalid_issue_never_reserves() {
    let env = TestEnv::new().expect("env");
    let controller = env.controller();
    let issues = StaticIssues::default();
    let reservations = RecordingReservations::new("local");

    let err = run_auto(
        &controller,
        &issues,
        &reservations,
        &request(Task::issue(99_999_999), true),
        &mut |_: &str| {},
    )
    .unwrap_err();

    assert_eq!(stage_of(&err), Some(Stage::FetchIssue));
    assert!(format!("{err:#}").starts_with("fetch issue failed: issue #99999999"));
    assert!(reservations.reserved.borrow().is_empty());
    assert!(reservations.released.borrow().is_empty());
    assert!(controller.store().list().expect("list").is_empty());
}

/// Verifies the followed flow fetches results and releases exactly once.
#[test]
fn followed_run_fetches_results_and_releases() {
    let env = TestEnv::new().expect("env");
    let controller = env.controller();
    let issues = StaticIssues::default().with(12345, sample_issue());
    let reservations = RecordingReservations::new("local");

    let report = run_auto(
        &controller,
        &issues,
        &reservations,
        &request(Task::issue(12345), true),
        &mut |_: &str| {},
    )
    .expect("auto");

    assert_eq!(issues.fetched.borrow().as_slice(), &[12345]);
    assert_eq!(reservations.reserved.borrow().len(), 1);
    assert_eq!(reservations.released.borrow().as_slice(), &["res-1".to_string()]);
    assert_eq!(report.job.state, JobState::Completed);
    assert_eq!(report.job.reservation_id, None);
    assert_eq!(report.kept_reservation, None);
    let artifacts = report.artifacts.expect("artifacts");
    assert!(artifacts.report.is_some());
    assert!(artifacts.has_diff());

    let prompt = fs::read_to_string(
        env.workspace()
            .join("jobs")
            .join(&report.job.job_id)
            .join(layout::SYSTEM_PROMPT_FILE),
    )
    .expect("prompt");
    assert!(prompt.contains("add returns wrong result on CUDA"));
}

/// Verifies a provisioning failure marks the job FAILED and still releases
/// the reservation.
#[test]
fn provisioning_failure_releases_reservation() {
    let env = TestEnv::new().expect("env");
    // Still looks provisioned, but the base checkout points at no repository.
    let git_dir = env.workspace().join(layout::BASE_CHECKOUT).join(".git");
    fs::remove_dir_all(&git_dir).expect("remove .git");
    fs::write(&git_dir, "gitdir: /nonexistent/ptq-base\n").expect("broken .git");

    let controller = env.controller();
    let issues = StaticIssues::default();
    let reservations = RecordingReservations::new("local");
    let err = run_auto(
        &controller,
        &issues,
        &reservations,
        &request(Task::freeform("Check the nightly build"), true),
        &mut |_: &str| {},
    )
    .unwrap_err();

    assert_eq!(stage_of(&err), Some(Stage::Provision));
    assert_eq!(reservations.released.borrow().as_slice(), &["res-1".to_string()]);
    let jobs = controller.store().list().expect("list");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Failed);
    assert_eq!(jobs[0].reservation_id, None);
    assert!(jobs[0].process_handle.is_none());
}

/// Verifies a failed reserve surfaces as its own stage and creates no job.
#[test]
fn reserve_failure_creates_nothing() {
    let env = TestEnv::new().expect("env");
    let controller = env.controller();
    let mut reservations = RecordingReservations::new("local");
    reservations.fail_reserve = true;

    let err = run_auto(
        &controller,
        &StaticIssues::default(),
        &reservations,
        &request(Task::freeform("anything"), true),
        &mut |_: &str| {},
    )
    .unwrap_err();

    assert_eq!(stage_of(&err), Some(Stage::Reserve));
    assert!(reservations.released.borrow().is_empty());
    assert!(controller.store().list().expect("list").is_empty());
}

/// Verifies a failed release is reported and the job keeps the reservation id.
#[test]
fn failed_release_is_an_error() {
    let env = TestEnv::new().expect("env");
    let controller = env.controller();
    let mut reservations = RecordingReservations::new("local");
    reservations.fail_release = true;

    let err = run_auto(
        &controller,
        &StaticIssues::default(),
        &reservations,
        &request(Task::freeform("quick look"), true),
        &mut |_: &str| {},
    )
    .unwrap_err();

    assert_eq!(stage_of(&err), Some(Stage::Release));
    assert_eq!(reservations.released.borrow().len(), 1);
    let jobs = controller.store().list().expect("list");
    assert_eq!(jobs[0].reservation_id.as_deref(), Some("res-1"));
    assert_eq!(jobs[0].state, JobState::Completed);
}

/// Verifies `--no-follow` keeps the reservation until `ptq release`.
#[test]
fn no_follow_keeps_reservation_until_released() {
    let env = TestEnv::new().expect("env");
    let controller = env.controller();
    let reservations = RecordingReservations::new("local");

    let report = run_auto(
        &controller,
        &StaticIssues::default(),
        &reservations,
        &request(Task::freeform("background job"), false),
        &mut |_: &str| {},
    )
    .expect("auto");
    assert_eq!(report.kept_reservation.as_deref(), Some("res-1"));
    assert!(report.artifacts.is_none());
    assert!(reservations.released.borrow().is_empty());

    // A job holding a reservation is not cleaned away.
    let clean = controller
        .clean(&env.local_target(), 0, true)
        .expect("clean");
    assert!(clean.removed.is_empty());
    assert_eq!(clean.skipped.len(), 1);

    let released = release_job(&controller, &reservations, &report.job.job_id).expect("release");
    assert_eq!(released.as_deref(), Some("res-1"));
    assert_eq!(reservations.released.borrow().as_slice(), &["res-1".to_string()]);
    let job = controller.store().load(&report.job.job_id).expect("load");
    assert_eq!(job.reservation_id, None);

    let again = release_job(&controller, &reservations, &report.job.job_id).expect("release");
    assert_eq!(again, None);
    assert_eq!(reservations.released.borrow().len(), 1);
}
