//! Fully automatic flow: fetch issue, reserve a machine, provision, run the
//! agent, fetch results, release the machine.
//!
//! The issue is fetched before anything is reserved, so a bad issue number
//! costs nothing. Once a reservation exists it is owned by a
//! [`ReservationGuard`] and released on every exit path, including errors and
//! Ctrl-C; only `--no-follow` hands it over to the job record for a later
//! `ptq release`.

use anyhow::{Context, Result};
use tracing::{error, info, instrument, warn};

use crate::controller::{Controller, KillOutcome, LaunchOptions, LaunchReport};
use crate::core::types::{JobRecord, Machine, Task};
use crate::error::Stage;
use crate::interrupt;
use crate::io::agent::StreamEnd;
use crate::io::issue::{IssueData, IssueSource};
use crate::io::reservation::{ReservationManager, ReservationRequest};
use crate::io::results::Artifacts;

#[derive(Debug, Clone)]
pub struct AutoRequest {
    pub task: Task,
    pub reservation: ReservationRequest,
    pub launch: LaunchOptions,
}

#[derive(Debug, Clone)]
pub struct AutoReport {
    pub job: JobRecord,
    pub launch: LaunchReport,
    /// `None` for `--no-follow`.
    pub artifacts: Option<Artifacts>,
    /// Reservation still held (only for `--no-follow`).
    pub kept_reservation: Option<String>,
}

/// Releases a reservation exactly once: explicitly via [`Self::release`], or
/// on drop if an error unwinds past it.
pub struct ReservationGuard<'a, R: ReservationManager> {
    manager: &'a R,
    id: Option<String>,
}

impl<'a, R: ReservationManager> ReservationGuard<'a, R> {
    pub fn new(manager: &'a R, id: String) -> Self {
        Self {
            manager,
            id: Some(id),
        }
    }

    pub fn release(mut self) -> Result<()> {
        match self.id.take() {
            Some(id) => self
                .manager
                .release(&id)
                .with_context(|| format!("reservation {id}"))
                .context(Stage::Release),
            None => Ok(()),
        }
    }

    /// Give up ownership without releasing.
    pub fn detach(mut self) -> Option<String> {
        self.id.take()
    }
}

impl<R: ReservationManager> Drop for ReservationGuard<'_, R> {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        if let Err(err) = self.manager.release(&id) {
            warn_unreleased(&id, &err);
        }
    }
}

#[instrument(skip_all, fields(identity = %request.task.identity_key()))]
pub fn run_auto<I: IssueSource, R: ReservationManager>(
    controller: &Controller,
    issues: &I,
    reservations: &R,
    request: &AutoRequest,
    sink: &mut dyn FnMut(&str),
) -> Result<AutoReport> {
    let issue = controller.fetch_issue(issues, &request.task)?;
    interrupt::check()?;

    let reservation = reservations
        .reserve(&request.reservation)
        .context(Stage::Reserve)?;
    info!(id = %reservation.id, host = %reservation.host, "reserved");
    let guard = ReservationGuard::new(reservations, reservation.id.clone());

    let target = controller.target(Machine::from(reservation.host.clone()), None);
    let mut job = controller.create_job(request.task.clone(), &target)?;
    job.reservation_id = Some(reservation.id.clone());
    controller.store().update(&job)?;
    let job_id = job.job_id;

    let driven = drive(controller, &job_id, request, issue.as_ref(), sink);
    if let Ok((launch, None)) = driven {
        let kept = guard.detach();
        info!(job_id = %job_id, reservation = ?kept, "not following, reservation kept");
        return Ok(AutoReport {
            job: launch.job.clone(),
            launch,
            artifacts: None,
            kept_reservation: kept,
        });
    }

    let released = guard.release();
    match &released {
        Ok(()) => clear_reservation(controller, &job_id)?,
        Err(err) => warn_unreleased(&reservation.id, err),
    }
    let (launch, artifacts) = driven?;
    released?;
    Ok(AutoReport {
        job: controller.store().load(&job_id)?,
        launch,
        artifacts,
        kept_reservation: None,
    })
}

/// Launch on the reserved machine; when following, also collect results.
fn drive(
    controller: &Controller,
    job_id: &str,
    request: &AutoRequest,
    issue: Option<&IssueData>,
    sink: &mut dyn FnMut(&str),
) -> Result<(LaunchReport, Option<Artifacts>)> {
    interrupt::check()?;
    let launch = controller.launch(job_id, &request.launch, issue, sink)?;
    if !request.launch.follow {
        return Ok((launch, None));
    }
    if launch.stream_end == Some(StreamEnd::Detached) {
        // The machine is about to go away; don't leave the agent behind.
        if let KillOutcome::Killed { pid } = controller.kill(job_id)? {
            warn!(job_id, pid, "interrupted, agent killed");
        }
    }
    let (_, artifacts) = controller.fetch_results(job_id)?;
    Ok((launch, Some(artifacts)))
}

fn warn_unreleased(id: &str, err: &anyhow::Error) {
    error!(reservation = %id, err = %format!("{err:#}"), "failed to release reservation");
    eprintln!(
        "error: failed to release reservation {id}: {err:#}\n\
         The machine is still reserved; cancel it by hand."
    );
}

fn clear_reservation(controller: &Controller, job_id: &str) -> Result<()> {
    let mut job = controller.store().load(job_id)?;
    job.reservation_id = None;
    controller.store().update(&job)
}

/// `ptq release JOB`: release the reservation a `--no-follow` job kept.
/// Returns the released id, or `None` if the job held none.
pub fn release_job<R: ReservationManager>(
    controller: &Controller,
    reservations: &R,
    id_or_issue: &str,
) -> Result<Option<String>> {
    let job = controller.store().resolve(id_or_issue)?;
    let Some(id) = job.reservation_id.clone() else {
        return Ok(None);
    };
    ReservationGuard::new(reservations, id.clone()).release()?;
    clear_reservation(controller, &job.job_id)?;
    Ok(Some(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use anyhow::anyhow;

    use crate::io::reservation::Reservation;

    #[derive(Default)]
    struct Recorder {
        released: RefCell<Vec<String>>,
        fail_release: bool,
    }

    impl ReservationManager for Recorder {
        fn reserve(&self, _request: &ReservationRequest) -> Result<Reservation> {
            Ok(Reservation {
                id: "r-1".to_string(),
                host: "gpu-box".to_string(),
            })
        }

        fn release(&self, reservation_id: &str) -> Result<()> {
            self.released.borrow_mut().push(reservation_id.to_string());
            if self.fail_release {
                return Err(anyhow!("api down"));
            }
            Ok(())
        }
    }

    #[test]
    fn guard_releases_once_on_drop() {
        let recorder = Recorder::default();
        {
            let _guard = ReservationGuard::new(&recorder, "r-1".to_string());
        }
        assert_eq!(*recorder.released.borrow(), vec!["r-1".to_string()]);
    }

    #[test]
    fn explicit_release_is_not_repeated_on_drop() {
        let recorder = Recorder::default();
        ReservationGuard::new(&recorder, "r-1".to_string())
            .release()
            .expect("release");
        assert_eq!(recorder.released.borrow().len(), 1);
    }

    #[test]
    fn detach_keeps_reservation() {
        let recorder = Recorder::default();
        let kept = ReservationGuard::new(&recorder, "r-1".to_string()).detach();
        assert_eq!(kept.as_deref(), Some("r-1"));
        assert!(recorder.released.borrow().is_empty());
    }

    #[test]
    fn failed_release_names_the_stage() {
        let recorder = Recorder {
            fail_release: true,
            ..Recorder::default()
        };
        let err = ReservationGuard::new(&recorder, "r-9".to_string())
            .release()
            .unwrap_err();
        assert_eq!(crate::error::stage_of(&err), Some(Stage::Release));
        assert!(format!("{err:#}").starts_with("release failed: reservation r-9"));
    }
}
