//! GPU machine reservations through the `gpu-dev` CLI.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::io::config::ReservationConfig;
use crate::io::process::{DEFAULT_OUTPUT_LIMIT_BYTES, run_command_with_timeout};

/// Reserving blocks until the pod is up, which can take a while.
const RESERVE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct ReservationRequest {
    pub gpu_type: String,
    pub gpu_count: u32,
    pub hours: f64,
}

impl ReservationRequest {
    pub fn from_config(cfg: &ReservationConfig) -> Self {
        Self {
            gpu_type: cfg.gpu_type.clone(),
            gpu_count: cfg.gpu_count,
            hours: cfg.max_hours,
        }
    }
}

/// A live reservation: its id and the SSH host of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: String,
    pub host: String,
}

pub trait ReservationManager {
    /// Reserve a machine and wait until it accepts SSH.
    fn reserve(&self, request: &ReservationRequest) -> Result<Reservation>;

    fn release(&self, reservation_id: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ReserveResponse {
    reservation_id: String,
    #[serde(default)]
    ssh_host: Option<String>,
    #[serde(default)]
    pod_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GpuDevReservations {
    pub program: String,
}

impl GpuDevReservations {
    pub fn new(cfg: &ReservationConfig) -> Self {
        Self {
            program: cfg.program.clone(),
        }
    }
}

impl ReservationManager for GpuDevReservations {
    #[instrument(skip_all, fields(gpu_type = %request.gpu_type, gpus = request.gpu_count))]
    fn reserve(&self, request: &ReservationRequest) -> Result<Reservation> {
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "reserve",
            "--gpu-type",
            &request.gpu_type,
            "--gpus",
            &request.gpu_count.to_string(),
            "--hours",
            &request.hours.to_string(),
            "--no-persistent-disk",
            "--json",
        ]);
        let stdout = run_command_with_timeout(cmd, None, RESERVE_TIMEOUT, DEFAULT_OUTPUT_LIMIT_BYTES)?
            .into_stdout(&format!("{} reserve", self.program))?;
        let reservation = parse_reserve_output(&stdout)?;
        info!(id = %reservation.id, host = %reservation.host, "machine reserved");
        Ok(reservation)
    }

    #[instrument(skip_all, fields(reservation_id))]
    fn release(&self, reservation_id: &str) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["cancel", reservation_id]);
        run_command_with_timeout(cmd, None, CANCEL_TIMEOUT, DEFAULT_OUTPUT_LIMIT_BYTES)?
            .into_stdout(&format!("{} cancel {reservation_id}", self.program))?;
        info!("reservation released");
        Ok(())
    }
}

fn parse_reserve_output(stdout: &str) -> Result<Reservation> {
    // The JSON object is the last non-empty line; earlier lines are progress.
    let line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| anyhow!("reserve printed nothing"))?;
    let response: ReserveResponse =
        serde_json::from_str(line.trim()).context("parse reserve output")?;
    let host = response
        .ssh_host
        .or(response.pod_name)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| {
            anyhow!(
                "reservation {} returned no host",
                response.reservation_id
            )
        })?;
    Ok(Reservation {
        id: response.reservation_id,
        host,
    })
}
