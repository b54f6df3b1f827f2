//! Equipment tier: the device-side execution contract and state machine.
//!
//! One [`LabEquipment`] instance models exactly one physical device. The
//! concrete rigs implement [`rigs::RigDriver`] (the acquisition seam; the
//! physics behind it is out of scope) and are driven by
//! [`engine::EquipmentEngine`], which owns the execution lifecycle:
//!
//! ```text
//! Idle -> Initialising -> Ready -> Validating -> Executing -> Finalising -> {Idle, Faulted}
//! ```
//!
//! `Disposed` is a cross-cutting terminal state reachable from any
//! non-executing state via the idempotent `close`.

pub mod engine;
pub mod rigs;

pub use engine::EquipmentEngine;
pub use rigs::{MachineRig, RadioactivityRig, RigDriver};

use crate::proto::{ExperimentSpecification, ResultReport, ValidationReport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Device-tier execution lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    /// Powered but not initialised; `initialise` is required before use.
    Idle,
    /// Initialise in progress (settle delay counting down).
    Initialising,
    /// Initialised and able to accept an execution.
    Ready,
    /// Checking a submitted specification.
    Validating,
    /// Running an execution; only one at a time.
    Executing,
    /// Post-run cleanup.
    Finalising,
    /// A fault was captured; `initialise` clears it.
    Faulted,
    /// Closed; every further operation is rejected.
    Disposed,
}

/// Elapsed per-phase durations for one run, for post-hoc performance
/// accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTimes {
    /// Time spent in `Initialising` (settle delay included).
    pub initialise: Duration,
    /// Time from accept to the driver starting.
    pub start: Duration,
    /// Driver acquisition time.
    pub run: Duration,
    /// Time from driver return to cleanup start.
    pub stop: Duration,
    /// Time spent in `Finalising`.
    pub finalise: Duration,
}

impl ExecutionTimes {
    /// Sum of all phases.
    pub fn total_execution_time(&self) -> Duration {
        self.initialise + self.start + self.run + self.stop + self.finalise
    }
}

/// Response to `start_execution`.
#[derive(Clone, Debug)]
pub struct ExecutionStart {
    /// True when validation passed and the execution was admitted.
    pub accepted: bool,
    /// Assigned execution id; `-1` when not admitted.
    pub execution_id: i32,
    /// Validation outcome (carries the rejection reason when rejected).
    pub validation: ValidationReport,
}

/// Response to `execution_status`.
#[derive(Clone, Debug)]
pub struct ExecutionStatus {
    /// The queried execution id.
    pub execution_id: i32,
    /// Current phase: the live device state for the active execution, or the
    /// terminal phase recorded for a finished one.
    pub phase: ExecutionPhase,
    /// Remaining-time estimate in seconds, never negative.
    pub estimated_remaining: f64,
}

/// Phase of one execution as reported by `execution_status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionPhase {
    /// Admitted, device still validating or spinning up.
    Starting,
    /// Acquisition in progress.
    Running,
    /// Finished normally.
    Completed,
    /// Finished with a fault.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
    /// Execution id not known to this device.
    Unknown,
}

/// Equipment-tier contract implemented by every concrete rig host.
///
/// Mirrors the device-level RPC surface: status, readiness, validation,
/// execution control, and disposal.
#[async_trait]
pub trait LabEquipment: Send + Sync {
    /// Current device state (`GetLabEquipmentStatus`).
    async fn status(&self) -> ExecutionState;

    /// Estimate until the device can accept an execution
    /// (`GetTimeUntilReady`).
    async fn time_until_ready(&self) -> Duration;

    /// Check a specification without side effects.
    async fn validate(&self, spec: &ExperimentSpecification) -> ValidationReport;

    /// Bring the device from `Idle` (or `Faulted`) to `Ready`. Returns
    /// `Ok(false)` when initialise is disabled by configuration.
    ///
    /// Known limitation: the settle delay is applied in whole-second
    /// increments and is interruptible only by process shutdown, not by
    /// caller cancellation.
    async fn initialise(&self) -> crate::error::AppResult<bool>;

    /// Validate and, if accepted, start executing the specification.
    /// A rejection leaves the device in `Ready` and does not consume an
    /// execution id. Fails fast (rejects) while another execution is active.
    async fn start_execution(&self, spec: &ExperimentSpecification) -> ExecutionStart;

    /// Phase and remaining-time estimate for one execution.
    async fn execution_status(&self, execution_id: i32) -> ExecutionStatus;

    /// Take the last captured error, clearing it. One-shot: a second call
    /// returns `None` until another error is captured.
    async fn take_last_error(&self) -> Option<String>;

    /// Results for a finished execution; a well-formed placeholder before
    /// that (`GetLabExecutionResults`).
    async fn execution_results(&self, execution_id: i32) -> ResultReport;

    /// Cancel an in-progress execution. Permitted only while `Executing`;
    /// in any other state this returns `false` and changes nothing.
    async fn cancel_execution(&self, execution_id: i32) -> bool;

    /// Drop the retained record of a finished execution once its results
    /// have been collected, so long-lived devices do not accumulate one
    /// entry per run. Unknown or still-active ids are a no-op.
    async fn discard_execution(&self, execution_id: i32);

    /// Per-phase timings of the most recently finished run.
    async fn execution_times(&self) -> ExecutionTimes;

    /// Dispose the device. Idempotent: closing an already-disposed instance
    /// is a no-op, never an error. An active execution is cancelled first.
    async fn close(&self);
}
