//! The equipment execution state machine.
//!
//! `EquipmentEngine` drives one rig driver through the device lifecycle. It
//! admits at most one execution at a time: a `start_execution` while already
//! `Executing` is rejected immediately rather than queued (queuing belongs to
//! the lab-server tier). Execution ids are consumed only by admitted
//! executions, so a rejected specification never advances the counter.

use super::rigs::{AcquireOutcome, RigDriver};
use super::{
    ExecutionPhase, ExecutionStart, ExecutionState, ExecutionStatus, ExecutionTimes, LabEquipment,
};
use crate::config::EquipmentSettings;
use crate::error::{AppResult, LabError};
use crate::proto::{ExperimentSpecification, ResultReport, StatusCode, ValidationReport};
use crate::validation::ValidationEngine;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

struct ActiveExecution {
    execution_id: i32,
    admitted_at: Instant,
    estimated_runtime: f64,
    cancel_tx: watch::Sender<bool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

struct FinishedExecution {
    phase: ExecutionPhase,
    report: ResultReport,
}

struct Inner {
    state: ExecutionState,
    next_execution_id: i32,
    last_error: Option<String>,
    times: ExecutionTimes,
    settle_deadline: Option<Instant>,
    active: Option<ActiveExecution>,
    finished: HashMap<i32, FinishedExecution>,
}

/// Device-tier state machine wrapping one [`RigDriver`].
pub struct EquipmentEngine {
    driver: Arc<dyn RigDriver>,
    validator: ValidationEngine,
    settings: EquipmentSettings,
    inner: Arc<Mutex<Inner>>,
}

impl EquipmentEngine {
    /// Create an engine in `Idle` for the given driver and rules.
    pub fn new(
        driver: Arc<dyn RigDriver>,
        validator: ValidationEngine,
        settings: EquipmentSettings,
    ) -> Self {
        Self {
            driver,
            validator,
            settings,
            inner: Arc::new(Mutex::new(Inner {
                state: ExecutionState::Idle,
                next_execution_id: 0,
                last_error: None,
                times: ExecutionTimes::default(),
                settle_deadline: None,
                active: None,
                finished: HashMap::new(),
            })),
        }
    }

    /// Settle delay rounded up to whole seconds.
    fn settle_seconds(&self) -> u64 {
        let delay = self.settings.settle_delay;
        let mut secs = delay.as_secs();
        if delay.subsec_nanos() > 0 {
            secs += 1;
        }
        secs
    }

    fn rejected(validation: ValidationReport) -> ExecutionStart {
        ExecutionStart {
            accepted: false,
            execution_id: -1,
            validation,
        }
    }
}

#[async_trait]
impl LabEquipment for EquipmentEngine {
    async fn status(&self) -> ExecutionState {
        self.inner.lock().await.state
    }

    async fn time_until_ready(&self) -> Duration {
        let inner = self.inner.lock().await;
        match inner.state {
            ExecutionState::Ready => Duration::ZERO,
            ExecutionState::Initialising => inner
                .settle_deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or_default(),
            ExecutionState::Validating | ExecutionState::Executing | ExecutionState::Finalising => {
                let remaining = inner
                    .active
                    .as_ref()
                    .map(|active| {
                        let elapsed = active.admitted_at.elapsed().as_secs_f64();
                        (active.estimated_runtime - elapsed).max(0.0)
                    })
                    .unwrap_or(0.0);
                Duration::from_secs_f64(remaining) + Duration::from_secs(self.settle_seconds())
            }
            ExecutionState::Idle | ExecutionState::Faulted => {
                Duration::from_secs(self.settle_seconds())
            }
            // A disposed device never becomes ready.
            ExecutionState::Disposed => Duration::MAX,
        }
    }

    async fn validate(&self, spec: &ExperimentSpecification) -> ValidationReport {
        self.validator.validate(spec)
    }

    async fn initialise(&self) -> AppResult<bool> {
        if !self.settings.initialise_enabled {
            debug!(rig = self.driver.rig_name(), "initialise disabled by configuration");
            return Ok(false);
        }
        let settle_secs = self.settle_seconds();
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ExecutionState::Idle | ExecutionState::Faulted => {
                    inner.state = ExecutionState::Initialising;
                    inner.settle_deadline =
                        Some(Instant::now() + Duration::from_secs(settle_secs));
                }
                ExecutionState::Ready => return Ok(true),
                ExecutionState::Disposed => return Err(LabError::Disposed),
                _ => return Ok(false),
            }
        }

        info!(
            rig = self.driver.rig_name(),
            settle_secs, "initialising equipment"
        );
        let started = Instant::now();
        // Applied in whole-second increments; interruptible only by process
        // shutdown, not by caller cancellation (known limitation).
        for _ in 0..settle_secs {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let mut inner = self.inner.lock().await;
        // A close() during the settle delay wins: Disposed is terminal and
        // must not be overwritten with Ready.
        match inner.state {
            ExecutionState::Initialising => {
                inner.state = ExecutionState::Ready;
                inner.settle_deadline = None;
                inner.times.initialise = started.elapsed();
                Ok(true)
            }
            ExecutionState::Disposed => Err(LabError::Disposed),
            _ => Ok(false),
        }
    }

    async fn start_execution(&self, spec: &ExperimentSpecification) -> ExecutionStart {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ExecutionState::Ready => {}
            ExecutionState::Executing | ExecutionState::Validating => {
                return Self::rejected(ValidationReport::reject("Equipment busy!"));
            }
            other => {
                return Self::rejected(ValidationReport::reject(format!(
                    "Equipment not ready ({other:?})!"
                )));
            }
        }

        inner.state = ExecutionState::Validating;
        let report = self.validator.validate(spec);
        if !report.accepted {
            // Rejection leaves the device Ready and consumes no execution id.
            inner.state = ExecutionState::Ready;
            return Self::rejected(report);
        }

        inner.next_execution_id += 1;
        let execution_id = inner.next_execution_id;
        inner.state = ExecutionState::Executing;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let admitted_at = Instant::now();
        let estimated_runtime = report.estimated_runtime;

        let driver = Arc::clone(&self.driver);
        let shared = Arc::clone(&self.inner);
        let spec = spec.clone();
        let task = tokio::spawn(async move {
            run_execution(driver, shared, spec, execution_id, admitted_at, cancel_rx).await;
        });

        inner.active = Some(ActiveExecution {
            execution_id,
            admitted_at,
            estimated_runtime,
            cancel_tx,
            task: Some(task),
        });

        info!(execution_id, "execution admitted");
        ExecutionStart {
            accepted: true,
            execution_id,
            validation: report,
        }
    }

    async fn execution_status(&self, execution_id: i32) -> ExecutionStatus {
        let inner = self.inner.lock().await;
        if let Some(active) = inner.active.as_ref() {
            if active.execution_id == execution_id {
                let phase = match inner.state {
                    ExecutionState::Executing | ExecutionState::Finalising => {
                        ExecutionPhase::Running
                    }
                    _ => ExecutionPhase::Starting,
                };
                let elapsed = active.admitted_at.elapsed().as_secs_f64();
                return ExecutionStatus {
                    execution_id,
                    phase,
                    estimated_remaining: (active.estimated_runtime - elapsed).max(0.0),
                };
            }
        }
        if let Some(finished) = inner.finished.get(&execution_id) {
            return ExecutionStatus {
                execution_id,
                phase: finished.phase,
                estimated_remaining: 0.0,
            };
        }
        ExecutionStatus {
            execution_id,
            phase: ExecutionPhase::Unknown,
            estimated_remaining: 0.0,
        }
    }

    async fn take_last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.take()
    }

    async fn execution_results(&self, execution_id: i32) -> ResultReport {
        let inner = self.inner.lock().await;
        if let Some(finished) = inner.finished.get(&execution_id) {
            return finished.report.clone();
        }
        let active = inner
            .active
            .as_ref()
            .is_some_and(|a| a.execution_id == execution_id);
        if active {
            ResultReport::not_ready(StatusCode::Running)
        } else {
            ResultReport::not_ready(StatusCode::Unknown)
        }
    }

    async fn cancel_execution(&self, execution_id: i32) -> bool {
        let inner = self.inner.lock().await;
        if inner.state != ExecutionState::Executing {
            return false;
        }
        match inner.active.as_ref() {
            Some(active) if active.execution_id == execution_id => {
                let _ = active.cancel_tx.send(true);
                info!(execution_id, "cancel requested");
                true
            }
            _ => false,
        }
    }

    async fn discard_execution(&self, execution_id: i32) {
        let mut inner = self.inner.lock().await;
        if inner.finished.remove(&execution_id).is_some() {
            debug!(execution_id, "finished execution discarded");
        }
    }

    async fn execution_times(&self) -> ExecutionTimes {
        self.inner.lock().await.times
    }

    async fn close(&self) {
        let (cancel, task) = {
            let mut inner = self.inner.lock().await;
            if inner.state == ExecutionState::Disposed {
                return;
            }
            match inner.active.as_mut() {
                Some(active) => (Some(active.cancel_tx.clone()), active.task.take()),
                None => (None, None),
            }
        };
        if let Some(cancel_tx) = cancel {
            let _ = cancel_tx.send(true);
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "execution task ended abnormally during close");
            }
        }
        let mut inner = self.inner.lock().await;
        inner.state = ExecutionState::Disposed;
        inner.active = None;
        info!(rig = self.driver.rig_name(), "equipment disposed");
    }
}

async fn run_execution(
    driver: Arc<dyn RigDriver>,
    shared: Arc<Mutex<Inner>>,
    spec: ExperimentSpecification,
    execution_id: i32,
    admitted_at: Instant,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let run_started = Instant::now();
    let outcome = driver.acquire(&spec, &mut cancel_rx).await;
    let run_elapsed = run_started.elapsed();
    let stop_started = Instant::now();

    let mut inner = shared.lock().await;
    inner.state = ExecutionState::Finalising;
    let finalise_started = Instant::now();

    let (phase, next_state, report) = match outcome {
        Ok(AcquireOutcome::Completed { results, warnings }) => {
            info!(execution_id, "execution completed");
            (
                ExecutionPhase::Completed,
                ExecutionState::Idle,
                ResultReport {
                    status_code: StatusCode::Completed,
                    error_message: None,
                    experiment_results: Some(results),
                    warning_messages: warnings,
                    xml_result_extension: None,
                    xml_blob_extension: None,
                },
            )
        }
        Ok(AcquireOutcome::Cancelled) => {
            info!(execution_id, "execution cancelled");
            (
                ExecutionPhase::Cancelled,
                ExecutionState::Idle,
                ResultReport::not_ready(StatusCode::Cancelled),
            )
        }
        Err(e) => {
            warn!(execution_id, error = %e, "execution failed");
            inner.last_error = Some(e.to_string());
            (
                ExecutionPhase::Failed,
                ExecutionState::Faulted,
                ResultReport {
                    status_code: StatusCode::Failed,
                    error_message: Some(e.to_string()),
                    experiment_results: None,
                    warning_messages: Vec::new(),
                    xml_result_extension: None,
                    xml_blob_extension: None,
                },
            )
        }
    };

    inner.times.start = run_started.saturating_duration_since(admitted_at);
    inner.times.run = run_elapsed;
    inner.times.stop = stop_started.saturating_duration_since(run_started + run_elapsed);
    inner.times.finalise = finalise_started.elapsed();
    inner.finished.insert(execution_id, FinishedExecution { phase, report });
    inner.active = None;
    inner.state = next_state;
}
