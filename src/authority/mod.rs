//! Lab-server tier: the per-lab-server dispatcher.
//!
//! `LabServerAuthority` owns the experiment-identity sequence (delegated to
//! the store so it can be a storage-layer atomic sequence), performs
//! admission control, routes device commands to its [`LabEquipment`], and
//! persists experiment records. The device admits one execution at a time;
//! queuing of admitted experiments happens here, not at the device tier.
//!
//! Offline behavior: when the administrative online flag is false every call
//! short-circuits with a placeholder response (`Unknown` status, rejecting
//! validation report) instead of touching the device.

pub mod queue;
pub mod store;

pub use queue::{RuntimeSumEstimator, WaitEstimator};
pub use store::{ExperimentRecord, ExperimentStore, MemoryStore, RetrieveBy};

use crate::auth::AuthCredential;
use crate::config::LabServerSettings;
use crate::equipment::{ExecutionPhase, LabEquipment};
use crate::error::{AppResult, LabError};
use crate::proto::{
    to_xml, ConfiguredRange, ExperimentSpecification, ExperimentStatus, LabConfiguration,
    LabExperimentStatus, LabStatus, ResultReport, StatusCode, SubmissionReport, ValidationReport,
    WaitEstimate,
};
use crate::validation::ValidationEngine;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// Fired on every terminal transition, for completion callbacks.
#[derive(Clone, Debug)]
pub struct CompletionEvent {
    /// The experiment that reached a terminal state.
    pub experiment_id: i32,
    /// Its terminal status.
    pub status: StatusCode,
}

/// Per-lab-server dispatcher: identity, admission, device routing,
/// persistence.
pub struct LabServerAuthority {
    settings: LabServerSettings,
    validator: ValidationEngine,
    store: Arc<dyn ExperimentStore>,
    equipment: Arc<dyn LabEquipment>,
    estimator: Arc<dyn WaitEstimator>,
    /// Serializes device turns so admitted experiments run in order.
    device_turn: Arc<Mutex<()>>,
    completions: broadcast::Sender<CompletionEvent>,
    poll_interval: Duration,
}

impl LabServerAuthority {
    /// Assemble an authority over its store, equipment, and wait strategy.
    pub fn new(
        settings: LabServerSettings,
        store: Arc<dyn ExperimentStore>,
        equipment: Arc<dyn LabEquipment>,
        estimator: Arc<dyn WaitEstimator>,
    ) -> Self {
        let validator = settings.rig.validation_engine();
        let (completions, _) = broadcast::channel(64);
        Self {
            settings,
            validator,
            store,
            equipment,
            estimator,
            device_turn: Arc::new(Mutex::new(())),
            completions,
            poll_interval: Duration::from_millis(200),
        }
    }

    /// Override the execution status polling interval (tests).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// This lab server's GUID.
    pub fn guid(&self) -> &str {
        &self.settings.guid
    }

    /// Subscribe to terminal-transition events.
    pub fn subscribe_completions(&self) -> broadcast::Receiver<CompletionEvent> {
        self.completions.subscribe()
    }

    /// Verify a caller credential against the configured passkey.
    pub fn authenticate(&self, credential: &AuthCredential) -> AppResult<()> {
        match &self.settings.required_passkey {
            None => Ok(()),
            Some(required) if credential.passkey == *required => Ok(()),
            Some(_) => {
                warn!(
                    caller = %credential.identifier,
                    "lab server rejected credential"
                );
                Err(LabError::Auth(format!(
                    "invalid passkey for lab server {}",
                    self.settings.guid
                )))
            }
        }
    }

    /// `GetLabStatus`.
    pub async fn lab_status(&self) -> LabStatus {
        LabStatus {
            online: self.settings.online,
            lab_status_message: self.settings.status_message.clone(),
        }
    }

    /// `GetLabConfiguration`: the static rig configuration document.
    pub async fn lab_configuration(&self, user_group: &str) -> AppResult<String> {
        debug!(user_group, "lab configuration requested");
        let ranges = self
            .validator
            .named_ranges()
            .into_iter()
            .map(|(name, range)| ConfiguredRange {
                name: name.to_string(),
                minimum: range.minimum,
                maximum: range.maximum,
                step_minimum: range.step.map(|s| s.minimum),
                step_maximum: range.step.map(|s| s.maximum),
            })
            .collect();
        to_xml(&LabConfiguration {
            title: self.settings.title.clone(),
            version: "1.0".to_string(),
            setup_ids: self.validator.setup_ids(),
            ranges,
        })
    }

    /// `GetLabInfo`: free-text deployment description.
    pub async fn lab_info(&self) -> String {
        format!(
            "{} ({}): {}",
            self.settings.title, self.settings.guid, self.settings.status_message
        )
    }

    /// `Validate`: check a specification document with no side effects.
    pub async fn validate(&self, spec_xml: &str, user_group: &str) -> AppResult<ValidationReport> {
        if !self.settings.online {
            return Ok(ValidationReport::reject("Lab server is offline!"));
        }
        debug!(user_group, "validate requested");
        let spec = ExperimentSpecification::parse(spec_xml)?;
        Ok(self.validator.validate(&spec))
    }

    /// `GetEffectiveQueueLength`.
    pub async fn effective_queue_length(
        &self,
        user_group: &str,
        priority_hint: i32,
    ) -> AppResult<WaitEstimate> {
        if !self.settings.online {
            return Ok(WaitEstimate::empty());
        }
        debug!(user_group, priority_hint, "queue length requested");
        let outstanding = self.store.retrieve_by(RetrieveBy::NonTerminal).await?;
        Ok(self.estimator.estimate(&outstanding, priority_hint))
    }

    /// `Submit`: validate, admit, persist, and start asynchronous execution.
    ///
    /// `experiment_id` is normally `None` and the authority reserves the next
    /// id from its sequence; a caller that pre-assigns ids (a broker tier
    /// carrying its own sequence) may pass `Some`.
    pub async fn submit(
        &self,
        experiment_id: Option<i32>,
        spec_xml: &str,
        user_group: &str,
        priority_hint: i32,
    ) -> AppResult<SubmissionReport> {
        if !self.settings.online {
            return Ok(SubmissionReport {
                experiment_id: -1,
                min_time_to_live: 0.0,
                validation_report: ValidationReport::reject("Lab server is offline!"),
                wait_estimate: WaitEstimate::empty(),
            });
        }

        let spec = ExperimentSpecification::parse(spec_xml)?;
        let report = self.validator.validate(&spec);
        let outstanding = self.store.retrieve_by(RetrieveBy::NonTerminal).await?;
        let wait_estimate = self.estimator.estimate(&outstanding, priority_hint);

        if !report.accepted {
            return Ok(SubmissionReport {
                experiment_id: -1,
                min_time_to_live: 0.0,
                validation_report: report,
                wait_estimate,
            });
        }

        let experiment_id = match experiment_id {
            Some(id) => id,
            None => self.store.next_experiment_id().await?,
        };

        let record = ExperimentRecord {
            experiment_id,
            lab_server_guid: self.settings.guid.clone(),
            execution_id: None,
            status: StatusCode::Queued,
            estimated_runtime: report.estimated_runtime,
            min_time_to_live: self.settings.min_time_to_live_days,
            submitted_at: Utc::now(),
            user_group: user_group.to_string(),
            priority_hint,
            cancel_requested: false,
            result: None,
        };
        self.store.add(record).await?;
        info!(
            experiment_id,
            user_group,
            points = spec.summary().point_count(),
            "experiment admitted"
        );

        self.spawn_runner(experiment_id, spec);

        Ok(SubmissionReport {
            experiment_id,
            min_time_to_live: self.settings.min_time_to_live_days,
            validation_report: report,
            wait_estimate,
        })
    }

    /// `GetExperimentStatus`.
    pub async fn experiment_status(&self, experiment_id: i32) -> AppResult<LabExperimentStatus> {
        if !self.settings.online {
            return Ok(LabExperimentStatus {
                min_time_to_live: 0.0,
                status: ExperimentStatus::unknown(),
            });
        }
        let Some(record) = self.find(experiment_id).await? else {
            return Ok(LabExperimentStatus {
                min_time_to_live: 0.0,
                status: ExperimentStatus::unknown(),
            });
        };

        let remaining = match (record.status, record.execution_id) {
            (StatusCode::Running, Some(execution_id)) => {
                self.equipment
                    .execution_status(execution_id)
                    .await
                    .estimated_remaining
            }
            (StatusCode::Queued, _) => record.estimated_runtime,
            _ => 0.0,
        };
        let outstanding = self.store.retrieve_by(RetrieveBy::NonTerminal).await?;
        let wait_estimate = self.estimator.estimate(&outstanding, record.priority_hint);

        Ok(LabExperimentStatus {
            min_time_to_live: record.min_time_to_live,
            status: ExperimentStatus {
                status_code: record.status,
                estimated_runtime: record.estimated_runtime,
                estimated_remaining_runtime: remaining,
                wait_estimate,
            },
        })
    }

    /// `RetrieveResult`: final report once terminal, placeholder before.
    pub async fn retrieve_result(&self, experiment_id: i32) -> AppResult<ResultReport> {
        if !self.settings.online {
            return Ok(ResultReport::not_ready(StatusCode::Unknown));
        }
        let Some(record) = self.find(experiment_id).await? else {
            return Ok(ResultReport::not_ready(StatusCode::Unknown));
        };
        if record.status.is_terminal() {
            if let Some(result) = record.result {
                return Ok(result);
            }
            return Ok(ResultReport::not_ready(record.status));
        }
        Ok(ResultReport::not_ready(record.status))
    }

    /// `Cancel`: idempotent; returns false when there is nothing to cancel.
    pub async fn cancel(&self, experiment_id: i32) -> AppResult<bool> {
        if !self.settings.online {
            return Ok(false);
        }
        let Some(mut record) = self.find(experiment_id).await? else {
            return Ok(false);
        };
        match record.status {
            StatusCode::Queued => {
                record.status = StatusCode::Cancelled;
                record.result = Some(ResultReport::not_ready(StatusCode::Cancelled));
                self.store.update(record).await?;
                info!(experiment_id, "queued experiment cancelled");
                let _ = self.completions.send(CompletionEvent {
                    experiment_id,
                    status: StatusCode::Cancelled,
                });
                Ok(true)
            }
            StatusCode::Running => {
                let Some(execution_id) = record.execution_id else {
                    return Ok(false);
                };
                if record.cancel_requested {
                    // Already forwarded; the device is winding down.
                    return Ok(false);
                }
                record.cancel_requested = true;
                self.store.update(record).await?;
                // The runner observes the device-side cancellation and
                // records the terminal state.
                Ok(self.equipment.cancel_execution(execution_id).await)
            }
            _ => Ok(false),
        }
    }

    /// `Delete`-style retention hook: drop a terminal record.
    pub async fn delete(&self, experiment_id: i32) -> AppResult<bool> {
        self.store.delete(experiment_id).await
    }

    async fn find(&self, experiment_id: i32) -> AppResult<Option<ExperimentRecord>> {
        Ok(self
            .store
            .retrieve_by(RetrieveBy::ExperimentId(experiment_id))
            .await?
            .into_iter()
            .next())
    }

    /// Spawn the device turn for one admitted experiment.
    fn spawn_runner(&self, experiment_id: i32, spec: ExperimentSpecification) {
        let store = Arc::clone(&self.store);
        let equipment = Arc::clone(&self.equipment);
        let device_turn = Arc::clone(&self.device_turn);
        let completions = self.completions.clone();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            // The device admits one execution at a time; the turn lock keeps
            // admitted experiments in submission order.
            let _turn = device_turn.lock().await;

            let record = match store
                .retrieve_by(RetrieveBy::ExperimentId(experiment_id))
                .await
            {
                Ok(rows) => rows.into_iter().next(),
                Err(e) => {
                    error!(experiment_id, error = %e, "runner could not load record");
                    return;
                }
            };
            let Some(mut record) = record else { return };
            if record.status != StatusCode::Queued {
                // Cancelled while waiting for its turn.
                return;
            }

            let terminal = run_on_device(&*equipment, &spec, &mut record, &*store, poll_interval)
                .await;
            let _ = completions.send(CompletionEvent {
                experiment_id,
                status: terminal,
            });
        });
    }
}

/// Drive one experiment through the device tier and record the outcome.
async fn run_on_device(
    equipment: &dyn LabEquipment,
    spec: &ExperimentSpecification,
    record: &mut ExperimentRecord,
    store: &dyn ExperimentStore,
    poll_interval: Duration,
) -> StatusCode {
    let fail = |record: &mut ExperimentRecord, message: String| {
        record.status = StatusCode::Failed;
        record.result = Some(ResultReport {
            status_code: StatusCode::Failed,
            error_message: Some(message),
            experiment_results: None,
            warning_messages: Vec::new(),
            xml_result_extension: None,
            xml_blob_extension: None,
        });
    };

    // Bring the device to Ready if a previous run left it Idle or Faulted.
    match equipment.initialise().await {
        Ok(true) => {}
        Ok(false) => {
            fail(record, "Equipment initialise is disabled".to_string());
            let _ = store.update(record.clone()).await;
            return StatusCode::Failed;
        }
        Err(e) => {
            error!(experiment_id = record.experiment_id, error = %e, "initialise failed");
            fail(record, "Equipment unavailable".to_string());
            let _ = store.update(record.clone()).await;
            return StatusCode::Failed;
        }
    }

    let start = equipment.start_execution(spec).await;
    if !start.accepted {
        let message = start
            .validation
            .error_message
            .unwrap_or_else(|| "Execution rejected".to_string());
        fail(record, message);
        let _ = store.update(record.clone()).await;
        return StatusCode::Failed;
    }

    record.execution_id = Some(start.execution_id);
    record.status = StatusCode::Running;
    if let Err(e) = store.update(record.clone()).await {
        warn!(experiment_id = record.experiment_id, error = %e, "status update failed");
    }
    info!(
        experiment_id = record.experiment_id,
        execution_id = start.execution_id,
        "execution started"
    );

    // Poll the device until the execution reaches a terminal phase.
    let terminal = loop {
        tokio::time::sleep(poll_interval).await;
        let status = equipment.execution_status(start.execution_id).await;
        match status.phase {
            ExecutionPhase::Completed => break StatusCode::Completed,
            ExecutionPhase::Failed => break StatusCode::Failed,
            ExecutionPhase::Cancelled => break StatusCode::Cancelled,
            ExecutionPhase::Unknown => break StatusCode::Failed,
            ExecutionPhase::Starting | ExecutionPhase::Running => {}
        }
    };

    let mut result = equipment.execution_results(start.execution_id).await;
    if terminal == StatusCode::Failed && result.error_message.is_none() {
        result.error_message = equipment.take_last_error().await;
    }
    // The record now carries the report; the device no longer needs to
    // retain the finished execution.
    equipment.discard_execution(start.execution_id).await;
    record.status = terminal;
    record.result = Some(result);
    if let Err(e) = store.update(record.clone()).await {
        warn!(experiment_id = record.experiment_id, error = %e, "final update failed");
    }
    info!(
        experiment_id = record.experiment_id,
        status = ?terminal,
        "experiment terminal"
    );
    terminal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EquipmentSettings, LabServerSettings};
    use crate::equipment::{EquipmentEngine, MachineRig};

    fn authority() -> LabServerAuthority {
        let settings = LabServerSettings::default();
        let equipment = Arc::new(EquipmentEngine::new(
            Arc::new(MachineRig::new(Duration::from_millis(1))),
            settings.rig.validation_engine(),
            EquipmentSettings {
                initialise_enabled: true,
                settle_delay: Duration::ZERO,
            },
        ));
        LabServerAuthority::new(
            settings,
            Arc::new(MemoryStore::new()),
            equipment,
            Arc::new(RuntimeSumEstimator),
        )
        .with_poll_interval(Duration::from_millis(10))
    }

    fn field_sweep_xml() -> String {
        "<experimentSpecification><setupId>VoltageVsField</setupId>\
         <fieldMin>0</fieldMin><fieldMax>100</fieldMax><fieldStep>5</fieldStep>\
         <load>10</load><speed>1000</speed></experimentSpecification>"
            .to_string()
    }

    async fn wait_terminal(authority: &LabServerAuthority, id: i32) -> StatusCode {
        for _ in 0..300 {
            let status = authority.experiment_status(id).await.unwrap();
            if status.status.status_code.is_terminal() {
                return status.status.status_code;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        StatusCode::Unknown
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let authority = authority();
        let report = authority
            .submit(None, &field_sweep_xml(), "students", 0)
            .await
            .unwrap();
        assert!(report.validation_report.accepted);
        assert_eq!(report.experiment_id, 1);

        assert_eq!(
            wait_terminal(&authority, report.experiment_id).await,
            StatusCode::Completed
        );
        let result = authority
            .retrieve_result(report.experiment_id)
            .await
            .unwrap();
        assert_eq!(result.status_code, StatusCode::Completed);
        assert!(result.experiment_results.is_some());
    }

    #[tokio::test]
    async fn test_rejected_submission_assigns_no_id() {
        let authority = authority();
        let bad = "<experimentSpecification><setupId>VoltageVsField</setupId>\
                   <fieldMin>0</fieldMin><fieldMax>100</fieldMax><fieldStep>20</fieldStep>\
                   <load>10</load><speed>1000</speed></experimentSpecification>";
        let report = authority.submit(None, bad, "students", 0).await.unwrap();
        assert!(!report.validation_report.accepted);
        assert_eq!(report.experiment_id, -1);

        // The sequence was not consumed.
        let good = authority
            .submit(None, &field_sweep_xml(), "students", 0)
            .await
            .unwrap();
        assert_eq!(good.experiment_id, 1);
    }

    #[tokio::test]
    async fn test_retrieve_result_before_terminal_is_placeholder() {
        let authority = authority();
        let report = authority
            .submit(None, &field_sweep_xml(), "students", 0)
            .await
            .unwrap();
        let result = authority
            .retrieve_result(report.experiment_id)
            .await
            .unwrap();
        // Never blocks, never errors; carries the current status.
        assert!(!result.status_code.is_terminal() || result.experiment_results.is_some());
        let _ = wait_terminal(&authority, report.experiment_id).await;
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let authority = authority();
        let report = authority
            .submit(None, &field_sweep_xml(), "students", 0)
            .await
            .unwrap();
        let id = report.experiment_id;

        // First cancel succeeds (queued or running).
        let first = authority.cancel(id).await.unwrap();
        let status = wait_terminal(&authority, id).await;
        if first {
            assert_eq!(status, StatusCode::Cancelled);
        }
        // Second cancel on a terminal experiment is a no-op returning false.
        assert!(!authority.cancel(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_cancel_while_running_returns_false() {
        // Slow rig so the experiment is reliably Running when cancelled.
        let settings = LabServerSettings::default();
        let equipment = Arc::new(EquipmentEngine::new(
            Arc::new(MachineRig::new(Duration::from_millis(50))),
            settings.rig.validation_engine(),
            EquipmentSettings {
                initialise_enabled: true,
                settle_delay: Duration::ZERO,
            },
        ));
        let authority = LabServerAuthority::new(
            settings,
            Arc::new(MemoryStore::new()),
            equipment,
            Arc::new(RuntimeSumEstimator),
        )
        .with_poll_interval(Duration::from_millis(10));

        let report = authority
            .submit(None, &field_sweep_xml(), "students", 0)
            .await
            .unwrap();
        let id = report.experiment_id;
        for _ in 0..300 {
            let status = authority.experiment_status(id).await.unwrap();
            if status.status.status_code == StatusCode::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(authority.cancel(id).await.unwrap());
        // The device has not observed the cancel yet; a repeat must not
        // report a second successful cancellation.
        assert!(!authority.cancel(id).await.unwrap());
        assert_eq!(wait_terminal(&authority, id).await, StatusCode::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_id_yields_unknown_status() {
        let authority = authority();
        let status = authority.experiment_status(777).await.unwrap();
        assert_eq!(status.status.status_code, StatusCode::Unknown);
        assert!(!authority.cancel(777).await.unwrap());
        let result = authority.retrieve_result(777).await.unwrap();
        assert_eq!(result.status_code, StatusCode::Unknown);
    }

    #[tokio::test]
    async fn test_offline_short_circuits() {
        let mut settings = LabServerSettings::default();
        settings.online = false;
        let equipment = Arc::new(EquipmentEngine::new(
            Arc::new(MachineRig::new(Duration::from_millis(1))),
            settings.rig.validation_engine(),
            EquipmentSettings::default(),
        ));
        let authority = LabServerAuthority::new(
            settings,
            Arc::new(MemoryStore::new()),
            equipment,
            Arc::new(RuntimeSumEstimator),
        );

        assert!(!authority.lab_status().await.online);
        let report = authority
            .submit(None, &field_sweep_xml(), "students", 0)
            .await
            .unwrap();
        assert!(!report.validation_report.accepted);
        let status = authority.experiment_status(1).await.unwrap();
        assert_eq!(status.status.status_code, StatusCode::Unknown);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_get_unique_increasing_ids() {
        let authority = Arc::new(authority());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let authority = Arc::clone(&authority);
            handles.push(tokio::spawn(async move {
                authority
                    .submit(None, &field_sweep_xml(), "students", 0)
                    .await
                    .unwrap()
                    .experiment_id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        let mut deduped = ids.clone();
        deduped.dedup();
        assert_eq!(ids, deduped, "experiment ids must never collide");
        assert_eq!(ids, (1..=8).collect::<Vec<i32>>());
    }

    #[tokio::test]
    async fn test_lab_configuration_document() {
        let authority = authority();
        let xml = authority.lab_configuration("students").await.unwrap();
        assert!(xml.contains("labConfiguration"));
        assert!(xml.contains("VoltageVsField"));
        assert!(xml.contains("field"));
    }

    #[tokio::test]
    async fn test_authenticate_checks_passkey() {
        let mut settings = LabServerSettings::default();
        settings.required_passkey = Some("secret".to_string());
        let equipment = Arc::new(EquipmentEngine::new(
            Arc::new(MachineRig::new(Duration::from_millis(1))),
            settings.rig.validation_engine(),
            EquipmentSettings::default(),
        ));
        let authority = LabServerAuthority::new(
            settings,
            Arc::new(MemoryStore::new()),
            equipment,
            Arc::new(RuntimeSumEstimator),
        );

        assert!(authority
            .authenticate(&AuthCredential::new("broker-1", "secret"))
            .is_ok());
        assert!(authority
            .authenticate(&AuthCredential::new("broker-1", "wrong"))
            .is_err());
    }
}
