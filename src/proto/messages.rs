//! Report, status, and configuration documents.
//!
//! These are the fixed-schema messages of the protocol: validation and
//! submission reports, wait estimates, experiment status, result reports, and
//! the static lab-configuration document. All serialize with a camelCase root
//! element per message type.

use serde::{Deserialize, Serialize};

/// Canonical experiment/execution state carried on every status response.
///
/// The numeric values are a deployment contract with unmigrated peers and
/// must never be renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum StatusCode {
    /// Admitted and waiting for the equipment.
    Queued,
    /// Execution in progress on the equipment.
    Running,
    /// Terminated normally; results available.
    Completed,
    /// Terminated with errors; a partial result report may be available.
    Failed,
    /// Cancelled by the client or an administrator.
    Cancelled,
    /// Id unrecognized, or the lab server is administratively offline.
    Unknown,
}

impl StatusCode {
    /// True for `Completed`, `Failed`, and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StatusCode::Completed | StatusCode::Failed | StatusCode::Cancelled
        )
    }
}

impl From<StatusCode> for i32 {
    fn from(code: StatusCode) -> Self {
        match code {
            StatusCode::Queued => 1,
            StatusCode::Running => 2,
            StatusCode::Completed => 3,
            StatusCode::Failed => 4,
            StatusCode::Cancelled => 5,
            StatusCode::Unknown => 6,
        }
    }
}

impl From<i32> for StatusCode {
    fn from(value: i32) -> Self {
        match value {
            1 => StatusCode::Queued,
            2 => StatusCode::Running,
            3 => StatusCode::Completed,
            4 => StatusCode::Failed,
            5 => StatusCode::Cancelled,
            _ => StatusCode::Unknown,
        }
    }
}

/// Outcome of checking a specification against the configured ranges.
///
/// Produced per validate/submit call; never persisted. A rejection is a
/// normal response value, not an error.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename = "validationReport", rename_all = "camelCase")]
pub struct ValidationReport {
    /// True when every range check passed.
    pub accepted: bool,
    /// First violated rule, verbatim. Empty when accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Non-fatal remarks (e.g. long estimated runtime).
    #[serde(default, rename = "warningMessage")]
    pub warning_messages: Vec<String>,
    /// Predicted runtime in seconds for an accepted specification.
    pub estimated_runtime: f64,
}

impl ValidationReport {
    /// Build an accepting report with the given runtime estimate.
    pub fn accept(estimated_runtime: f64) -> Self {
        Self {
            accepted: true,
            error_message: None,
            warning_messages: Vec::new(),
            estimated_runtime,
        }
    }

    /// Build a rejecting report carrying the first violated rule.
    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            error_message: Some(message.into()),
            warning_messages: Vec::new(),
            estimated_runtime: 0.0,
        }
    }
}

/// Admission-control signal: computed on demand, never stored.
///
/// Both fields are guaranteed non-negative by construction.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename = "waitEstimate", rename_all = "camelCase")]
pub struct WaitEstimate {
    /// Number of non-terminal experiments ahead of the caller.
    pub effective_queue_length: i32,
    /// Predicted wait in seconds before execution would start.
    pub estimated_wait: f64,
}

impl WaitEstimate {
    /// Clamp inputs to the non-negativity contract.
    pub fn new(effective_queue_length: i32, estimated_wait: f64) -> Self {
        Self {
            effective_queue_length: effective_queue_length.max(0),
            estimated_wait: estimated_wait.max(0.0),
        }
    }

    /// An empty queue.
    pub fn empty() -> Self {
        Self::new(0, 0.0)
    }
}

/// Response to `Submit`: the assigned id plus validation and queue outlook.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename = "submissionReport", rename_all = "camelCase")]
pub struct SubmissionReport {
    /// Assigned experiment id; meaningless when the specification was rejected.
    pub experiment_id: i32,
    /// Guaranteed retention of the experiment record, in days.
    pub min_time_to_live: f64,
    /// Validation outcome for the submitted specification.
    #[serde(rename = "validationReport")]
    pub validation_report: ValidationReport,
    /// Queue outlook at admission time.
    #[serde(rename = "waitEstimate")]
    pub wait_estimate: WaitEstimate,
}

/// Status of one experiment as seen by the broker / lab server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename = "experimentStatus", rename_all = "camelCase")]
pub struct ExperimentStatus {
    /// Canonical state (see [`StatusCode`]).
    pub status_code: StatusCode,
    /// Predicted total runtime in seconds.
    pub estimated_runtime: f64,
    /// Predicted remaining runtime in seconds.
    pub estimated_remaining_runtime: f64,
    /// Queue outlook at the time of the call.
    #[serde(rename = "waitEstimate")]
    pub wait_estimate: WaitEstimate,
}

impl ExperimentStatus {
    /// Status for an unrecognized id or an offline lab server.
    pub fn unknown() -> Self {
        Self {
            status_code: StatusCode::Unknown,
            estimated_runtime: 0.0,
            estimated_remaining_runtime: 0.0,
            wait_estimate: WaitEstimate::empty(),
        }
    }
}

/// `GetExperimentStatus` response: retention plus nested status.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename = "labExperimentStatus", rename_all = "camelCase")]
pub struct LabExperimentStatus {
    /// Guaranteed retention of the experiment record, in days.
    pub min_time_to_live: f64,
    /// Nested experiment status.
    #[serde(rename = "experimentStatus")]
    pub status: ExperimentStatus,
}

/// `RetrieveResult` response.
///
/// Requesting results before the experiment is terminal yields a well-formed
/// report whose `status_code` says why no result document is present.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename = "resultReport", rename_all = "camelCase")]
pub struct ResultReport {
    /// State of the experiment at retrieval time.
    pub status_code: StatusCode,
    /// Failure detail for `Failed` experiments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Result document (XML), present only once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_results: Option<String>,
    /// Non-fatal remarks captured during execution.
    #[serde(default, rename = "warningMessage")]
    pub warning_messages: Vec<String>,
    /// Deployment-specific extension payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xml_result_extension: Option<String>,
    /// Deployment-specific blob extension payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xml_blob_extension: Option<String>,
}

impl ResultReport {
    /// Placeholder report for a non-terminal experiment.
    pub fn not_ready(status_code: StatusCode) -> Self {
        Self {
            status_code,
            error_message: None,
            experiment_results: None,
            warning_messages: Vec::new(),
            xml_result_extension: None,
            xml_blob_extension: None,
        }
    }
}

/// `GetLabStatus` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename = "labStatus", rename_all = "camelCase")]
pub struct LabStatus {
    /// False when the lab server is administratively down.
    pub online: bool,
    /// Operator-facing status message.
    pub lab_status_message: String,
}

/// One configured range in the lab-configuration document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfiguredRange {
    /// Parameter family this range constrains (e.g. "field").
    #[serde(rename = "@name")]
    pub name: String,
    /// Inclusive lower bound.
    #[serde(rename = "@minimum")]
    pub minimum: i32,
    /// Inclusive upper bound.
    #[serde(rename = "@maximum")]
    pub maximum: i32,
    /// Step sub-range lower bound, for swept parameters.
    #[serde(rename = "@stepMinimum", skip_serializing_if = "Option::is_none")]
    pub step_minimum: Option<i32>,
    /// Step sub-range upper bound, for swept parameters.
    #[serde(rename = "@stepMaximum", skip_serializing_if = "Option::is_none")]
    pub step_maximum: Option<i32>,
}

/// `GetLabConfiguration` response: static rig description per deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename = "labConfiguration", rename_all = "camelCase")]
pub struct LabConfiguration {
    /// Deployment title.
    #[serde(rename = "@title")]
    pub title: String,
    /// Configuration document version.
    #[serde(rename = "@version")]
    pub version: String,
    /// Setup ids the rig accepts.
    #[serde(rename = "setupId")]
    pub setup_ids: Vec<String>,
    /// Configured validation ranges.
    #[serde(rename = "range")]
    pub ranges: Vec<ConfiguredRange>,
}
