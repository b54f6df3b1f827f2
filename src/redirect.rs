//! Maintenance stand-in for a lab server that is down or relocated.
//!
//! Deployments swap this in at the broker's routing table while the real
//! service is migrated. Every call answers immediately with an offline
//! placeholder carrying the announcement text, so clients see a clean
//! "offline" rather than timeouts.

use crate::auth::AuthCredential;
use crate::broker::LabClient;
use crate::error::AppResult;
use crate::proto::{
    ExperimentStatus, LabExperimentStatus, LabStatus, ResultReport, StatusCode, SubmissionReport,
    ValidationReport, WaitEstimate,
};
use async_trait::async_trait;
use tracing::debug;

/// [`LabClient`] that answers everything with offline placeholders.
pub struct RedirectShim {
    announcement: String,
}

impl RedirectShim {
    /// `announcement` is shown to clients as the lab status message, e.g.
    /// "Lab moved to https://lab.example.edu".
    pub fn new(announcement: impl Into<String>) -> Self {
        Self {
            announcement: announcement.into(),
        }
    }

    fn rejection(&self) -> ValidationReport {
        ValidationReport::reject(self.announcement.clone())
    }
}

#[async_trait]
impl LabClient for RedirectShim {
    async fn lab_status(&self, _credential: &AuthCredential) -> AppResult<LabStatus> {
        Ok(LabStatus {
            online: false,
            lab_status_message: self.announcement.clone(),
        })
    }

    async fn lab_configuration(
        &self,
        _credential: &AuthCredential,
        user_group: &str,
    ) -> AppResult<String> {
        debug!(user_group, "configuration requested from redirect shim");
        Ok(String::new())
    }

    async fn lab_info(&self, _credential: &AuthCredential) -> AppResult<String> {
        Ok(self.announcement.clone())
    }

    async fn validate(
        &self,
        _credential: &AuthCredential,
        _spec_xml: &str,
        _user_group: &str,
    ) -> AppResult<ValidationReport> {
        Ok(self.rejection())
    }

    async fn effective_queue_length(
        &self,
        _credential: &AuthCredential,
        _user_group: &str,
        _priority_hint: i32,
    ) -> AppResult<WaitEstimate> {
        Ok(WaitEstimate::empty())
    }

    async fn submit(
        &self,
        _credential: &AuthCredential,
        _spec_xml: &str,
        _user_group: &str,
        _priority_hint: i32,
    ) -> AppResult<SubmissionReport> {
        Ok(SubmissionReport {
            experiment_id: -1,
            min_time_to_live: 0.0,
            validation_report: self.rejection(),
            wait_estimate: WaitEstimate::empty(),
        })
    }

    async fn experiment_status(
        &self,
        _credential: &AuthCredential,
        _experiment_id: i32,
    ) -> AppResult<LabExperimentStatus> {
        Ok(LabExperimentStatus {
            min_time_to_live: 0.0,
            status: ExperimentStatus::unknown(),
        })
    }

    async fn retrieve_result(
        &self,
        _credential: &AuthCredential,
        _experiment_id: i32,
    ) -> AppResult<ResultReport> {
        Ok(ResultReport::not_ready(StatusCode::Unknown))
    }

    async fn cancel(&self, _credential: &AuthCredential, _experiment_id: i32) -> AppResult<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shim_reports_offline_with_announcement() {
        let shim = RedirectShim::new("Lab moved to https://lab.example.edu");
        let credential = AuthCredential::new("broker-1", "pk");

        let status = shim.lab_status(&credential).await.unwrap();
        assert!(!status.online);
        assert!(status.lab_status_message.contains("lab.example.edu"));

        let report = shim
            .submit(&credential, "<x/>", "students", 0)
            .await
            .unwrap();
        assert_eq!(report.experiment_id, -1);
        assert!(!report.validation_report.accepted);

        assert!(!shim.cancel(&credential, 5).await.unwrap());
        let status = shim.experiment_status(&credential, 5).await.unwrap();
        assert_eq!(status.status.status_code, StatusCode::Unknown);
    }
}
