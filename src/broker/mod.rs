//! Broker tier: coupon-authenticated multiplexing front door.
//!
//! `BrokerGateway` redeems client coupons, translates them to per-lab-server
//! passkey credentials, routes calls by lab-server GUID, and tracks which lab
//! server owns each experiment id so status, result, and cancel calls need no
//! GUID from the client. Downstream transport faults surface as the opaque
//! [`LabError::ServiceUnreachable`]; the cause is traced, never forwarded.

pub mod coupons;

pub use coupons::{ConfigCouponRegistry, CouponRegistry};

use crate::auth::{AuthCredential, Coupon};
use crate::authority::{CompletionEvent, LabServerAuthority};
use crate::config::BrokerSettings;
use crate::error::{AppResult, LabError};
use crate::proto::{
    LabExperimentStatus, LabStatus, ResultReport, StatusCode, SubmissionReport, ValidationReport,
    WaitEstimate,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// Downstream lab-server surface as the broker sees it.
///
/// Implemented in-process here; a wire transport would implement the same
/// trait over its client stub.
#[async_trait]
pub trait LabClient: Send + Sync {
    async fn lab_status(&self, credential: &AuthCredential) -> AppResult<LabStatus>;
    async fn lab_configuration(
        &self,
        credential: &AuthCredential,
        user_group: &str,
    ) -> AppResult<String>;
    async fn lab_info(&self, credential: &AuthCredential) -> AppResult<String>;
    async fn validate(
        &self,
        credential: &AuthCredential,
        spec_xml: &str,
        user_group: &str,
    ) -> AppResult<ValidationReport>;
    async fn effective_queue_length(
        &self,
        credential: &AuthCredential,
        user_group: &str,
        priority_hint: i32,
    ) -> AppResult<WaitEstimate>;
    async fn submit(
        &self,
        credential: &AuthCredential,
        spec_xml: &str,
        user_group: &str,
        priority_hint: i32,
    ) -> AppResult<SubmissionReport>;
    async fn experiment_status(
        &self,
        credential: &AuthCredential,
        experiment_id: i32,
    ) -> AppResult<LabExperimentStatus>;
    async fn retrieve_result(
        &self,
        credential: &AuthCredential,
        experiment_id: i32,
    ) -> AppResult<ResultReport>;
    async fn cancel(&self, credential: &AuthCredential, experiment_id: i32) -> AppResult<bool>;
}

/// [`LabClient`] over an authority living in the same process.
pub struct InProcessLabClient {
    authority: Arc<LabServerAuthority>,
}

impl InProcessLabClient {
    pub fn new(authority: Arc<LabServerAuthority>) -> Self {
        Self { authority }
    }
}

#[async_trait]
impl LabClient for InProcessLabClient {
    async fn lab_status(&self, credential: &AuthCredential) -> AppResult<LabStatus> {
        self.authority.authenticate(credential)?;
        Ok(self.authority.lab_status().await)
    }

    async fn lab_configuration(
        &self,
        credential: &AuthCredential,
        user_group: &str,
    ) -> AppResult<String> {
        self.authority.authenticate(credential)?;
        self.authority.lab_configuration(user_group).await
    }

    async fn lab_info(&self, credential: &AuthCredential) -> AppResult<String> {
        self.authority.authenticate(credential)?;
        Ok(self.authority.lab_info().await)
    }

    async fn validate(
        &self,
        credential: &AuthCredential,
        spec_xml: &str,
        user_group: &str,
    ) -> AppResult<ValidationReport> {
        self.authority.authenticate(credential)?;
        self.authority.validate(spec_xml, user_group).await
    }

    async fn effective_queue_length(
        &self,
        credential: &AuthCredential,
        user_group: &str,
        priority_hint: i32,
    ) -> AppResult<WaitEstimate> {
        self.authority.authenticate(credential)?;
        self.authority
            .effective_queue_length(user_group, priority_hint)
            .await
    }

    async fn submit(
        &self,
        credential: &AuthCredential,
        spec_xml: &str,
        user_group: &str,
        priority_hint: i32,
    ) -> AppResult<SubmissionReport> {
        self.authority.authenticate(credential)?;
        self.authority
            .submit(None, spec_xml, user_group, priority_hint)
            .await
    }

    async fn experiment_status(
        &self,
        credential: &AuthCredential,
        experiment_id: i32,
    ) -> AppResult<LabExperimentStatus> {
        self.authority.authenticate(credential)?;
        self.authority.experiment_status(experiment_id).await
    }

    async fn retrieve_result(
        &self,
        credential: &AuthCredential,
        experiment_id: i32,
    ) -> AppResult<ResultReport> {
        self.authority.authenticate(credential)?;
        self.authority.retrieve_result(experiment_id).await
    }

    async fn cancel(&self, credential: &AuthCredential, experiment_id: i32) -> AppResult<bool> {
        self.authority.authenticate(credential)?;
        self.authority.cancel(experiment_id).await
    }
}

/// Callback channel for experiment completion.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, address: &str, experiment_id: i32, status: StatusCode);
}

/// Notifier that records completions in the log. Stands in for mail or
/// webhook delivery in deployments without either.
pub struct LogNotifier;

#[async_trait]
impl CompletionNotifier for LogNotifier {
    async fn notify(&self, address: &str, experiment_id: i32, status: StatusCode) {
        info!(address, experiment_id, status = ?status, "experiment completion notification");
    }
}

/// A routed lab server: its client plus the credential the broker presents.
struct Route {
    client: Arc<dyn LabClient>,
    credential: AuthCredential,
}

/// What the broker remembers about an accepted submission.
#[derive(Clone)]
struct SubmissionEntry {
    lab_server_guid: String,
    notify_address: Option<String>,
}

/// Coupon-authenticated front door over a set of lab servers.
pub struct BrokerGateway {
    settings: BrokerSettings,
    coupons: Arc<dyn CouponRegistry>,
    routes: HashMap<String, Route>,
    submissions: Arc<Mutex<HashMap<i32, SubmissionEntry>>>,
    notifier: Arc<dyn CompletionNotifier>,
}

impl BrokerGateway {
    /// Build the gateway. Fails fast when a configured lab server has no
    /// registered client, so routing gaps surface at startup rather than on
    /// the first experiment.
    pub fn new(
        settings: BrokerSettings,
        coupons: Arc<dyn CouponRegistry>,
        clients: HashMap<String, Arc<dyn LabClient>>,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> AppResult<Self> {
        let mut routes = HashMap::new();
        for entry in settings.routing_table()? {
            let Some(client) = clients.get(&entry.guid) else {
                return Err(LabError::Configuration(format!(
                    "no client registered for lab server {}",
                    entry.guid
                )));
            };
            routes.insert(
                entry.guid.clone(),
                Route {
                    client: Arc::clone(client),
                    credential: AuthCredential::new(&settings.guid, &entry.outgoing_passkey),
                },
            );
        }
        Ok(Self {
            settings,
            coupons,
            routes,
            submissions: Arc::new(Mutex::new(HashMap::new())),
            notifier,
        })
    }

    /// Forward completion events from an in-process authority to the
    /// notifier, for submissions that asked to be notified.
    pub fn watch_completions(&self, mut events: broadcast::Receiver<CompletionEvent>) {
        let submissions = Arc::clone(&self.submissions);
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let entry = submissions.lock().await.get(&event.experiment_id).cloned();
                        if let Some(SubmissionEntry {
                            notify_address: Some(address),
                            ..
                        }) = entry
                        {
                            notifier
                                .notify(&address, event.experiment_id, event.status)
                                .await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "completion watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn admit(&self, coupon: &Coupon, operation: &str) -> AppResult<()> {
        if self.settings.call_logging {
            info!(coupon_id = coupon.coupon_id, operation, "broker call");
        }
        if !self.settings.authentication_enabled {
            return Ok(());
        }
        if self.coupons.redeem(coupon).await {
            Ok(())
        } else {
            Err(LabError::Auth(format!(
                "coupon {} rejected",
                coupon.coupon_id
            )))
        }
    }

    fn route(&self, lab_server_guid: &str) -> AppResult<&Route> {
        self.routes.get(lab_server_guid).ok_or_else(|| {
            LabError::Configuration(format!("unknown lab server {lab_server_guid}"))
        })
    }

    /// Lab-server GUID that owns an experiment id, if the broker issued it.
    async fn owner_of(&self, experiment_id: i32) -> AppResult<String> {
        self.submissions
            .lock()
            .await
            .get(&experiment_id)
            .map(|e| e.lab_server_guid.clone())
            .ok_or(LabError::UnknownExperiment(experiment_id))
    }

    /// `GetLabStatus` toward one lab server.
    pub async fn lab_status(&self, coupon: &Coupon, lab_server_guid: &str) -> AppResult<LabStatus> {
        self.admit(coupon, "lab_status").await?;
        let route = self.route(lab_server_guid)?;
        shield(route.client.lab_status(&route.credential).await)
    }

    /// `GetLabConfiguration` toward one lab server.
    pub async fn lab_configuration(
        &self,
        coupon: &Coupon,
        lab_server_guid: &str,
        user_group: &str,
    ) -> AppResult<String> {
        self.admit(coupon, "lab_configuration").await?;
        let route = self.route(lab_server_guid)?;
        shield(
            route
                .client
                .lab_configuration(&route.credential, user_group)
                .await,
        )
    }

    /// `GetLabInfo` toward one lab server.
    pub async fn lab_info(&self, coupon: &Coupon, lab_server_guid: &str) -> AppResult<String> {
        self.admit(coupon, "lab_info").await?;
        let route = self.route(lab_server_guid)?;
        shield(route.client.lab_info(&route.credential).await)
    }

    /// `Validate` toward one lab server.
    pub async fn validate(
        &self,
        coupon: &Coupon,
        lab_server_guid: &str,
        spec_xml: &str,
        user_group: &str,
    ) -> AppResult<ValidationReport> {
        self.admit(coupon, "validate").await?;
        let route = self.route(lab_server_guid)?;
        shield(
            route
                .client
                .validate(&route.credential, spec_xml, user_group)
                .await,
        )
    }

    /// `GetEffectiveQueueLength` toward one lab server.
    pub async fn effective_queue_length(
        &self,
        coupon: &Coupon,
        lab_server_guid: &str,
        user_group: &str,
        priority_hint: i32,
    ) -> AppResult<WaitEstimate> {
        self.admit(coupon, "effective_queue_length").await?;
        let route = self.route(lab_server_guid)?;
        shield(
            route
                .client
                .effective_queue_length(&route.credential, user_group, priority_hint)
                .await,
        )
    }

    /// `Submit`: route the specification and remember who owns the id.
    ///
    /// Submissions are not deduplicated: a retry after a transport failure is
    /// a new submission and may be assigned a fresh experiment id.
    pub async fn submit(
        &self,
        coupon: &Coupon,
        lab_server_guid: &str,
        spec_xml: &str,
        user_group: &str,
        priority_hint: i32,
        notify_address: Option<String>,
    ) -> AppResult<SubmissionReport> {
        self.admit(coupon, "submit").await?;
        let route = self.route(lab_server_guid)?;
        let report = shield(
            route
                .client
                .submit(&route.credential, spec_xml, user_group, priority_hint)
                .await,
        )?;
        if report.validation_report.accepted {
            self.submissions.lock().await.insert(
                report.experiment_id,
                SubmissionEntry {
                    lab_server_guid: lab_server_guid.to_string(),
                    notify_address,
                },
            );
            debug!(
                experiment_id = report.experiment_id,
                lab_server_guid, "submission routed"
            );
        }
        Ok(report)
    }

    /// `GetExperimentStatus` by experiment id alone.
    pub async fn experiment_status(
        &self,
        coupon: &Coupon,
        experiment_id: i32,
    ) -> AppResult<LabExperimentStatus> {
        self.admit(coupon, "experiment_status").await?;
        let guid = self.owner_of(experiment_id).await?;
        let route = self.route(&guid)?;
        shield(
            route
                .client
                .experiment_status(&route.credential, experiment_id)
                .await,
        )
    }

    /// `RetrieveResult` by experiment id alone.
    ///
    /// Collecting a terminal result releases the broker's ownership entry for
    /// the id; the record itself stays with the lab server for its retention
    /// window. Later broker calls for the id see it as unknown.
    pub async fn retrieve_result(
        &self,
        coupon: &Coupon,
        experiment_id: i32,
    ) -> AppResult<ResultReport> {
        self.admit(coupon, "retrieve_result").await?;
        let guid = self.owner_of(experiment_id).await?;
        let route = self.route(&guid)?;
        let report = shield(
            route
                .client
                .retrieve_result(&route.credential, experiment_id)
                .await,
        )?;
        if report.status_code.is_terminal() {
            self.submissions.lock().await.remove(&experiment_id);
            debug!(experiment_id, "submission entry released");
        }
        Ok(report)
    }

    /// `Notify`: inbound completion callback from a lab server, fire and
    /// forget. The caller authenticates with the incoming passkey configured
    /// for its routing entry.
    pub async fn notify(
        &self,
        credential: &AuthCredential,
        experiment_id: i32,
        status: StatusCode,
    ) -> AppResult<()> {
        let entry = {
            let submissions = self.submissions.lock().await;
            match submissions.get(&experiment_id) {
                Some(entry) => entry.clone(),
                // Fire-and-forget: an unknown id is dropped, not an error.
                None => return Ok(()),
            }
        };
        if self.settings.authentication_enabled {
            let expected = self
                .settings
                .routing_table()?
                .into_iter()
                .find(|e| e.guid == entry.lab_server_guid)
                .map(|e| e.incoming_passkey);
            if expected.as_deref() != Some(credential.passkey.as_str()) {
                return Err(LabError::Auth(format!(
                    "invalid callback passkey from {}",
                    credential.identifier
                )));
            }
        }
        if let Some(address) = entry.notify_address {
            self.notifier.notify(&address, experiment_id, status).await;
        }
        Ok(())
    }

    /// `Cancel` by experiment id alone. Unknown ids are a no-op, not an
    /// error, matching the idempotency contract.
    pub async fn cancel(&self, coupon: &Coupon, experiment_id: i32) -> AppResult<bool> {
        self.admit(coupon, "cancel").await?;
        let guid = match self.owner_of(experiment_id).await {
            Ok(guid) => guid,
            Err(LabError::UnknownExperiment(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let route = self.route(&guid)?;
        shield(route.client.cancel(&route.credential, experiment_id).await)
    }
}

/// Map downstream faults to the opaque unreachable error. Domain outcomes
/// (validation data, unknown ids, malformed documents) pass through; anything
/// else is traced here and hidden from the caller.
fn shield<T>(result: AppResult<T>) -> AppResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(
            e @ (LabError::Validation(_) | LabError::Wire(_) | LabError::UnknownExperiment(_)),
        ) => Err(e),
        Err(e) => {
            error!(error = %e, "downstream lab server call failed");
            Err(LabError::ServiceUnreachable)
        }
    }
}
