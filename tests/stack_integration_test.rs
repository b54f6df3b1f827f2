//! End-to-end tests over the full broker / lab-server / equipment stack,
//! assembled in-process the way the daemon assembles it.

use remlab::auth::{AuthCredential, Coupon};
use remlab::authority::{LabServerAuthority, MemoryStore, RuntimeSumEstimator};
use remlab::broker::{
    BrokerGateway, CompletionNotifier, ConfigCouponRegistry, InProcessLabClient, LabClient,
    LogNotifier,
};
use remlab::config::{
    BrokerSettings, CouponEntry, EquipmentSettings, LabServerEntry, LabServerSettings,
};
use remlab::equipment::{EquipmentEngine, MachineRig};
use remlab::error::LabError;
use remlab::proto::StatusCode;
use remlab::redirect::RedirectShim;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const LAB_GUID: &str = "machine-lab-1";

fn field_sweep_xml() -> String {
    "<experimentSpecification><setupId>VoltageVsField</setupId>\
     <fieldMin>0</fieldMin><fieldMax>100</fieldMax><fieldStep>10</fieldStep>\
     <load>10</load><speed>1000</speed></experimentSpecification>"
        .to_string()
}

fn build_authority(required_passkey: Option<&str>) -> Arc<LabServerAuthority> {
    let mut settings = LabServerSettings::default();
    settings.required_passkey = required_passkey.map(str::to_string);
    let equipment = Arc::new(EquipmentEngine::new(
        Arc::new(MachineRig::new(Duration::from_millis(1))),
        settings.rig.validation_engine(),
        EquipmentSettings {
            initialise_enabled: true,
            settle_delay: Duration::ZERO,
        },
    ));
    Arc::new(
        LabServerAuthority::new(
            settings,
            Arc::new(MemoryStore::new()),
            equipment,
            Arc::new(RuntimeSumEstimator),
        )
        .with_poll_interval(Duration::from_millis(10)),
    )
}

fn broker_settings(outgoing_passkey: &str) -> BrokerSettings {
    BrokerSettings {
        guid: "broker-1".to_string(),
        authentication_enabled: true,
        call_logging: false,
        coupons: vec![CouponEntry {
            coupon_id: 7,
            passkey: "ticket".to_string(),
        }],
        lab_servers: vec![LabServerEntry {
            guid: LAB_GUID.to_string(),
            url: format!("inproc://{LAB_GUID}"),
            outgoing_passkey: outgoing_passkey.to_string(),
            incoming_passkey: "callback".to_string(),
        }],
        lab_server_list: Vec::new(),
    }
}

fn build_stack(
    authority: Arc<LabServerAuthority>,
    outgoing_passkey: &str,
) -> BrokerGateway {
    let settings = broker_settings(outgoing_passkey);
    let coupons = Arc::new(ConfigCouponRegistry::new(&settings.coupons));
    let mut clients: HashMap<String, Arc<dyn LabClient>> = HashMap::new();
    clients.insert(
        LAB_GUID.to_string(),
        Arc::new(InProcessLabClient::new(authority)),
    );
    BrokerGateway::new(settings, coupons, clients, Arc::new(LogNotifier)).unwrap()
}

async fn wait_terminal(gateway: &BrokerGateway, coupon: &Coupon, id: i32) -> StatusCode {
    for _ in 0..300 {
        let status = gateway.experiment_status(coupon, id).await.unwrap();
        if status.status.status_code.is_terminal() {
            return status.status.status_code;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    StatusCode::Unknown
}

#[tokio::test]
async fn test_submit_through_broker_runs_to_completion() {
    let authority = build_authority(Some("shared-secret"));
    let gateway = build_stack(authority, "shared-secret");
    let coupon = Coupon::new(7, "ticket");

    let report = gateway
        .submit(&coupon, LAB_GUID, &field_sweep_xml(), "students", 0, None)
        .await
        .unwrap();
    assert!(report.validation_report.accepted);
    assert!(report.experiment_id > 0);

    let status = wait_terminal(&gateway, &coupon, report.experiment_id).await;
    assert_eq!(status, StatusCode::Completed);

    let result = gateway
        .retrieve_result(&coupon, report.experiment_id)
        .await
        .unwrap();
    assert_eq!(result.status_code, StatusCode::Completed);
    let document = result.experiment_results.unwrap();
    assert!(document.contains("experimentResult"));
}

#[tokio::test]
async fn test_wrong_downstream_passkey_is_shielded() {
    // Broker presents the wrong passkey; the lab server rejects it, but the
    // client must only see the opaque unreachable error.
    let authority = build_authority(Some("shared-secret"));
    let gateway = build_stack(authority, "wrong-secret");
    let coupon = Coupon::new(7, "ticket");

    let err = gateway
        .lab_status(&coupon, LAB_GUID)
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::ServiceUnreachable));
    assert_eq!(err.to_string(), "Service unreachable");
}

#[tokio::test]
async fn test_rejected_specification_reports_first_violation() {
    let authority = build_authority(None);
    let gateway = build_stack(authority, "anything");
    let coupon = Coupon::new(7, "ticket");

    let bad = "<experimentSpecification><setupId>VoltageVsField</setupId>\
               <fieldMin>-5</fieldMin><fieldMax>300</fieldMax><fieldStep>20</fieldStep>\
               <load>10</load><speed>1000</speed></experimentSpecification>";
    let report = gateway
        .submit(&coupon, LAB_GUID, bad, "students", 0, None)
        .await
        .unwrap();
    assert!(!report.validation_report.accepted);
    assert_eq!(report.experiment_id, -1);
    // First check in order wins: minimum below range, nothing else reported.
    assert_eq!(
        report.validation_report.error_message.as_deref(),
        Some("Field Minimum: Less than minimum (0)!")
    );
}

#[tokio::test]
async fn test_cancel_through_broker() {
    let authority = build_authority(None);
    let gateway = build_stack(authority, "pk");
    let coupon = Coupon::new(7, "ticket");

    let report = gateway
        .submit(&coupon, LAB_GUID, &field_sweep_xml(), "students", 0, None)
        .await
        .unwrap();
    let id = report.experiment_id;

    let cancelled = gateway.cancel(&coupon, id).await.unwrap();
    let status = wait_terminal(&gateway, &coupon, id).await;
    if cancelled {
        assert_eq!(status, StatusCode::Cancelled);
    } else {
        // Raced completion; terminal either way.
        assert!(status.is_terminal());
    }
    // Cancel after terminal is a no-op.
    assert!(!gateway.cancel(&coupon, id).await.unwrap());
}

#[tokio::test]
async fn test_redirect_shim_routes_as_offline_lab() {
    let settings = broker_settings("pk");
    let coupons = Arc::new(ConfigCouponRegistry::new(&settings.coupons));
    let mut clients: HashMap<String, Arc<dyn LabClient>> = HashMap::new();
    clients.insert(
        LAB_GUID.to_string(),
        Arc::new(RedirectShim::new("Lab relocated to https://new.example.edu")),
    );
    let gateway =
        BrokerGateway::new(settings, coupons, clients, Arc::new(LogNotifier)).unwrap();
    let coupon = Coupon::new(7, "ticket");

    let status = gateway.lab_status(&coupon, LAB_GUID).await.unwrap();
    assert!(!status.online);
    assert!(status.lab_status_message.contains("new.example.edu"));

    let report = gateway
        .submit(&coupon, LAB_GUID, &field_sweep_xml(), "students", 0, None)
        .await
        .unwrap();
    assert_eq!(report.experiment_id, -1);
    assert!(!report.validation_report.accepted);
}

#[tokio::test]
async fn test_queue_outlook_grows_with_outstanding_work() {
    let authority = build_authority(None);
    let gateway = build_stack(Arc::clone(&authority), "pk");
    let coupon = Coupon::new(7, "ticket");

    let empty = gateway
        .effective_queue_length(&coupon, LAB_GUID, "students", 0)
        .await
        .unwrap();
    assert_eq!(empty.effective_queue_length, 0);

    let first = gateway
        .submit(&coupon, LAB_GUID, &field_sweep_xml(), "students", 0, None)
        .await
        .unwrap();
    let outlook = gateway
        .effective_queue_length(&coupon, LAB_GUID, "students", 0)
        .await
        .unwrap();
    // The first experiment may already be terminal on a fast rig, so the
    // outlook is either empty again or counts it.
    assert!(outlook.effective_queue_length <= 1);
    let _ = wait_terminal(&gateway, &coupon, first.experiment_id).await;
}

struct RecordingNotifier {
    delivered: tokio::sync::Mutex<Vec<(String, i32, StatusCode)>>,
}

#[async_trait::async_trait]
impl CompletionNotifier for RecordingNotifier {
    async fn notify(&self, address: &str, experiment_id: i32, status: StatusCode) {
        self.delivered
            .lock()
            .await
            .push((address.to_string(), experiment_id, status));
    }
}

#[tokio::test]
async fn test_completion_callback_reaches_notifier() {
    let authority = build_authority(None);
    let settings = broker_settings("pk");
    let coupons = Arc::new(ConfigCouponRegistry::new(&settings.coupons));
    let mut clients: HashMap<String, Arc<dyn LabClient>> = HashMap::new();
    clients.insert(
        LAB_GUID.to_string(),
        Arc::new(InProcessLabClient::new(authority)),
    );
    let notifier = Arc::new(RecordingNotifier {
        delivered: tokio::sync::Mutex::new(Vec::new()),
    });
    let gateway = BrokerGateway::new(
        settings,
        coupons,
        clients,
        Arc::clone(&notifier) as Arc<dyn CompletionNotifier>,
    )
    .unwrap();
    let coupon = Coupon::new(7, "ticket");

    let report = gateway
        .submit(
            &coupon,
            LAB_GUID,
            &field_sweep_xml(),
            "students",
            0,
            Some("student@example.edu".to_string()),
        )
        .await
        .unwrap();
    let id = report.experiment_id;
    let status = wait_terminal(&gateway, &coupon, id).await;

    // The lab server calls back with its configured incoming passkey.
    gateway
        .notify(&AuthCredential::new(LAB_GUID, "callback"), id, status)
        .await
        .unwrap();
    let delivered = notifier.delivered.lock().await;
    assert_eq!(
        delivered.as_slice(),
        &[("student@example.edu".to_string(), id, status)]
    );

    // A wrong callback passkey is rejected.
    drop(delivered);
    let err = gateway
        .notify(&AuthCredential::new(LAB_GUID, "wrong"), id, status)
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::Auth(_)));
}

#[tokio::test]
async fn test_terminal_result_collection_releases_broker_entry() {
    let authority = build_authority(None);
    let gateway = build_stack(authority, "pk");
    let coupon = Coupon::new(7, "ticket");

    let report = gateway
        .submit(&coupon, LAB_GUID, &field_sweep_xml(), "students", 0, None)
        .await
        .unwrap();
    let id = report.experiment_id;
    assert_eq!(wait_terminal(&gateway, &coupon, id).await, StatusCode::Completed);

    let result = gateway.retrieve_result(&coupon, id).await.unwrap();
    assert_eq!(result.status_code, StatusCode::Completed);

    // The broker forgot the id once the terminal result was collected; the
    // map does not grow one entry per experiment forever.
    let err = gateway.experiment_status(&coupon, id).await.unwrap_err();
    assert!(matches!(err, LabError::UnknownExperiment(_)));
    let err = gateway.retrieve_result(&coupon, id).await.unwrap_err();
    assert!(matches!(err, LabError::UnknownExperiment(_)));
    assert!(!gateway.cancel(&coupon, id).await.unwrap());
}

#[tokio::test]
async fn test_lab_configuration_through_broker() {
    let authority = build_authority(None);
    let gateway = build_stack(authority, "pk");
    let coupon = Coupon::new(7, "ticket");

    let xml = gateway
        .lab_configuration(&coupon, LAB_GUID, "students")
        .await
        .unwrap();
    assert!(xml.contains("labConfiguration"));
    assert!(xml.contains("VoltageVsField"));
    assert!(xml.contains("speed"));
}
