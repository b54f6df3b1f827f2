//! Configuration loading for broker, lab-server, and equipment tiers.
//!
//! Strongly-typed configuration loaded with figment from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `REMLAB_`
//!
//! Loading is followed by a semantic validation pass that fails fast: a blank
//! lab-server GUID, URL, or passkey aborts startup with a precise message
//! rather than degrading at call time.
//!
//! The broker's lab-server table may be given either as structured entries or
//! as the legacy CSV-style list (`guid,url,outgoing_passkey,incoming_passkey`
//! per line), which some deployments still generate.

use crate::error::{AppResult, LabError};
use crate::validation::{MachineRanges, RadioactivityRanges, ValidationEngine, ValidationRange};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application-level settings.
///
/// Every field carries a serde default so a partial section (a single
/// `REMLAB_` environment override, say) still deserializes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Deployment name, used in log output and the configuration document.
    #[serde(default = "default_application_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_application_name(),
            log_level: default_log_level(),
        }
    }
}

/// One coupon (client credential) the broker accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponEntry {
    /// Coupon identifier presented by the client.
    pub coupon_id: i64,
    /// Coupon passkey presented by the client.
    pub passkey: String,
}

/// One lab server the broker can route to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabServerEntry {
    /// Lab-server GUID, the routing key.
    pub guid: String,
    /// Service address of the lab server.
    pub url: String,
    /// Passkey the broker presents to the lab server.
    pub outgoing_passkey: String,
    /// Passkey the lab server presents back on callbacks.
    pub incoming_passkey: String,
}

impl LabServerEntry {
    /// Parse one CSV-style line: `guid,url,outgoing_passkey,incoming_passkey`.
    pub fn from_csv(line: &str) -> AppResult<Self> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(LabError::Configuration(format!(
                "lab server entry must have 4 comma-separated fields, got {}: {line:?}",
                fields.len()
            )));
        }
        Ok(Self {
            guid: fields[0].to_string(),
            url: fields[1].to_string(),
            outgoing_passkey: fields[2].to_string(),
            incoming_passkey: fields[3].to_string(),
        })
    }

    fn validate(&self) -> AppResult<()> {
        if self.guid.trim().is_empty() {
            return Err(LabError::Configuration(
                "lab server guid cannot be blank".to_string(),
            ));
        }
        if self.url.trim().is_empty() {
            return Err(LabError::Configuration(format!(
                "lab server {}: url cannot be blank",
                self.guid
            )));
        }
        if self.outgoing_passkey.trim().is_empty() || self.incoming_passkey.trim().is_empty() {
            return Err(LabError::Configuration(format!(
                "lab server {}: passkeys cannot be blank",
                self.guid
            )));
        }
        Ok(())
    }
}

/// Broker-tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// This broker's GUID, presented downstream as the caller identifier.
    #[serde(default = "default_broker_guid")]
    pub guid: String,
    /// When false, calls are routed without credential checks.
    #[serde(default = "default_true")]
    pub authentication_enabled: bool,
    /// When true, every inbound call is logged with its coupon id.
    #[serde(default)]
    pub call_logging: bool,
    /// Coupons the broker accepts.
    #[serde(default)]
    pub coupons: Vec<CouponEntry>,
    /// Structured lab-server table.
    #[serde(default)]
    pub lab_servers: Vec<LabServerEntry>,
    /// Legacy CSV-style lab-server list, merged after `lab_servers`.
    #[serde(default)]
    pub lab_server_list: Vec<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            guid: default_broker_guid(),
            authentication_enabled: true,
            call_logging: false,
            coupons: Vec::new(),
            lab_servers: Vec::new(),
            lab_server_list: Vec::new(),
        }
    }
}

impl BrokerSettings {
    /// The full routing table: structured entries plus parsed CSV lines.
    pub fn routing_table(&self) -> AppResult<Vec<LabServerEntry>> {
        let mut table = self.lab_servers.clone();
        for line in &self.lab_server_list {
            table.push(LabServerEntry::from_csv(line)?);
        }
        Ok(table)
    }
}

/// Which physical rig a lab server owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RigSettings {
    /// AC/DC rotating-machine rig with field/load/speed ranges.
    Machine(MachineRanges),
    /// Radioactivity-counting rig with distance/duration/repeat/total-time ranges.
    Radioactivity(RadioactivityRanges),
}

impl RigSettings {
    /// Build the validation engine for this rig.
    pub fn validation_engine(&self) -> ValidationEngine {
        match self {
            RigSettings::Machine(ranges) => ValidationEngine::Machine(*ranges),
            RigSettings::Radioactivity(ranges) => ValidationEngine::Radioactivity(*ranges),
        }
    }
}

/// Lab-server-tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabServerSettings {
    /// This lab server's GUID.
    #[serde(default = "default_lab_server_guid")]
    pub guid: String,
    /// Operator-facing deployment title.
    #[serde(default = "default_lab_title")]
    pub title: String,
    /// Administrative online flag. Threaded through constructors, never a
    /// process-wide static.
    #[serde(default = "default_true")]
    pub online: bool,
    /// Status message returned by `GetLabStatus`.
    #[serde(default = "default_status_message")]
    pub status_message: String,
    /// Guaranteed retention of experiment records, in days.
    #[serde(default = "default_min_time_to_live_days")]
    pub min_time_to_live_days: f64,
    /// Passkey callers must present; `None` disables the check.
    #[serde(default)]
    pub required_passkey: Option<String>,
    /// Owned rig and its validation ranges.
    #[serde(default = "default_rig")]
    pub rig: RigSettings,
}

impl Default for LabServerSettings {
    fn default() -> Self {
        Self {
            guid: default_lab_server_guid(),
            title: default_lab_title(),
            online: true,
            status_message: default_status_message(),
            min_time_to_live_days: default_min_time_to_live_days(),
            required_passkey: None,
            rig: default_rig(),
        }
    }
}

/// Equipment-tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquipmentSettings {
    /// Gate for `initialise`; a disabled device stays `Idle`.
    #[serde(default = "default_true")]
    pub initialise_enabled: bool,
    /// Artificial settle delay applied during initialise, rounded up to whole
    /// seconds. Interruptible only by process shutdown.
    #[serde(with = "humantime_serde", default)]
    pub settle_delay: Duration,
}

impl Default for EquipmentSettings {
    fn default() -> Self {
        Self {
            initialise_enabled: true,
            settle_delay: Duration::from_secs(0),
        }
    }
}

fn default_application_name() -> String {
    "remlab".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_broker_guid() -> String {
    "broker-1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_lab_server_guid() -> String {
    "machine-lab-1".to_string()
}

fn default_lab_title() -> String {
    "Rotating Machine Laboratory".to_string()
}

fn default_status_message() -> String {
    "Lab server online".to_string()
}

fn default_min_time_to_live_days() -> f64 {
    14.0
}

fn default_rig() -> RigSettings {
    RigSettings::Machine(MachineRanges {
        field: ValidationRange::with_step(0, 200, 1, 10),
        load: ValidationRange::with_step(0, 100, 1, 10),
        speed: ValidationRange::with_step(0, 3000, 10, 500),
    })
}

/// Top-level settings for every tier hosted by this process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application-level settings.
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Broker-tier settings.
    #[serde(default)]
    pub broker: BrokerSettings,
    /// Lab-server-tier settings.
    #[serde(default)]
    pub lab_server: LabServerSettings,
    /// Equipment-tier settings.
    #[serde(default)]
    pub equipment: EquipmentSettings,
}

impl Settings {
    /// Load settings from an optional TOML file plus `REMLAB_` environment
    /// overrides, then validate. Missing required fields or blank
    /// guid/url/passkey entries abort startup.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment
            .merge(Env::prefixed("REMLAB_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation: fail fast on configuration the tiers cannot run
    /// with.
    pub fn validate(&self) -> AppResult<()> {
        if self.broker.guid.trim().is_empty() {
            return Err(LabError::Configuration(
                "broker.guid cannot be blank".to_string(),
            ));
        }
        if self.lab_server.guid.trim().is_empty() {
            return Err(LabError::Configuration(
                "lab_server.guid cannot be blank".to_string(),
            ));
        }
        if self.lab_server.min_time_to_live_days < 0.0 {
            return Err(LabError::Configuration(
                "lab_server.min_time_to_live_days cannot be negative".to_string(),
            ));
        }
        for entry in self.broker.routing_table()? {
            entry.validate()?;
        }
        Ok(())
    }
}
