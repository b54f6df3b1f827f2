//! Custom error types for the application.
//!
//! This module defines the primary error type, `LabError`, for the entire
//! system. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures the three tiers
//! can produce.
//!
//! ## Error Hierarchy
//!
//! `LabError` consolidates four failure families:
//!
//! - **`Config` / `Configuration`**: loading errors from figment, and semantic
//!   errors in values that parsed fine but are logically wrong (blank GUID,
//!   empty passkey). Both abort startup; neither is recoverable at call time.
//! - **`Validation`**: a range check rejected an input parameter. Carries the
//!   exact human-readable message identifying the offending field and bound.
//!   Callers fix their input; these are never retried automatically.
//! - **`ServiceUnreachable`**: any transport or protocol failure talking to a
//!   downstream tier. The underlying cause is logged at the tier boundary and
//!   deliberately not carried across it, so callers never need to understand a
//!   downstream tier's internal fault representation.
//! - **`Auth` / `Storage` / `Wire`**: credential rejection, experiment-store
//!   failures, and XML codec failures respectively.
//!
//! Domain rejections (validation report with `accepted = false`, a cancel that
//! finds nothing to cancel, a busy device) are *not* errors: they are normal
//! response values, because rejection is an expected outcome.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, LabError>;

/// Unified error type for broker, lab-server, and equipment tiers.
#[derive(Error, Debug)]
pub enum LabError {
    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// An input parameter violated a validation range.
    #[error("{0}")]
    Validation(String),

    /// Credential check failed (coupon or lab-server passkey).
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A downstream tier could not be reached. The original cause is logged
    /// internally at the boundary where it occurred and is not propagated.
    #[error("Service unreachable")]
    ServiceUnreachable,

    /// The experiment store rejected or failed an operation.
    #[error("Experiment store error: {0}")]
    Storage(String),

    /// An XML wire document could not be encoded or decoded.
    #[error("Wire format error: {0}")]
    Wire(String),

    /// The referenced experiment id is not known to this authority.
    #[error("Unknown experiment id: {0}")]
    UnknownExperiment(i32),

    /// The equipment handle was used after `close()`.
    #[error("Equipment has been disposed")]
    Disposed,

    /// Device-tier fault (register access, rig driver failure).
    #[error("Equipment error: {0}")]
    Equipment(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<quick_xml::DeError> for LabError {
    fn from(e: quick_xml::DeError) -> Self {
        LabError::Wire(e.to_string())
    }
}

impl From<quick_xml::SeError> for LabError {
    fn from(e: quick_xml::SeError) -> Self {
        LabError::Wire(e.to_string())
    }
}
