//! Wire-format layer: XML documents exchanged between the three tiers.
//!
//! Every message travels as an XML document with a root element per message
//! type. Specification documents begin with a `setupId` discriminator that
//! selects the typed variant (see [`specification`]); reports and status
//! documents have fixed schemas (see [`messages`]).
//!
//! Status code numeric values are a deployment contract shared with
//! unmigrated peers and must be preserved bit-for-bit.

pub mod messages;
pub mod specification;

pub use messages::{
    ConfiguredRange, ExperimentStatus, LabConfiguration, LabExperimentStatus, LabStatus,
    ResultReport, StatusCode, SubmissionReport, ValidationReport, WaitEstimate,
};
pub use specification::{ExperimentSpecification, SpecSummary, SpecVariant, SweepRange};

use crate::error::{AppResult, LabError};
use serde::{de::DeserializeOwned, Serialize};

/// Encode a message as an XML document string.
pub fn to_xml<T: Serialize>(value: &T) -> AppResult<String> {
    quick_xml::se::to_string(value).map_err(LabError::from)
}

/// Decode a message from an XML document string.
pub fn from_xml<T: DeserializeOwned>(document: &str) -> AppResult<T> {
    quick_xml::de::from_str(document).map_err(LabError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_round_trip() {
        let report = ValidationReport::accept(120.0);
        let xml = to_xml(&report).unwrap();
        assert!(xml.starts_with("<validationReport>"));
        let back: ValidationReport = from_xml(&xml).unwrap();
        assert!(back.accepted);
        assert_eq!(back.estimated_runtime, 120.0);
    }
}
