//! Experiment-specification documents and setup-id dispatch.
//!
//! A specification travels as an `<experimentSpecification>` XML document
//! whose `setupId` element selects the typed variant the remaining fields
//! decode into. Parsing is two-pass: the shared envelope is decoded first to
//! read the discriminator, then the full payload is decoded again as the
//! matching variant document. An unrecognized `setupId` degrades gracefully
//! to the envelope-only [`SpecVariant::Unrecognized`] variant; callers that
//! need strict rejection check [`ExperimentSpecification::is_recognized`].
//!
//! Round-trip invariant: `serialize(parse(x))` is semantically equal to `x`
//! for every recognized setup id, with distances normalized to ascending
//! order (duplicates preserved).

use crate::error::AppResult;
use crate::proto::{from_xml, to_xml};
use serde::{Deserialize, Serialize};

/// Recognized setup-id discriminators.
pub mod setup_ids {
    /// Rotating-machine rig: sweep field current, fixed load and speed.
    pub const VOLTAGE_VS_FIELD: &str = "VoltageVsField";
    /// Rotating-machine rig: sweep load, fixed field and speed.
    pub const VOLTAGE_VS_LOAD: &str = "VoltageVsLoad";
    /// Rotating-machine rig: sweep speed, fixed field and load.
    pub const VOLTAGE_VS_SPEED: &str = "VoltageVsSpeed";
    /// Radioactivity rig: counts at each absorber distance.
    pub const RADIOACTIVITY_VS_DISTANCE: &str = "RadioactivityVsDistance";
    /// Radioactivity rig: repeated counts at one distance.
    pub const RADIOACTIVITY_VS_TIME: &str = "RadioactivityVsTime";

    /// All recognized setup ids, in dispatch order.
    pub const ALL: [&str; 5] = [
        VOLTAGE_VS_FIELD,
        VOLTAGE_VS_LOAD,
        VOLTAGE_VS_SPEED,
        RADIOACTIVITY_VS_DISTANCE,
        RADIOACTIVITY_VS_TIME,
    ];
}

/// A swept parameter: inclusive `[minimum, maximum]` walked in `step`
/// increments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepRange {
    /// Sweep start (inclusive).
    pub minimum: i32,
    /// Sweep end (inclusive).
    pub maximum: i32,
    /// Increment per point.
    pub step: i32,
}

impl SweepRange {
    /// Number of points the sweep visits, including both endpoints.
    pub fn point_count(&self) -> u32 {
        if self.step <= 0 || self.maximum < self.minimum {
            return 0;
        }
        ((self.maximum - self.minimum) / self.step) as u32 + 1
    }
}

/// Typed specification variants, keyed by setup id.
#[derive(Clone, Debug, PartialEq)]
pub enum SpecVariant {
    /// `VoltageVsField`
    FieldSweep {
        /// Field-current sweep.
        field: SweepRange,
        /// Fixed load setting.
        load: i32,
        /// Fixed speed setting.
        speed: i32,
    },
    /// `VoltageVsLoad`
    LoadSweep {
        /// Load sweep.
        load: SweepRange,
        /// Fixed field-current setting.
        field: i32,
        /// Fixed speed setting.
        speed: i32,
    },
    /// `VoltageVsSpeed`
    SpeedSweep {
        /// Speed sweep.
        speed: SweepRange,
        /// Fixed field-current setting.
        field: i32,
        /// Fixed load setting.
        load: i32,
    },
    /// `RadioactivityVsDistance`
    DistanceSweep {
        /// Absorber distances in mm, ascending (duplicates preserved).
        distances: Vec<i32>,
        /// Counting duration per point, seconds.
        duration: i32,
        /// Repeats per point.
        repeat: i32,
    },
    /// `RadioactivityVsTime`
    TimeSeries {
        /// Absorber distance in mm.
        distance: i32,
        /// Counting duration per point, seconds.
        duration: i32,
        /// Repeats.
        repeat: i32,
    },
    /// Unknown setup id: envelope decoded, rig fields left at defaults.
    Unrecognized,
}

/// A parsed experiment specification: shared envelope plus typed variant.
///
/// Immutable after validation; created from client input at submission.
#[derive(Clone, Debug, PartialEq)]
pub struct ExperimentSpecification {
    /// Discriminator string, kept verbatim (also for unrecognized ids).
    pub setup_id: String,
    /// Operator-facing setup name, if the document carried one.
    pub setup_name: String,
    /// Typed rig-specific payload.
    pub variant: SpecVariant,
}

/// Rig-agnostic superset view over every variant, used by downstream
/// validation and status code.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpecSummary {
    /// Field sweep, when this specification sweeps field current.
    pub field_sweep: Option<SweepRange>,
    /// Load sweep, when this specification sweeps load.
    pub load_sweep: Option<SweepRange>,
    /// Speed sweep, when this specification sweeps speed.
    pub speed_sweep: Option<SweepRange>,
    /// Absorber distances, for radioactivity specifications.
    pub distances: Vec<i32>,
    /// Counting duration in seconds, for radioactivity specifications.
    pub duration: Option<i32>,
    /// Repeat count, for radioactivity specifications.
    pub repeat: Option<i32>,
}

impl SpecSummary {
    /// Number of acquisition points this specification requests.
    pub fn point_count(&self) -> u32 {
        if let Some(sweep) = self
            .field_sweep
            .as_ref()
            .or(self.load_sweep.as_ref())
            .or(self.speed_sweep.as_ref())
        {
            return sweep.point_count();
        }
        let repeats = self.repeat.unwrap_or(1).max(1) as u32;
        if self.distances.is_empty() {
            repeats
        } else {
            self.distances.len() as u32 * repeats
        }
    }
}

// ---------------------------------------------------------------------------
// Wire documents
// ---------------------------------------------------------------------------

/// Shared envelope: the fields common to every specification document.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "experimentSpecification", rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    setup_id: String,
    #[serde(default)]
    setup_name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "experimentSpecification", rename_all = "camelCase")]
struct FieldSweepDoc {
    setup_id: String,
    #[serde(default)]
    setup_name: String,
    #[serde(default)]
    field_min: i32,
    #[serde(default)]
    field_max: i32,
    #[serde(default)]
    field_step: i32,
    #[serde(default)]
    load: i32,
    #[serde(default)]
    speed: i32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "experimentSpecification", rename_all = "camelCase")]
struct LoadSweepDoc {
    setup_id: String,
    #[serde(default)]
    setup_name: String,
    #[serde(default)]
    load_min: i32,
    #[serde(default)]
    load_max: i32,
    #[serde(default)]
    load_step: i32,
    #[serde(default)]
    field: i32,
    #[serde(default)]
    speed: i32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "experimentSpecification", rename_all = "camelCase")]
struct SpeedSweepDoc {
    setup_id: String,
    #[serde(default)]
    setup_name: String,
    #[serde(default)]
    speed_min: i32,
    #[serde(default)]
    speed_max: i32,
    #[serde(default)]
    speed_step: i32,
    #[serde(default)]
    field: i32,
    #[serde(default)]
    load: i32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "experimentSpecification", rename_all = "camelCase")]
struct DistanceSweepDoc {
    setup_id: String,
    #[serde(default)]
    setup_name: String,
    #[serde(default, rename = "distance")]
    distances: Vec<i32>,
    #[serde(default)]
    duration: i32,
    #[serde(default)]
    repeat: i32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "experimentSpecification", rename_all = "camelCase")]
struct TimeSeriesDoc {
    setup_id: String,
    #[serde(default)]
    setup_name: String,
    #[serde(default)]
    distance: i32,
    #[serde(default)]
    duration: i32,
    #[serde(default)]
    repeat: i32,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

impl ExperimentSpecification {
    /// Parse a specification document.
    ///
    /// Decodes the envelope to read `setupId`, then decodes the full payload
    /// as the matching variant document. Unknown setup ids keep the envelope
    /// and degrade to [`SpecVariant::Unrecognized`] rather than failing.
    pub fn parse(document: &str) -> AppResult<Self> {
        let envelope: Envelope = from_xml(document)?;
        let variant = match envelope.setup_id.as_str() {
            setup_ids::VOLTAGE_VS_FIELD => {
                let doc: FieldSweepDoc = from_xml(document)?;
                SpecVariant::FieldSweep {
                    field: SweepRange {
                        minimum: doc.field_min,
                        maximum: doc.field_max,
                        step: doc.field_step,
                    },
                    load: doc.load,
                    speed: doc.speed,
                }
            }
            setup_ids::VOLTAGE_VS_LOAD => {
                let doc: LoadSweepDoc = from_xml(document)?;
                SpecVariant::LoadSweep {
                    load: SweepRange {
                        minimum: doc.load_min,
                        maximum: doc.load_max,
                        step: doc.load_step,
                    },
                    field: doc.field,
                    speed: doc.speed,
                }
            }
            setup_ids::VOLTAGE_VS_SPEED => {
                let doc: SpeedSweepDoc = from_xml(document)?;
                SpecVariant::SpeedSweep {
                    speed: SweepRange {
                        minimum: doc.speed_min,
                        maximum: doc.speed_max,
                        step: doc.speed_step,
                    },
                    field: doc.field,
                    load: doc.load,
                }
            }
            setup_ids::RADIOACTIVITY_VS_DISTANCE => {
                let doc: DistanceSweepDoc = from_xml(document)?;
                let mut distances = doc.distances;
                // Normalize: ascending order, duplicates preserved.
                distances.sort_unstable();
                SpecVariant::DistanceSweep {
                    distances,
                    duration: doc.duration,
                    repeat: doc.repeat,
                }
            }
            setup_ids::RADIOACTIVITY_VS_TIME => {
                let doc: TimeSeriesDoc = from_xml(document)?;
                SpecVariant::TimeSeries {
                    distance: doc.distance,
                    duration: doc.duration,
                    repeat: doc.repeat,
                }
            }
            _ => SpecVariant::Unrecognized,
        };
        Ok(Self {
            setup_id: envelope.setup_id,
            setup_name: envelope.setup_name,
            variant,
        })
    }

    /// Encode this specification back into its wire document.
    pub fn serialize(&self) -> AppResult<String> {
        match &self.variant {
            SpecVariant::FieldSweep { field, load, speed } => to_xml(&FieldSweepDoc {
                setup_id: self.setup_id.clone(),
                setup_name: self.setup_name.clone(),
                field_min: field.minimum,
                field_max: field.maximum,
                field_step: field.step,
                load: *load,
                speed: *speed,
            }),
            SpecVariant::LoadSweep { load, field, speed } => to_xml(&LoadSweepDoc {
                setup_id: self.setup_id.clone(),
                setup_name: self.setup_name.clone(),
                load_min: load.minimum,
                load_max: load.maximum,
                load_step: load.step,
                field: *field,
                speed: *speed,
            }),
            SpecVariant::SpeedSweep { speed, field, load } => to_xml(&SpeedSweepDoc {
                setup_id: self.setup_id.clone(),
                setup_name: self.setup_name.clone(),
                speed_min: speed.minimum,
                speed_max: speed.maximum,
                speed_step: speed.step,
                field: *field,
                load: *load,
            }),
            SpecVariant::DistanceSweep {
                distances,
                duration,
                repeat,
            } => to_xml(&DistanceSweepDoc {
                setup_id: self.setup_id.clone(),
                setup_name: self.setup_name.clone(),
                distances: distances.clone(),
                duration: *duration,
                repeat: *repeat,
            }),
            SpecVariant::TimeSeries {
                distance,
                duration,
                repeat,
            } => to_xml(&TimeSeriesDoc {
                setup_id: self.setup_id.clone(),
                setup_name: self.setup_name.clone(),
                distance: *distance,
                duration: *duration,
                repeat: *repeat,
            }),
            SpecVariant::Unrecognized => to_xml(&Envelope {
                setup_id: self.setup_id.clone(),
                setup_name: self.setup_name.clone(),
            }),
        }
    }

    /// True when the setup id matched a known variant.
    pub fn is_recognized(&self) -> bool {
        !matches!(self.variant, SpecVariant::Unrecognized)
    }

    /// Rig-agnostic superset view for validation and runtime estimation.
    pub fn summary(&self) -> SpecSummary {
        let mut summary = SpecSummary::default();
        match &self.variant {
            SpecVariant::FieldSweep { field, .. } => summary.field_sweep = Some(*field),
            SpecVariant::LoadSweep { load, .. } => summary.load_sweep = Some(*load),
            SpecVariant::SpeedSweep { speed, .. } => summary.speed_sweep = Some(*speed),
            SpecVariant::DistanceSweep {
                distances,
                duration,
                repeat,
            } => {
                summary.distances = distances.clone();
                summary.duration = Some(*duration);
                summary.repeat = Some(*repeat);
            }
            SpecVariant::TimeSeries {
                distance,
                duration,
                repeat,
            } => {
                summary.distances = vec![*distance];
                summary.duration = Some(*duration);
                summary.repeat = Some(*repeat);
            }
            SpecVariant::Unrecognized => {}
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_sweep_doc() -> String {
        "<experimentSpecification>\
         <setupId>VoltageVsField</setupId>\
         <setupName>Open circuit characteristic</setupName>\
         <fieldMin>0</fieldMin><fieldMax>100</fieldMax><fieldStep>5</fieldStep>\
         <load>10</load><speed>1500</speed>\
         </experimentSpecification>"
            .to_string()
    }

    #[test]
    fn test_parse_field_sweep() {
        let spec = ExperimentSpecification::parse(&field_sweep_doc()).unwrap();
        assert_eq!(spec.setup_id, setup_ids::VOLTAGE_VS_FIELD);
        assert_eq!(
            spec.variant,
            SpecVariant::FieldSweep {
                field: SweepRange { minimum: 0, maximum: 100, step: 5 },
                load: 10,
                speed: 1500,
            }
        );
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        for doc in [
            field_sweep_doc(),
            "<experimentSpecification><setupId>RadioactivityVsDistance</setupId>\
             <distance>20</distance><distance>40</distance><distance>20</distance>\
             <duration>10</duration><repeat>3</repeat></experimentSpecification>"
                .to_string(),
        ] {
            let spec = ExperimentSpecification::parse(&doc).unwrap();
            let wire = spec.serialize().unwrap();
            let reparsed = ExperimentSpecification::parse(&wire).unwrap();
            assert_eq!(spec, reparsed);
        }
    }

    #[test]
    fn test_distances_sorted_duplicates_preserved() {
        let doc = "<experimentSpecification><setupId>RadioactivityVsDistance</setupId>\
                   <distance>40</distance><distance>20</distance><distance>40</distance>\
                   <duration>10</duration><repeat>1</repeat></experimentSpecification>";
        let spec = ExperimentSpecification::parse(doc).unwrap();
        match spec.variant {
            SpecVariant::DistanceSweep { distances, .. } => {
                assert_eq!(distances, vec![20, 40, 40]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_setup_id_degrades_gracefully() {
        let doc = "<experimentSpecification><setupId>HydraulicsRig</setupId>\
                   <setupName>unknown</setupName><headMin>1</headMin>\
                   </experimentSpecification>";
        let spec = ExperimentSpecification::parse(doc).unwrap();
        assert!(!spec.is_recognized());
        assert_eq!(spec.setup_id, "HydraulicsRig");
        assert_eq!(spec.variant, SpecVariant::Unrecognized);
    }

    #[test]
    fn test_sweep_point_count() {
        let sweep = SweepRange { minimum: 0, maximum: 100, step: 5 };
        assert_eq!(sweep.point_count(), 21);
        let degenerate = SweepRange { minimum: 0, maximum: 100, step: 0 };
        assert_eq!(degenerate.point_count(), 0);
    }

    #[test]
    fn test_summary_point_count() {
        let spec = ExperimentSpecification::parse(&field_sweep_doc()).unwrap();
        assert_eq!(spec.summary().point_count(), 21);
    }
}
