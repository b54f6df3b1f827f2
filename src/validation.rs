//! Range-checking rules for experiment specifications.
//!
//! Each rig family owns a fixed set of [`ValidationRange`]s loaded once from
//! configuration. Checks run in a fixed order and fail on the *first*
//! violation; the engine reports exactly one message per rejection, with the
//! offending parameter and bound substituted in. Downstream tiers rely on the
//! message text verbatim, so the formats here are frozen.
//!
//! For a swept parameter `(minimum, maximum, step)` the order is:
//!
//! 1. sweep minimum >= range minimum
//! 2. sweep minimum <= range maximum
//! 3. sweep maximum within the same bounds (labelled "Maximum")
//! 4. sweep maximum strictly greater than sweep minimum
//! 5. step within the nested step sub-range
//!
//! Single-value parameters (distance, duration, repeat, total time) use only
//! the two bound checks.

use crate::error::{AppResult, LabError};
use crate::proto::specification::setup_ids;
use crate::proto::{ExperimentSpecification, SpecVariant, SweepRange, ValidationReport};
use serde::{Deserialize, Serialize};

/// Nested step-size bounds inside a [`ValidationRange`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRange {
    /// Smallest permitted step.
    pub minimum: i32,
    /// Largest permitted step.
    pub maximum: i32,
}

/// Inclusive `[minimum, maximum]` bounds plus an optional step sub-range.
///
/// Loaded once from rig configuration; read-only thereafter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRange {
    /// Inclusive lower bound.
    pub minimum: i32,
    /// Inclusive upper bound.
    pub maximum: i32,
    /// Step bounds, present for swept parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepRange>,
}

impl ValidationRange {
    /// Range without a step sub-range (single-value parameters).
    pub fn bounds(minimum: i32, maximum: i32) -> Self {
        Self { minimum, maximum, step: None }
    }

    /// Range with a nested step sub-range (swept parameters).
    pub fn with_step(minimum: i32, maximum: i32, step_minimum: i32, step_maximum: i32) -> Self {
        Self {
            minimum,
            maximum,
            step: Some(StepRange { minimum: step_minimum, maximum: step_maximum }),
        }
    }

    /// Check a single value against the bounds. `label` is the full parameter
    /// name substituted into the message (e.g. `"Field Minimum"`).
    fn check_value(&self, label: &str, value: i32) -> AppResult<()> {
        if value < self.minimum {
            return Err(LabError::Validation(format!(
                "{}: Less than minimum ({})!",
                label, self.minimum
            )));
        }
        if value > self.maximum {
            return Err(LabError::Validation(format!(
                "{}: Greater than maximum ({})!",
                label, self.maximum
            )));
        }
        Ok(())
    }

    /// Check a swept parameter in the fixed five-step order. `family` is the
    /// parameter family name (e.g. `"Field"`).
    fn check_sweep(&self, family: &str, sweep: &SweepRange) -> AppResult<()> {
        self.check_value(&format!("{family} Minimum"), sweep.minimum)?;
        self.check_value(&format!("{family} Maximum"), sweep.maximum)?;
        if sweep.maximum <= sweep.minimum {
            return Err(LabError::Validation(
                "Maximum must be greater than minimum!".to_string(),
            ));
        }
        if let Some(step) = &self.step {
            if sweep.step < step.minimum {
                return Err(LabError::Validation(format!(
                    "{} Step: Less than minimum ({})!",
                    family, step.minimum
                )));
            }
            if sweep.step > step.maximum {
                return Err(LabError::Validation(format!(
                    "{} Step: Greater than maximum ({})!",
                    family, step.maximum
                )));
            }
        }
        Ok(())
    }
}

/// Seconds of rig settling charged per sweep point.
const MACHINE_SECONDS_PER_POINT: f64 = 2.0;
/// Fixed machine-rig overhead (initialise, spin-up, spin-down).
const MACHINE_OVERHEAD_SECONDS: f64 = 30.0;
/// Seconds charged per absorber move on the counting rig.
const COUNTER_MOVE_SECONDS: f64 = 5.0;
/// Runtime above which the report carries a warning.
const LONG_RUNTIME_SECONDS: f64 = 600.0;

/// Configured bounds for the rotating-machine rig.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MachineRanges {
    /// Field-current bounds and step sub-range.
    pub field: ValidationRange,
    /// Load bounds and step sub-range.
    pub load: ValidationRange,
    /// Speed bounds and step sub-range.
    pub speed: ValidationRange,
}

/// Configured bounds for the radioactivity-counting rig.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RadioactivityRanges {
    /// Absorber distance bounds.
    pub distance: ValidationRange,
    /// Counting-duration bounds, seconds.
    pub duration: ValidationRange,
    /// Repeat-count bounds.
    pub repeat: ValidationRange,
    /// Bounds on the computed total experiment time, seconds.
    pub total_time: ValidationRange,
}

/// Per-rig validation rules producing accept/reject decisions.
#[derive(Clone, Copy, Debug)]
pub enum ValidationEngine {
    /// Rules for AC/DC rotating-machine rigs.
    Machine(MachineRanges),
    /// Rules for the radioactivity-counting rig.
    Radioactivity(RadioactivityRanges),
}

impl ValidationEngine {
    /// Check a specification and produce a report.
    ///
    /// Stops at the first violated rule; the report carries exactly that
    /// message. Rejection is a normal outcome, not an error.
    pub fn validate(&self, spec: &ExperimentSpecification) -> ValidationReport {
        match self.check(spec) {
            Ok(runtime) => {
                let mut report = ValidationReport::accept(runtime);
                if runtime > LONG_RUNTIME_SECONDS {
                    report.warning_messages.push(format!(
                        "Estimated runtime is {runtime:.0} seconds; consider a coarser sweep."
                    ));
                }
                report
            }
            Err(LabError::Validation(message)) => ValidationReport::reject(message),
            Err(other) => ValidationReport::reject(other.to_string()),
        }
    }

    /// Setup ids this engine's rig accepts.
    pub fn setup_ids(&self) -> Vec<String> {
        let ids: &[&str] = match self {
            ValidationEngine::Machine(_) => &[
                setup_ids::VOLTAGE_VS_FIELD,
                setup_ids::VOLTAGE_VS_LOAD,
                setup_ids::VOLTAGE_VS_SPEED,
            ],
            ValidationEngine::Radioactivity(_) => &[
                setup_ids::RADIOACTIVITY_VS_DISTANCE,
                setup_ids::RADIOACTIVITY_VS_TIME,
            ],
        };
        ids.iter().map(|s| (*s).to_string()).collect()
    }

    /// Configured ranges, for the lab-configuration document.
    pub fn named_ranges(&self) -> Vec<(&'static str, ValidationRange)> {
        match self {
            ValidationEngine::Machine(r) => vec![
                ("field", r.field),
                ("load", r.load),
                ("speed", r.speed),
            ],
            ValidationEngine::Radioactivity(r) => vec![
                ("distance", r.distance),
                ("duration", r.duration),
                ("repeat", r.repeat),
                ("totalTime", r.total_time),
            ],
        }
    }

    fn check(&self, spec: &ExperimentSpecification) -> AppResult<f64> {
        match (self, &spec.variant) {
            (ValidationEngine::Machine(ranges), SpecVariant::FieldSweep { field, load, speed }) => {
                ranges.field.check_sweep("Field", field)?;
                ranges.load.check_value("Load", *load)?;
                ranges.speed.check_value("Speed", *speed)?;
                Ok(machine_runtime(field))
            }
            (ValidationEngine::Machine(ranges), SpecVariant::LoadSweep { load, field, speed }) => {
                ranges.load.check_sweep("Load", load)?;
                ranges.field.check_value("Field", *field)?;
                ranges.speed.check_value("Speed", *speed)?;
                Ok(machine_runtime(load))
            }
            (ValidationEngine::Machine(ranges), SpecVariant::SpeedSweep { speed, field, load }) => {
                ranges.speed.check_sweep("Speed", speed)?;
                ranges.field.check_value("Field", *field)?;
                ranges.load.check_value("Load", *load)?;
                Ok(machine_runtime(speed))
            }
            (
                ValidationEngine::Radioactivity(ranges),
                SpecVariant::DistanceSweep { distances, duration, repeat },
            ) => {
                if distances.is_empty() {
                    return Err(LabError::Validation(
                        "No absorber distances specified!".to_string(),
                    ));
                }
                for distance in distances {
                    ranges.distance.check_value("Distance", *distance)?;
                }
                ranges.duration.check_value("Duration", *duration)?;
                ranges.repeat.check_value("Repeat", *repeat)?;
                let runtime = counter_runtime(distances.len(), *duration, *repeat);
                ranges.total_time.check_value("Total Time", runtime as i32)?;
                Ok(runtime)
            }
            (
                ValidationEngine::Radioactivity(ranges),
                SpecVariant::TimeSeries { distance, duration, repeat },
            ) => {
                ranges.distance.check_value("Distance", *distance)?;
                ranges.duration.check_value("Duration", *duration)?;
                ranges.repeat.check_value("Repeat", *repeat)?;
                let runtime = counter_runtime(1, *duration, *repeat);
                ranges.total_time.check_value("Total Time", runtime as i32)?;
                Ok(runtime)
            }
            (_, SpecVariant::Unrecognized) => Err(LabError::Validation(format!(
                "Unknown setupId: {}!",
                spec.setup_id
            ))),
            _ => Err(LabError::Validation(format!(
                "Setup {} is not available on this rig!",
                spec.setup_id
            ))),
        }
    }
}

fn machine_runtime(sweep: &SweepRange) -> f64 {
    f64::from(sweep.point_count()) * MACHINE_SECONDS_PER_POINT + MACHINE_OVERHEAD_SECONDS
}

fn counter_runtime(points: usize, duration: i32, repeat: i32) -> f64 {
    let points = points as f64;
    points * f64::from(duration.max(0)) * f64::from(repeat.max(1)) + points * COUNTER_MOVE_SECONDS
}
