//! Rig drivers: the acquisition seam beneath the equipment state machine.
//!
//! A [`RigDriver`] performs one acquisition for a validated specification and
//! produces the result document. Cancellation is cooperative: drivers watch
//! the cancel channel between points and stop at the next checkpoint.
//!
//! The two drivers here are simulators generating synthetic but plausible
//! data; the real acquisition electronics sit behind the same trait.

use crate::proto::specification::{SpecVariant, SweepRange};
use crate::proto::{to_xml, ExperimentSpecification};
use crate::registers::RegisterTable;
use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Outcome of one driver acquisition.
#[derive(Clone, Debug)]
pub enum AcquireOutcome {
    /// Acquisition ran to completion.
    Completed {
        /// Result document (XML).
        results: String,
        /// Non-fatal remarks captured during the run.
        warnings: Vec<String>,
    },
    /// The cancel channel fired before completion.
    Cancelled,
}

/// One physical rig's acquisition interface.
#[async_trait]
pub trait RigDriver: Send + Sync + 'static {
    /// Short rig identifier for logging.
    fn rig_name(&self) -> &str;

    /// Run one acquisition for an already-validated specification.
    ///
    /// Implementations must poll `cancel` between points and return
    /// [`AcquireOutcome::Cancelled`] promptly once it fires.
    async fn acquire(
        &self,
        spec: &ExperimentSpecification,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<AcquireOutcome>;
}

/// Sleep one point interval, watching for cancellation. Returns true when
/// cancelled.
async fn pace(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    if *cancel.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = cancel.changed() => true,
    }
}

// ---------------------------------------------------------------------------
// Rotating-machine rig
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MachinePoint {
    #[serde(rename = "@x")]
    x: i32,
    #[serde(rename = "@voltage")]
    voltage: f64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "experimentResult", rename_all = "camelCase")]
struct MachineResultDoc {
    setup_id: String,
    #[serde(rename = "point")]
    points: Vec<MachinePoint>,
}

/// Holding-register layout of the machine drive controller.
pub mod drive_registers {
    /// Field-current setpoint.
    pub const FIELD: usize = 0;
    /// Load setpoint.
    pub const LOAD: usize = 1;
    /// Speed setpoint.
    pub const SPEED: usize = 2;
    /// Latest terminal-voltage reading, decivolts.
    pub const VOLTAGE_DECIVOLTS: usize = 3;
    /// Table size.
    pub const TABLE_SIZE: usize = 4;
}

fn to_register(value: i32) -> u16 {
    value.clamp(0, i32::from(u16::MAX)) as u16
}

/// Simulated AC/DC rotating-machine rig.
///
/// Produces a voltage curve over the swept parameter: saturating in field,
/// drooping under load, linear in speed. Values carry small measurement
/// noise. The drive controller speaks holding registers; the rig mirrors its
/// setpoints and latest reading into a [`RegisterTable`] the same way the
/// real drive does, so register observers work against either.
pub struct MachineRig {
    point_delay: Duration,
    registers: Arc<RegisterTable>,
}

impl MachineRig {
    /// Rig with the given settle time per sweep point.
    pub fn new(point_delay: Duration) -> Self {
        Self {
            point_delay,
            registers: Arc::new(RegisterTable::new(drive_registers::TABLE_SIZE)),
        }
    }

    /// The drive's holding-register mirror, for monitoring tools.
    pub fn registers(&self) -> Arc<RegisterTable> {
        Arc::clone(&self.registers)
    }
}

impl Default for MachineRig {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

fn noise(scale: f64) -> f64 {
    rand::thread_rng().gen_range(-scale..scale)
}

fn sweep_points(sweep: &SweepRange) -> Vec<i32> {
    let mut points = Vec::new();
    if sweep.step <= 0 {
        return points;
    }
    let mut x = sweep.minimum;
    while x <= sweep.maximum {
        points.push(x);
        x += sweep.step;
    }
    points
}

#[async_trait]
impl RigDriver for MachineRig {
    fn rig_name(&self) -> &str {
        "machine-rig"
    }

    async fn acquire(
        &self,
        spec: &ExperimentSpecification,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<AcquireOutcome> {
        type Curve = fn(i32) -> f64;
        let (sweep, swept_register, fixed, curve): (SweepRange, usize, [(usize, i32); 2], Curve) =
            match &spec.variant {
                // Open-circuit characteristic: saturating magnetization curve.
                SpecVariant::FieldSweep { field, load, speed } => (
                    *field,
                    drive_registers::FIELD,
                    [(drive_registers::LOAD, *load), (drive_registers::SPEED, *speed)],
                    |x| 240.0 * (1.0 - (-f64::from(x) / 80.0).exp()),
                ),
                // Load characteristic: terminal voltage droop.
                SpecVariant::LoadSweep { load, field, speed } => (
                    *load,
                    drive_registers::LOAD,
                    [(drive_registers::FIELD, *field), (drive_registers::SPEED, *speed)],
                    |x| 240.0 - 0.8 * f64::from(x),
                ),
                // Speed characteristic: EMF proportional to speed.
                SpecVariant::SpeedSweep { speed, field, load } => (
                    *speed,
                    drive_registers::SPEED,
                    [(drive_registers::FIELD, *field), (drive_registers::LOAD, *load)],
                    |x| 0.16 * f64::from(x),
                ),
                other => bail!("setup {other:?} not supported by machine rig"),
            };

        for (register, value) in fixed {
            self.registers.write(register, &[to_register(value)])?;
        }

        let mut points = Vec::new();
        for x in sweep_points(&sweep) {
            self.registers.write(swept_register, &[to_register(x)])?;
            if pace(self.point_delay, cancel).await {
                debug!(rig = self.rig_name(), "acquisition cancelled at x={x}");
                return Ok(AcquireOutcome::Cancelled);
            }
            let voltage = curve(x) + noise(0.5);
            self.registers.write(
                drive_registers::VOLTAGE_DECIVOLTS,
                &[to_register((voltage * 10.0) as i32)],
            )?;
            points.push(MachinePoint { x, voltage });
        }

        let results = to_xml(&MachineResultDoc {
            setup_id: spec.setup_id.clone(),
            points,
        })?;
        Ok(AcquireOutcome::Completed {
            results,
            warnings: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Radioactivity-counting rig
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountPoint {
    #[serde(rename = "@distance")]
    distance: i32,
    #[serde(rename = "@counts")]
    counts: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "experimentResult", rename_all = "camelCase")]
struct CounterResultDoc {
    setup_id: String,
    duration: i32,
    #[serde(rename = "count")]
    counts: Vec<CountPoint>,
}

/// Simulated radioactivity-counting rig: a Geiger tube behind a movable
/// absorber carriage.
pub struct RadioactivityRig {
    move_delay: Duration,
    count_delay_per_second: Duration,
}

impl RadioactivityRig {
    /// Rig with the given carriage-move time and per-counting-second pace.
    pub fn new(move_delay: Duration, count_delay_per_second: Duration) -> Self {
        Self {
            move_delay,
            count_delay_per_second,
        }
    }
}

impl Default for RadioactivityRig {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(1))
    }
}

fn simulated_counts(distance: i32, duration: i32) -> u32 {
    // Inverse-square falloff from a nominal source rate, Poisson-ish jitter.
    let d = f64::from(distance.max(1));
    let mean = 40_000.0 / (d * d) * f64::from(duration.max(1));
    let jitter = noise(mean.sqrt().max(1.0));
    (mean + jitter).max(0.0) as u32
}

#[async_trait]
impl RigDriver for RadioactivityRig {
    fn rig_name(&self) -> &str {
        "radioactivity-rig"
    }

    async fn acquire(
        &self,
        spec: &ExperimentSpecification,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<AcquireOutcome> {
        let (distances, duration, repeat) = match &spec.variant {
            SpecVariant::DistanceSweep {
                distances,
                duration,
                repeat,
            } => (distances.clone(), *duration, *repeat),
            SpecVariant::TimeSeries {
                distance,
                duration,
                repeat,
            } => (vec![*distance], *duration, *repeat),
            other => bail!("setup {other:?} not supported by radioactivity rig"),
        };

        let count_delay = self
            .count_delay_per_second
            .mul_f64(f64::from(duration.max(0)));
        let mut counts = Vec::new();
        for distance in distances {
            if pace(self.move_delay, cancel).await {
                debug!(rig = self.rig_name(), "acquisition cancelled moving to {distance}");
                return Ok(AcquireOutcome::Cancelled);
            }
            for _ in 0..repeat.max(1) {
                if pace(count_delay, cancel).await {
                    return Ok(AcquireOutcome::Cancelled);
                }
                counts.push(CountPoint {
                    distance,
                    counts: simulated_counts(distance, duration),
                });
            }
        }

        let results = to_xml(&CounterResultDoc {
            setup_id: spec.setup_id.clone(),
            duration,
            counts,
        })?;
        Ok(AcquireOutcome::Completed {
            results,
            warnings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::specification::setup_ids;

    fn field_spec() -> ExperimentSpecification {
        ExperimentSpecification {
            setup_id: setup_ids::VOLTAGE_VS_FIELD.to_string(),
            setup_name: String::new(),
            variant: SpecVariant::FieldSweep {
                field: SweepRange { minimum: 0, maximum: 20, step: 10 },
                load: 0,
                speed: 0,
            },
        }
    }

    #[tokio::test]
    async fn test_machine_rig_produces_one_point_per_step() {
        let rig = MachineRig::new(Duration::from_millis(1));
        let (_tx, mut cancel) = watch::channel(false);
        let outcome = rig.acquire(&field_spec(), &mut cancel).await.unwrap();
        match outcome {
            AcquireOutcome::Completed { results, .. } => {
                let doc: MachineResultDoc = quick_xml::de::from_str(&results).unwrap();
                assert_eq!(doc.points.len(), 3); // 0, 10, 20
                assert_eq!(doc.setup_id, setup_ids::VOLTAGE_VS_FIELD);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_machine_rig_cancels_between_points() {
        let rig = MachineRig::new(Duration::from_secs(60));
        let (tx, mut cancel) = watch::channel(false);
        tx.send(true).unwrap();
        let outcome = rig.acquire(&field_spec(), &mut cancel).await.unwrap();
        assert!(matches!(outcome, AcquireOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_counter_rig_repeats_each_distance() {
        let rig = RadioactivityRig::new(Duration::from_millis(1), Duration::from_millis(1));
        let spec = ExperimentSpecification {
            setup_id: setup_ids::RADIOACTIVITY_VS_DISTANCE.to_string(),
            setup_name: String::new(),
            variant: SpecVariant::DistanceSweep {
                distances: vec![20, 40],
                duration: 1,
                repeat: 3,
            },
        };
        let (_tx, mut cancel) = watch::channel(false);
        let outcome = rig.acquire(&spec, &mut cancel).await.unwrap();
        match outcome {
            AcquireOutcome::Completed { results, .. } => {
                let doc: CounterResultDoc = quick_xml::de::from_str(&results).unwrap();
                assert_eq!(doc.counts.len(), 6);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_machine_rig_mirrors_drive_registers() {
        let rig = MachineRig::new(Duration::from_millis(1));
        let registers = rig.registers();
        let spec = ExperimentSpecification {
            setup_id: setup_ids::VOLTAGE_VS_FIELD.to_string(),
            setup_name: String::new(),
            variant: SpecVariant::FieldSweep {
                field: SweepRange { minimum: 0, maximum: 20, step: 10 },
                load: 15,
                speed: 1500,
            },
        };
        let (_tx, mut cancel) = watch::channel(false);
        rig.acquire(&spec, &mut cancel).await.unwrap();

        let snapshot = registers.read(0, drive_registers::TABLE_SIZE).unwrap();
        assert_eq!(snapshot[drive_registers::LOAD], 15);
        assert_eq!(snapshot[drive_registers::SPEED], 1500);
        // Last swept setpoint is the sweep maximum.
        assert_eq!(snapshot[drive_registers::FIELD], 20);
        assert!(snapshot[drive_registers::VOLTAGE_DECIVOLTS] > 0);
    }

    #[test]
    fn test_counts_fall_with_distance() {
        let near: f64 = f64::from(simulated_counts(10, 10));
        let far: f64 = f64::from(simulated_counts(100, 10));
        assert!(near > far);
    }

    #[test]
    fn test_wrong_variant_is_a_driver_error() {
        let rig = RadioactivityRig::new(Duration::from_millis(1), Duration::from_millis(1));
        let (_tx, mut cancel) = watch::channel(false);
        let err = tokio_test::block_on(rig.acquire(&field_spec(), &mut cancel)).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}
