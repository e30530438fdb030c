//! Assembly of the printer object graph from configuration.
//!
//! There is exactly one construction site: `main` (or a test harness)
//! loads the config, calls into here, and wires the results together. No
//! global state; everything threads through explicitly.

use crate::config::PrinterConfig;
use anyhow::{bail, Context, Result};
use motion::kinematics::{AxisLimits, CartesianKinematics, CoreXyKinematics, Kinematics};
use motion::planner::MoveLimits;
use motion::toolhead::{Stepper, Toolhead};
use stride_proto::command::{Command, Value};
use stride_proto::crc::crc16_ccitt;

/// Default step timing tolerance, seconds. Half of a conservative minimum
/// step interval for common stepper drivers.
const STEP_TOLERANCE: f64 = 0.000025;

/// Builds the kinematics implementation named in the config.
pub fn build_kinematics(config: &PrinterConfig) -> Result<Box<dyn Kinematics>> {
    let mut steps_per_mm = [0.0f64; 3];
    let mut limits = Vec::with_capacity(3);
    for (axis, stepper) in config.steppers.iter().take(3).enumerate() {
        steps_per_mm[axis] = 1.0 / stepper.step_distance;
        limits.push(AxisLimits {
            position_min: stepper.position_min,
            position_max: stepper.position_max,
            max_accel: stepper.max_accel,
        });
    }
    if limits.len() < 3 {
        bail!("configuration needs stepper_x, stepper_y, and stepper_z sections");
    }
    match config.printer.kinematics.as_str() {
        "cartesian" => Ok(Box::new(CartesianKinematics::new(steps_per_mm, limits))),
        "corexy" => Ok(Box::new(CoreXyKinematics::new(steps_per_mm, limits))),
        other => bail!("unsupported kinematics {other:?}"),
    }
}

/// Builds the toolhead with its steppers, assigning oids sequentially
/// within each stepper's session.
pub fn build_toolhead(config: &PrinterConfig) -> Result<Toolhead> {
    let mut limits = MoveLimits::new(config.printer.max_velocity, config.printer.max_accel);
    limits.max_accel_to_decel = config.printer.max_accel_to_decel;
    limits.set_square_corner_velocity(config.printer.square_corner_velocity);

    let mut per_session_oids = vec![0u8; config.mcus.len()];
    let mut steppers = Vec::with_capacity(config.steppers.len());
    for section in &config.steppers {
        let mcu = config
            .mcu_index(&section.mcu)
            .with_context(|| format!("[{}] names unknown mcu {:?}", section.name, section.mcu))?;
        let freq = config.mcus[mcu].clock_freq;
        let max_error = (STEP_TOLERANCE * freq) as u32;
        let mut stepper = Stepper::new(&section.name, section.step_distance, mcu, max_error);
        stepper.oid = per_session_oids[mcu];
        per_session_oids[mcu] += 1;
        steppers.push(stepper);
    }
    Ok(Toolhead::new(limits, steppers))
}

/// The configuration command batch for each session: oid allocation, one
/// config_stepper per stepper, and a finalize carrying a config checksum
/// so host and MCU can detect disagreement after reconnects.
pub fn config_batches(config: &PrinterConfig) -> Vec<Vec<Command>> {
    let crc = config_crc(config);
    config
        .mcus
        .iter()
        .enumerate()
        .map(|(mcu_index, _)| {
            let steppers: Vec<_> = config
                .steppers
                .iter()
                .filter(|s| config.mcu_index(&s.mcu) == Some(mcu_index))
                .collect();
            let mut batch = vec![
                Command::new("get_config", vec![]),
                Command::new("allocate_oids", vec![Value::U8(steppers.len() as u8)]),
            ];
            for (oid, section) in steppers.iter().enumerate() {
                batch.push(Command::new(
                    "config_stepper",
                    vec![
                        Value::U8(oid as u8),
                        Value::U8(section.step_pin),
                        Value::U8(section.dir_pin),
                        Value::U32(100),
                    ],
                ));
            }
            batch.push(Command::new("finalize_config", vec![Value::U32(crc)]));
            batch
        })
        .collect()
}

/// A stable checksum over the parts of the config the MCU cares about.
fn config_crc(config: &PrinterConfig) -> u32 {
    let mut text = String::new();
    for s in &config.steppers {
        text.push_str(&format!(
            "{}:{}:{}:{};",
            s.name, s.mcu, s.step_pin, s.dir_pin
        ));
    }
    crc16_ccitt(text.as_bytes()) as u32
}
