//! Printer configuration loader.
//!
//! Parses the INI-style printer config file into strongly-typed structs.
//! Only the sections the core consumes are modeled here; unknown sections
//! are ignored so external modules can share the same file.

use anyhow::{Context, Result};
use configparser::ini::Ini;
use std::path::Path;

/// The [printer] section: global motion limits.
#[derive(Debug, Clone)]
pub struct PrinterSection {
    pub kinematics: String,
    pub max_velocity: f64,
    pub max_accel: f64,
    pub max_accel_to_decel: f64,
    pub square_corner_velocity: f64,
}

/// One [mcu …] section: where to reach the microcontroller.
#[derive(Debug, Clone)]
pub struct McuSection {
    pub name: String,
    /// Serial device path, or the path of a unix socket (the simulator).
    pub serial: String,
    pub baud: u32,
    /// Nominal tick rate of the MCU's free-running counter.
    pub clock_freq: f64,
}

/// One [stepper_…] or [extruder] section.
#[derive(Debug, Clone)]
pub struct StepperSection {
    pub name: String,
    /// Millimeters per full step, signed.
    pub step_distance: f64,
    pub position_min: f64,
    pub position_max: f64,
    pub max_accel: f64,
    /// Which [mcu] drives this stepper.
    pub mcu: String,
    pub step_pin: u8,
    pub dir_pin: u8,
}

/// The whole parsed configuration.
#[derive(Debug, Clone)]
pub struct PrinterConfig {
    pub printer: PrinterSection,
    pub mcus: Vec<McuSection>,
    pub steppers: Vec<StepperSection>,
}

impl PrinterConfig {
    /// Loads and parses the configuration file from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("failed to load configuration file {path:?}"))?;
        Self::parse(&ini)
    }

    /// Parses an already-loaded INI document (used by tests).
    pub fn parse(ini: &Ini) -> Result<Self> {
        let printer = PrinterSection {
            kinematics: ini
                .get("printer", "kinematics")
                .context("[printer] kinematics not set")?,
            max_velocity: get_float(ini, "printer", "max_velocity")?,
            max_accel: get_float(ini, "printer", "max_accel")?,
            max_accel_to_decel: get_float_or(ini, "printer", "max_accel_to_decel", f64::NAN)?,
            square_corner_velocity: get_float_or(ini, "printer", "square_corner_velocity", 5.0)?,
        };
        let printer = PrinterSection {
            max_accel_to_decel: if printer.max_accel_to_decel.is_nan() {
                printer.max_accel * 0.5
            } else {
                printer.max_accel_to_decel
            },
            ..printer
        };

        let mut mcus = Vec::new();
        let mut steppers = Vec::new();
        for section in ini.sections() {
            if section == "mcu" || section.starts_with("mcu ") {
                let name = section.strip_prefix("mcu ").unwrap_or("mcu").to_string();
                mcus.push(McuSection {
                    name,
                    serial: ini
                        .get(&section, "serial")
                        .with_context(|| format!("[{section}] serial not set"))?,
                    baud: get_float_or(ini, &section, "baud", 250_000.0)? as u32,
                    clock_freq: get_float_or(ini, &section, "clock_freq", 16_000_000.0)?,
                });
            } else if section.starts_with("stepper_") || section == "extruder" {
                steppers.push(StepperSection {
                    name: section.clone(),
                    step_distance: get_float(ini, &section, "step_distance")?,
                    position_min: get_float_or(ini, &section, "position_min", 0.0)?,
                    position_max: get_float_or(ini, &section, "position_max", 0.0)?,
                    max_accel: get_float_or(ini, &section, "max_accel", printer.max_accel)?,
                    mcu: ini
                        .get(&section, "mcu")
                        .unwrap_or_else(|| "mcu".to_string()),
                    step_pin: get_float_or(ini, &section, "step_pin", 0.0)? as u8,
                    dir_pin: get_float_or(ini, &section, "dir_pin", 0.0)? as u8,
                });
            }
        }
        if mcus.is_empty() {
            anyhow::bail!("no [mcu] section in configuration");
        }
        // Steppers in a predictable x, y, z, extruder order.
        steppers.sort_by_key(|s| match s.name.as_str() {
            "stepper_x" => 0,
            "stepper_y" => 1,
            "stepper_z" => 2,
            "extruder" => 3,
            _ => 4,
        });
        Ok(PrinterConfig {
            printer,
            mcus,
            steppers,
        })
    }

    pub fn mcu_index(&self, name: &str) -> Option<usize> {
        self.mcus.iter().position(|m| m.name == name)
    }
}

fn get_float(ini: &Ini, section: &str, key: &str) -> Result<f64> {
    ini.getfloat(section, key)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("[{section}] {key}"))?
        .with_context(|| format!("[{section}] {key} not set"))
}

fn get_float_or(ini: &Ini, section: &str, key: &str, default: f64) -> Result<f64> {
    Ok(ini
        .getfloat(section, key)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("[{section}] {key}"))?
        .unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PrinterConfig {
        let mut ini = Ini::new();
        ini.read(
            r#"
[printer]
kinematics = cartesian
max_velocity = 300
max_accel = 3000
square_corner_velocity = 5.0

[mcu]
serial = /tmp/strider-test.sock
baud = 250000

[stepper_x]
step_distance = 0.0125
position_max = 250
max_accel = 3000

[stepper_y]
step_distance = 0.0125
position_max = 210

[stepper_z]
step_distance = 0.0025
position_max = 200
max_accel = 100

[extruder]
step_distance = 0.002
"#
            .to_string(),
        )
        .unwrap();
        PrinterConfig::parse(&ini).unwrap()
    }

    #[test]
    fn parses_all_sections() {
        let config = sample();
        assert_eq!(config.printer.kinematics, "cartesian");
        assert_eq!(config.printer.max_velocity, 300.0);
        // Defaults to half of max_accel when unset.
        assert_eq!(config.printer.max_accel_to_decel, 1500.0);
        assert_eq!(config.mcus.len(), 1);
        assert_eq!(config.mcus[0].baud, 250_000);
        assert_eq!(config.steppers.len(), 4);
        assert_eq!(config.steppers[0].name, "stepper_x");
        assert_eq!(config.steppers[3].name, "extruder");
        // Unset stepper accel inherits the printer-wide limit.
        assert_eq!(config.steppers[1].max_accel, 3000.0);
        assert_eq!(config.steppers[2].max_accel, 100.0);
    }

    #[test]
    fn missing_mcu_is_an_error() {
        let mut ini = Ini::new();
        ini.read("[printer]\nkinematics = cartesian\nmax_velocity = 100\nmax_accel = 1000\n".into())
            .unwrap();
        assert!(PrinterConfig::parse(&ini).is_err());
    }
}
