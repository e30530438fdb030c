//! Offline planning subcommand.
//!
//! Feeds a move list through the planner without a live MCU and prints the
//! solved velocity profiles, for tuning and analysis. Each input line is
//! `x y z e speed`, blank lines and `#` comments ignored.

use crate::config::PrinterConfig;
use crate::setup::{build_kinematics, build_toolhead};
use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use tracing::info;

/// Arguments for the `plan` subcommand.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Path to the move list to process.
    #[arg(required = true)]
    moves_file: PathBuf,

    /// Path to the printer configuration file.
    #[arg(short, long, default_value = "printer.cfg")]
    config: PathBuf,
}

/// Runs the offline planning pass.
pub fn run_plan(args: PlanArgs) -> Result<()> {
    let config = PrinterConfig::load(&args.config)?;
    let kinematics = build_kinematics(&config)?;
    let mut toolhead = build_toolhead(&config)?;

    let file = File::open(&args.moves_file)
        .with_context(|| format!("failed to open move list {:?}", args.moves_file))?;
    let reader = BufReader::new(file);

    for (line_number, line) in reader.lines().enumerate() {
        let line = line?;
        let text = line.split('#').next().unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }
        let fields: Vec<f64> = text
            .split_whitespace()
            .map(|f| f.parse().map_err(anyhow::Error::from))
            .collect::<Result<_>>()
            .with_context(|| format!("line {}: bad move {text:?}", line_number + 1))?;
        let &[x, y, z, e, speed] = fields.as_slice() else {
            anyhow::bail!("line {}: expected `x y z e speed`", line_number + 1);
        };
        toolhead
            .move_to(kinematics.as_ref(), [x, y, z, e], speed)
            .with_context(|| format!("line {}: move rejected", line_number + 1))?;
    }

    let moves = toolhead.flush();
    info!(count = moves.len(), "planned move list");
    println!(
        "{:>4}  {:>9}  {:>8}  {:>8}  {:>8}  {:>8}  {:>8}  {:>8}",
        "#", "dist", "start_v", "cruise_v", "end_v", "t_accel", "t_cruise", "t_decel"
    );
    for (i, m) in moves.iter().enumerate() {
        println!(
            "{:>4}  {:>9.3}  {:>8.2}  {:>8.2}  {:>8.2}  {:>8.4}  {:>8.4}  {:>8.4}",
            i,
            m.distance,
            m.start_v,
            m.cruise_v,
            m.end_v,
            m.accel_time(),
            m.cruise_time(),
            m.decel_time(),
        );
    }
    let total: f64 = moves.iter().map(|m| m.total_time()).sum();
    println!("total motion time: {total:.4}s");
    Ok(())
}
