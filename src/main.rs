//! CLI front-end: wires configuration, logging, and the engine together
//! for interactive or scripted runs.
//!
//! Grounded on the teacher's root binary conventions (`clap` derive,
//! `tracing_subscriber::fmt().with_env_filter(...)` at startup) rather
//! than its GUI/gRPC-daemon `main.rs`, since this engine has no GUI and
//! no network transport in scope.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use camacq::config;
use camacq::driver::{CameraDriver, FakeCamera};
use camacq::engine::{Engine, RunReport, StageStats};

#[derive(Parser)]
#[command(name = "camacq", about = "Three-thread camera acquisition pipeline")]
struct Cli {
    /// Path to a TOML configuration file. Defaults to `camacq.toml` in the
    /// working directory, if present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Camera driver collaborator to acquire through.
    #[arg(long, value_enum, default_value = "fake")]
    driver: DriverKind,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum DriverKind {
    /// The deterministic in-process fake camera.
    Fake,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let raw = config::load(cli.config.as_deref()).context("loading configuration")?;
    let mut settings = raw
        .acquisition
        .into_settings()
        .context("building settings from configuration")?;

    // `FakeCamera` only negotiates `frame_bytes` through `setup_exp`; it
    // never writes its own width/height back into `Settings`. Without this,
    // the disk worker would build zero-sized TIFF/PRD headers even though
    // the fake device is happily producing `width x height` pixel buffers.
    let fake_camera_cfg = raw.fake_camera;
    settings.revise(|w| {
        w.set_width(fake_camera_cfg.width)
            .set_height(fake_camera_cfg.height)
            .set_bit_depth(16);
    });

    let driver: Box<dyn CameraDriver> = match cli.driver {
        DriverKind::Fake => Box::new(FakeCamera::new(fake_camera_cfg.into())),
    };

    let engine = Engine::new(driver, settings).context("initializing the acquisition engine")?;
    engine.start().context("starting acquisition")?;

    let abort_engine = Arc::clone(&engine);
    thread::spawn(move || {
        println!("Acquiring. Press Enter to stop early.");
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        abort_engine.request_abort(false);
    });

    let report = engine.wait_for_stop().context("waiting for acquisition to stop")?;
    print_report(&report);

    Ok(())
}

fn print_report(report: &RunReport) {
    println!();
    if report.aborted {
        println!("Acquisition stopped.");
    } else {
        println!("Acquisition finished.");
    }
    print_stage("Acquisition", &report.acq);
    print_stage("Disk", &report.disk);
}

fn print_stage(name: &str, stats: &StageStats) {
    println!("\n{name} stage:");
    println!("  frame_count: {}", stats.frame_count);
    println!("  lost_count: {}", stats.lost_count);
    println!("  lost_percent: {:.2}", stats.lost_percent);
    println!(
        "  average_spacing_between_drops: {:.2}",
        stats.avg_spacing
    );
    println!("  longest_drop_run: {}", stats.longest_drop_run);
    println!("  peak_queue_size: {}", stats.peak_queue_size);
    println!("  max_queue_size: {}", stats.max_queue_size);
    println!("  fps: {:.2}", stats.fps);
    println!("  MiB/s: {:.2}", stats.mib_per_sec);
}
