use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::mpsc;

use tool_tracking_rs::config::TrackerConfig;
use tool_tracking_rs::error::TrackingError;
use tool_tracking_rs::live_status::LiveStatus;
use tool_tracking_rs::replay::{load_session, synthesize_session, SessionPlayer, SessionRecord, SyntheticParams};
use tool_tracking_rs::rerun_logger::RerunLogger;
use tool_tracking_rs::tracker::{EstimatorMode, TrackingEvent};

#[derive(Parser, Debug)]
#[command(name = "tool_tracker")]
#[command(about = "Surgical tool tracker - UKF vs particle filter replay", long_about = None)]
struct Args {
    /// Recorded session (.json or .json.gz); a synthetic session is generated when omitted
    #[arg(long)]
    session: Option<PathBuf>,

    /// Tracker configuration (JSON); defaults apply to missing fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Estimators to run
    #[arg(long, value_enum, default_value = "both")]
    estimator: EstimatorMode,

    /// Output directory
    #[arg(long, default_value = "tool_tracker_output")]
    output_dir: String,

    /// Write live status every N frames
    #[arg(long, default_value = "10")]
    status_every: u64,

    /// Record a Rerun .rrd file next to the results
    #[arg(long)]
    rerun: bool,

    /// RNG seed for the particle filter and synthetic sessions
    #[arg(long)]
    seed: Option<u64>,

    /// Frames in a synthetic session
    #[arg(long, default_value = "300")]
    frames: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    println!("[{}] Tool Tracker RS Starting", ts_now());
    println!("  Estimator: {}", args.estimator.as_str());
    println!("  Output Dir: {}", args.output_dir);

    let mut config = match &args.config {
        Some(path) => TrackerConfig::from_json_file(path)?,
        None => TrackerConfig::default(),
    };
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    config.validate()?;

    let session = match &args.session {
        Some(path) => {
            println!("[{}] Loading session {}", ts_now(), path.display());
            load_session(path)?
        }
        None => {
            println!("[{}] No session given, generating {} synthetic frames", ts_now(), args.frames);
            synthesize_session(&SyntheticParams {
                frames: args.frames,
                arms: config.arms,
                joint_angles: config.joint_angles,
                seed: args.seed.unwrap_or(7),
                ..SyntheticParams::default()
            })?
        }
    };
    println!("  Frames: {}", session.frame_count());

    std::fs::create_dir_all(&args.output_dir)?;
    let stamp = ts_now_clean();

    let rerun = if args.rerun {
        let path = format!("{}/rerun_{}.rrd", args.output_dir, stamp);
        Some(RerunLogger::new(&path)?)
    } else {
        None
    };

    let mut player = SessionPlayer::new(config.clone(), args.estimator, &session)?;

    // Ctrl-C abandons the in-flight cycle; the last committed estimate stays valid
    let cancel = player.tracker().cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    // Reader task streams session records into the processing loop
    let (record_tx, mut record_rx) = mpsc::channel::<SessionRecord>(256);
    let records = session.records;
    let _reader_handle = tokio::spawn(async move {
        for record in records {
            if record_tx.send(record).await.is_err() {
                break;
            }
        }
    });

    let status_path = format!("{}/live_status.json", args.output_dir);
    let mut status = LiveStatus::new();
    let start = Instant::now();
    let mut frames = 0u64;

    println!("[{}] Starting replay...", ts_now());

    while let Some(record) = record_rx.recv().await {
        let outcome = match player.apply(record) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => continue,
            Err(TrackingError::Cancelled) => {
                println!("[{}] Interrupted, stopping...", ts_now());
                break;
            }
            Err(e) => return Err(e).context("replay failed"),
        };
        frames += 1;

        for event in &outcome.events {
            match event {
                TrackingEvent::Initialized { estimator, timestamp } => {
                    println!("[{}] {} initialized at t={:.3}s", ts_now(), estimator.as_str(), timestamp);
                }
                TrackingEvent::CycleFailed { estimator, error } => {
                    println!("[{}] {} cycle failed: {}", ts_now(), estimator.as_str(), error);
                }
                TrackingEvent::PersistentCondition(p) => {
                    println!(
                        "[{}] {} {} for {} cycles",
                        ts_now(),
                        p.estimator.as_str(),
                        p.condition.as_str(),
                        p.streak
                    );
                }
                _ => {}
            }
        }

        if let Some(rec) = &rerun {
            rec.log_snapshot(&outcome.snapshot);
            rec.log_reference(&outcome.reference);
            if let Some(e) = outcome.kinematic_error_mm {
                rec.log_error("kinematics", e);
            }
            if let Some(e) = outcome.ukf_error_mm {
                rec.log_error("ukf", e);
            }
            if let Some(e) = outcome.particle_error_mm {
                rec.log_error("pf", e);
            }
        }

        if args.status_every > 0 && frames % args.status_every == 0 {
            status.update(
                &outcome.snapshot,
                player.tracker().health(),
                config.streak_warning,
                start.elapsed().as_secs(),
            );
            if let Err(e) = status.save(&status_path) {
                log::warn!("failed to write live status: {}", e);
            }

            let fmt = |e: Option<f64>| e.map(|v| format!("{:.2}mm", v)).unwrap_or_else(|| "-".to_string());
            println!(
                "[{}] t={:.2}s frame {} | kin {} | ukf {} | pf {} | {}",
                ts_now(),
                outcome.timestamp,
                frames,
                fmt(outcome.kinematic_error_mm),
                fmt(outcome.ukf_error_mm),
                fmt(outcome.particle_error_mm),
                player.tracker().health().format_status()
            );
        }
    }

    let snapshot = player.tracker().get_snapshot();
    status.update(
        &snapshot,
        player.tracker().health(),
        config.streak_warning,
        start.elapsed().as_secs(),
    );
    status.save(&status_path)?;

    let summary = player.summary();
    let results_path = format!("{}/results_{}.json", args.output_dir, stamp);
    std::fs::write(&results_path, serde_json::to_string_pretty(&summary)?)?;

    let fmt = |e: Option<f64>| e.map(|v| format!("{:.3} mm", v)).unwrap_or_else(|| "n/a".to_string());
    println!("[{}] Replay complete in {:.1}s", ts_now(), start.elapsed().as_secs_f64());
    println!("  Frames: {} ({} skipped)", summary.frames, summary.skipped_frames);
    println!("  Kinematics RMSE: {}", fmt(summary.kinematic_rmse_mm));
    println!("  UKF RMSE:        {} ({} failed cycles)", fmt(summary.ukf_rmse_mm), summary.ukf_failures);
    println!(
        "  PF RMSE:         {} ({} failed cycles)",
        fmt(summary.particle_rmse_mm),
        summary.particle_failures
    );
    println!("  Results: {}", results_path);

    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
