use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sdftrack::io::DepthDataset;
use sdftrack::trajectory::Trajectory;
use sdftrack::{ExportOptions, SdfParameters, SdfTracker};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Tracks and fuses a depth sequence into a signed distance volume")]
struct Args {
    /// Directory with `depth.txt` (and optionally `rgb.txt`)
    dataset: PathBuf,
    /// JSON file with tracker parameters
    #[arg(long)]
    params: Option<PathBuf>,
    /// Maximum number of frames to process
    #[arg(long)]
    max_frames: Option<usize>,
    /// Process every n-th frame
    #[arg(long, default_value_t = 1)]
    skip_frames: usize,
    /// Starts from a previously saved volume
    #[arg(long)]
    load_volume: Option<PathBuf>,
    /// Writes the extracted mesh as PLY at the end
    #[arg(long)]
    save_mesh: Option<PathBuf>,
    /// Writes the volume at the end
    #[arg(long)]
    save_volume: Option<PathBuf>,
    /// Writes the camera trajectory in TUM format at the end
    #[arg(long)]
    trajectory: Option<PathBuf>,
}

fn run(args: Args) -> sdftrack::Result<bool> {
    let params = match &args.params {
        Some(path) => SdfParameters::from_json_file(path)?,
        None => SdfParameters::default(),
    };
    let dataset = DepthDataset::load(&args.dataset, params.intrinsics.clone())?;
    let mut system = SdfTracker::configure(params)?;
    if let Some(path) = &args.load_volume {
        system.load_volume(path)?;
    }

    let termination = system.termination_handle();
    let handler = termination.clone();
    if let Err(err) = ctrlc::set_handler(move || handler.request()) {
        warn!(%err, "no interrupt handler, stopping requires killing the process");
    }
    let num_frames = args.max_frames.unwrap_or(usize::MAX).min(dataset.len());
    let mut trajectory = Trajectory::default();
    let mut num_lost = 0;
    info!(frames = num_frames, color = dataset.has_color(), "processing dataset");

    for index in (0..num_frames).step_by(args.skip_frames.max(1)) {
        if system.is_terminated() {
            break;
        }
        let frame = match dataset.get(index) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(index, %err, "skipping unreadable frame");
                continue;
            }
        };

        match system.process_depth_frame(&frame.depth, frame.color.as_ref()) {
            Ok(status) => {
                if !status.tracking_valid {
                    num_lost += 1;
                }
                trajectory.push(status.pose.clone(), frame.timestamp);
                info!(
                    index,
                    tracking_valid = status.tracking_valid,
                    fused = status.fused,
                    iterations = status.iterations,
                    "frame"
                );
            }
            Err(err) => warn!(index, %err, "frame skipped"),
        }
    }
    if termination.is_requested() {
        info!("stop requested, finalizing");
    }
    info!(processed = trajectory.len(), lost = num_lost, "done");

    if let Some(path) = &args.trajectory {
        trajectory.save_tum(path)?;
    }
    Ok(system.finalize(&ExportOptions {
        mesh_path: args.save_mesh,
        volume_path: args.save_volume,
        trajectory_path: None,
    }))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Args::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(%err, "sdf_tracker failed");
            ExitCode::FAILURE
        }
    }
}
