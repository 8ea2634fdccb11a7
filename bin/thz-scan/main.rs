use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::RecvTimeoutError;
use env_logger::Env;
use log::{error, info, warn, LevelFilter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thz_scan::config::{load_config, AppConfig};
use thz_scan::grid::reconstruct;
use thz_scan::store;
use thz_scan::{
    Axis, MoveOutcome, NoHumiditySensor, Positioner, ScanEvent, ScanOrchestrator, ScanState, Stage,
};

/// Raster-scan acquisition tool
#[derive(Parser, Debug)]
#[command(name = "thz-scan")]
#[command(about = "Two-axis raster scans with a pulse-sampling instrument", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the configured scan and save the result
    Scan {
        /// Also save the partial result if the scan is stopped
        #[arg(long)]
        save_partial: bool,
    },
    /// Run the homing procedure of one axis
    Home {
        #[arg(value_enum)]
        axis: AxisArg,
    },
    /// Move to an absolute position, measured from where the axes were connected
    Move {
        #[arg(long)]
        x: Option<f64>,
        #[arg(long)]
        y: Option<f64>,
    },
    /// Fetch and summarise the instrument's time axis
    TimeAxis,
    /// Rebuild the peak and peak-to-peak images of a saved scan
    Reconstruct {
        file: PathBuf,
        /// Directory for the PNG images (defaults to the file's directory)
        #[arg(long, value_name = "DIR")]
        png_dir: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AxisArg {
    X,
    Y,
}

impl From<AxisArg> for Axis {
    fn from(arg: AxisArg) -> Self {
        match arg {
            AxisArg::X => Axis::X,
            AxisArg::Y => Axis::Y,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let log_level = args.log_level.unwrap_or(config.console.verbosity.clone());
    initialize_logging(&log_level)?;

    match args.command {
        Commands::Scan { save_partial } => run_scan(&config, save_partial),
        Commands::Home { axis } => {
            let axis = Axis::from(axis);
            let stage = connect_stage(&config, &[axis])?;
            info!("Homing axis {axis}...");
            stage.home(axis)?;
            info!("Axis {axis} homed");
            Ok(())
        }
        Commands::Move { x, y } => {
            let targets: Vec<(Axis, f64)> = [(Axis::X, x), (Axis::Y, y)]
                .into_iter()
                .filter_map(|(axis, target)| target.map(|t| (axis, t)))
                .collect();
            if targets.is_empty() {
                return Err("nothing to do: pass --x and/or --y".into());
            }

            let axes: Vec<Axis> = targets.iter().map(|(axis, _)| *axis).collect();
            let stage = connect_stage(&config, &axes)?;
            for (axis, target) in targets {
                match stage.move_axis_to(axis, target)? {
                    MoveOutcome::Moved => info!("Axis {axis} at {target:.2}mm"),
                    MoveOutcome::AlreadyAtTarget => info!("Axis {axis} already at {target:.2}mm"),
                }
            }
            let position = stage.position();
            info!("Position: X={:.2}mm, Y={:.2}mm", position.x, position.y);
            Ok(())
        }
        Commands::TimeAxis => {
            let client = config.acquisition.client()?;
            let time_axis = client.get_time_axis()?;
            match (time_axis.first(), time_axis.last()) {
                (Some(first), Some(last)) => info!(
                    "Time axis from {} has {} points ({first:.3} .. {last:.3})",
                    client.endpoint(),
                    time_axis.len()
                ),
                _ => warn!("Time axis from {} is empty", client.endpoint()),
            }
            Ok(())
        }
        Commands::Reconstruct { file, png_dir } => {
            let result = store::load(&file)?;
            let grid = reconstruct(&result.samples, &result.plan);
            info!(
                "{}: {} of {} cells filled, {} samples outside the grid",
                file.display(),
                grid.filled_cells(),
                grid.peak.len(),
                grid.dropped
            );

            let dir = png_dir
                .or_else(|| file.parent().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from("."));
            grid.write_png(&dir, &file_stem(&file))?;
            Ok(())
        }
    }
}

/// Connect the requested axes using the ports from the configuration
fn connect_stage(config: &AppConfig, axes: &[Axis]) -> Result<Stage, Box<dyn std::error::Error>> {
    let stage = Stage::new(
        config.axes.x.settings(Axis::X),
        config.axes.y.settings(Axis::Y),
        config.motion.timeouts(),
    );

    for &axis in axes {
        let axis_config = match axis {
            Axis::X => &config.axes.x,
            Axis::Y => &config.axes.y,
        };
        let port = axis_config.port.as_deref().ok_or_else(|| {
            format!(
                "no serial port configured for axis {axis} (set axes.{}.port)",
                axis.to_string().to_lowercase()
            )
        })?;
        stage.connect(axis, port)?;
    }

    Ok(stage)
}

fn run_scan(config: &AppConfig, save_partial: bool) -> Result<(), Box<dyn std::error::Error>> {
    let stage = connect_stage(config, &[Axis::X, Axis::Y])?;
    let client = config.acquisition.client()?;
    let output_dir = config.output.directory();

    let mut scan = ScanOrchestrator::new(
        Arc::new(stage.clone()),
        Arc::new(client),
        Arc::new(NoHumiditySensor),
    )
    .with_output_dir(&output_dir);
    scan.configure(config.scan.clone())?;
    let events = scan.subscribe();

    let stop = scan.stop_token();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping after the current point...");
        stop.request_stop();
    })?;

    let plan = &config.scan;
    info!(
        "Starting scan: {} x {} points, step ({}, {}) mm, gate [{}, {}]",
        plan.x_steps(),
        plan.y_steps(),
        plan.step_x,
        plan.step_y,
        plan.t_min,
        plan.t_max
    );
    scan.start()?;

    loop {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(ScanEvent::Progress(pct)) => info!("Progress: {pct}%"),
            Ok(ScanEvent::Completed { .. }) => break,
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) if scan.is_finished() => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let report = scan.wait().ok_or("scan worker terminated abnormally")?;
    stage.disconnect_all();

    let saved_to = match (&report.saved_to, report.state) {
        (Some(path), _) => Some(path.clone()),
        (None, ScanState::Stopped) if save_partial => match store::save(&report.result, &output_dir) {
            Ok(path) => {
                info!("Partial data is saved: {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("Saving partial data failed: {e}");
                None
            }
        },
        _ => None,
    };

    if config.output.export_png {
        if let Some(path) = &saved_to {
            let grid = reconstruct(&report.result.samples, &report.result.plan);
            grid.write_png(&output_dir, &file_stem(path))?;
        }
    }

    match report.state {
        ScanState::Completed | ScanState::Stopped => {
            info!("✓ {}", report.result.message);
            Ok(())
        }
        _ => {
            error!("✗ {}", report.result.message);
            Err(report.result.message.into())
        }
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("scan")
        .to_string()
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => {
            eprintln!("Warning: Invalid log level '{log_level}', using 'info'");
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}
