use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use clap::Parser;
use color_eyre::eyre::{self, Result, WrapErr};
use preferences_serde1::{AppInfo, Preferences};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{self as log};

use mocap_ptz_core::{
    CalibrationRecord, CoordinateCalibrator, FloatType, MirrorCenterSolver, MirrorRayObservation,
    Pose, TrackerConfig,
};

use hardware::{LensActuator, PanTiltActuator};

mod codec;
mod hardware;
mod mocap;
mod serial_io;
mod sim;
mod tracking;
mod udp_codec;
mod udp_handling;
mod writing_state;

const APP_INFO: AppInfo = AppInfo {
    name: "mocap-ptz",
    author: "AndrewStraw",
};

/// Preferences key of the focus axis absolute position left by the last
/// session.
const LENS_POSITION_KEY: &str = "lens-position";

const SESSION_DIRNAME_TEMPLATE: &str = "mocap-ptz%Y%m%d_%H%M%S";
const MOCAP_UDP_DEFAULT: &str = "0.0.0.0:4444";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Path of serial device running the pan/tilt bridge firmware
    #[arg(long)]
    pantilt_serial: Option<String>,

    /// Path of serial device of the lens controller
    #[arg(long)]
    lens_serial: Option<String>,

    /// Run against a simulated target and rig instead of hardware
    #[arg(long)]
    simulate: bool,

    /// The address to bind for motion capture UDP datagrams
    #[arg(long, default_value = MOCAP_UDP_DEFAULT)]
    udp_addr: String,

    /// Timeout of a single actuator request, in milliseconds
    #[arg(long, default_value_t = 50)]
    request_timeout_ms: u64,

    /// Video frame timestamps to synchronize telemetry with when the session
    /// ends (JSON array or one value per line, ms since the Unix epoch)
    #[arg(long)]
    frame_timestamps: Option<PathBuf>,

    /// Filename of tracker configuration in YAML format
    #[arg(long)]
    config: Option<PathBuf>,

    /// If set, telemetry sessions and logs are saved to this directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand, Default)]
enum Commands {
    /// Run the tracker (default command)
    #[default]
    Run,
    /// Show the configuration and then quit
    ShowConfig,
    /// Compute the camera to world transform and write the calibration record
    Calibrate {
        /// YAML or JSON file with `pose_pairs`, `pan_origin` and `tilt_origin`
        input: PathBuf,
        /// Where to write the record. Defaults to `calibration_path` of the
        /// configuration.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Locate the mirror center from rays collected during a tilt sweep
    MirrorCenter {
        /// JSON array of mirror ray observations
        observations: PathBuf,
        /// Store the center as tilt origin in the calibration record
        #[arg(long)]
        update_calibration: bool,
    },
    /// Correlate a recorded session with video frame timestamps
    Sync {
        session_dir: PathBuf,
        frame_timestamps: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PosePair {
    camera: Pose,
    world: Pose,
}

/// Input of the `calibrate` command.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CalibrationInput {
    pose_pairs: Vec<PosePair>,
    pan_origin: [FloatType; 3],
    tilt_origin: [FloatType; 3],
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        let envstr = format!("{}=info,info", env!("CARGO_PKG_NAME")).replace('-', "_");
        std::env::set_var("RUST_LOG", envstr);
    }

    let mut cli = Cli::parse();
    let (log_dir, data_dir) = if let Some(dd) = cli.data_dir.as_ref() {
        (dd.clone(), dd.clone())
    } else {
        let home_dir =
            home::home_dir().ok_or_else(|| eyre::eyre!("could not determine home directory"))?;
        (home_dir.clone(), home_dir.join("mocap-ptz-data"))
    };

    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("While creating directory {}", log_dir.display()))?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("While creating directory {}", data_dir.display()))?;

    init_logging(&log_dir)?;

    let cfg = if let Some(cfg_fname) = &cli.config {
        log::info!("Reading tracker config from: {}", cfg_fname.display());
        let cfg_buf = std::fs::read_to_string(cfg_fname)
            .with_context(|| format!("opening file {}", cfg_fname.display()))?;
        let cfg: TrackerConfig = serde_yaml::from_str(&cfg_buf)
            .with_context(|| format!("while parsing YAML in file {}", cfg_fname.display()))?;
        cfg.validate()
            .with_context(|| format!("invalid config in file {}", cfg_fname.display()))?;
        cfg
    } else {
        log::info!("Loading default tracker config.");
        TrackerConfig::default()
    };

    let cfg_pretty = serde_yaml::to_string(&cfg)?;
    log::info!("tracker config:\n{cfg_pretty}");

    match cli.command.take().unwrap_or_default() {
        Commands::ShowConfig => Ok(()),
        Commands::Calibrate { input, output } => {
            let output = output.unwrap_or_else(|| cfg.calibration_path.clone());
            calibrate(&input, &output)
        }
        Commands::MirrorCenter {
            observations,
            update_calibration,
        } => mirror_center(&cfg, &observations, update_calibration),
        Commands::Sync {
            session_dir,
            frame_timestamps,
        } => {
            writing_state::synchronize_session(&session_dir, &frame_timestamps, cfg.video.frame_rate)?;
            Ok(())
        }
        Commands::Run => run_session(&cli, cfg, &data_dir).await,
    }
}

/// Enable logging to console and to disk using tracing.
fn init_logging(log_dir: &Path) -> Result<()> {
    use time::{format_description::well_known::Iso8601, UtcOffset};
    use tracing_subscriber::{
        fmt::{self, time::OffsetTime},
        layer::SubscriberExt,
    };

    let log_file_name = chrono::Local::now()
        .format(".mocap-ptz-%Y%m%d_%H%M%S.%f.log")
        .to_string();
    let full_log_file_name = log_dir.join(log_file_name);

    // Create a fixed offset time formatter based on the timezone at the
    // time this line of code runs.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
        Iso8601::DEFAULT,
    );

    let file = std::fs::File::create(&full_log_file_name)
        .with_context(|| format!("While creating file {}", full_log_file_name.display()))?;
    let file_writer = Mutex::new(file);
    let file_layer = fmt::layer()
        .with_timer(timer.clone())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true);
    let console_layer = fmt::layer()
        .with_timer(timer)
        .with_file(true)
        .with_line_number(true);
    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(tracing_subscriber::filter::EnvFilter::from_default_env());
    tracing::subscriber::set_global_default(collector)?;
    std::panic::set_hook(Box::new(tracing_panic::panic_hook));
    Ok(())
}

fn calibrate(input: &Path, output: &Path) -> Result<()> {
    let buf = std::fs::read_to_string(input)
        .with_context(|| format!("opening file {}", input.display()))?;
    let input_data: CalibrationInput = serde_yaml::from_str(&buf)
        .with_context(|| format!("while parsing {}", input.display()))?;
    let pairs: Vec<(Pose, Pose)> = input_data
        .pose_pairs
        .into_iter()
        .map(|p| (p.camera, p.world))
        .collect();

    let calibrator = CoordinateCalibrator::from_pose_pairs(&pairs)?;
    let record = CalibrationRecord::new(
        calibrator.transform(),
        input_data.pan_origin.into(),
        input_data.tilt_origin.into(),
    );
    record
        .save(output)
        .with_context(|| format!("writing calibration record {}", output.display()))?;
    log::info!("wrote calibration record {}", output.display());
    Ok(())
}

fn mirror_center(cfg: &TrackerConfig, observations: &Path, update_calibration: bool) -> Result<()> {
    let buf = std::fs::read_to_string(observations)
        .with_context(|| format!("opening file {}", observations.display()))?;
    let observations: Vec<MirrorRayObservation> =
        serde_json::from_str(&buf).with_context(|| "while parsing mirror ray observations")?;

    let solution = MirrorCenterSolver::new(cfg.mirror.clone()).solve(observations)?;
    println!("{}", serde_yaml::to_string(&solution)?);

    if update_calibration {
        let path = &cfg.calibration_path;
        let mut record = CalibrationRecord::load(path)
            .with_context(|| format!("loading calibration record {}", path.display()))?;
        record.tilt_origin = solution.center.into();
        record.timestamp = chrono::Utc::now();
        record.save(path)?;
        log::info!("stored mirror center as tilt origin in {}", path.display());
    }
    Ok(())
}

/// Build the actuators: simulated, or serial bridges on the given ports.
fn open_actuators(
    cli: &Cli,
    cfg: &TrackerConfig,
) -> Result<(Box<dyn PanTiltActuator>, Option<Box<dyn LensActuator>>)> {
    if cli.simulate {
        let lens = cfg.focus.as_ref().map(|focus| {
            Box::new(sim::SimLens::new(usize::from(focus.channel) + 1)) as Box<dyn LensActuator>
        });
        let pantilt = Box::new(sim::SimPanTilt::new(Duration::from_millis(40)));
        return Ok((pantilt, lens));
    }

    let handle = tokio::runtime::Handle::current();
    let timeout = Duration::from_millis(cli.request_timeout_ms);
    let pantilt_port = cli
        .pantilt_serial
        .as_deref()
        .ok_or_else(|| eyre::eyre!("No pan/tilt port given. Use --pantilt-serial or --simulate."))?;
    let pantilt = Box::new(serial_io::SerialPanTilt::new(
        pantilt_port,
        handle.clone(),
        timeout,
    ));

    let lens = match (&cfg.focus, cli.lens_serial.as_deref()) {
        (Some(_), Some(port)) => Some(
            Box::new(serial_io::SerialLens::new(port, handle, timeout)) as Box<dyn LensActuator>,
        ),
        (Some(_), None) => {
            eyre::bail!("Focus is configured but no lens port given. Use --lens-serial.");
        }
        (None, Some(port)) => {
            log::warn!("lens port {port} given but focus is not configured, ignoring it");
            None
        }
        (None, None) => None,
    };
    Ok((pantilt, lens))
}

async fn run_session(cli: &Cli, cfg: TrackerConfig, data_dir: &Path) -> Result<()> {
    // The controller cannot aim without a transform.
    let record = CalibrationRecord::load(&cfg.calibration_path).with_context(|| {
        format!(
            "loading calibration record {}",
            cfg.calibration_path.display()
        )
    })?;
    let (pantilt, lens) = open_actuators(cli, &cfg)?;

    let cancel = CancellationToken::new();
    let staleness = Duration::from_millis(cfg.mocap.staleness_timeout_ms);
    let (publisher, mocap) = mocap::latest_value_cell(staleness, cancel.clone());
    let feed_jh = if cli.simulate {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            sim::run_simulated_mocap(publisher, cancel).await;
            Ok::<_, eyre::Report>(())
        })
    } else {
        let udp_framed = udp_handling::setup_udp(cli.udp_addr.clone()).await?;
        tokio::spawn(udp_handling::run_mocap_udp_loop(
            udp_framed,
            publisher,
            staleness,
            cancel.clone(),
        ))
    };

    let creation_time = chrono::Local::now();
    let (telemetry_tx, telemetry_rx) = mpsc::channel(1);
    let recorder_cfg = writing_state::RecorderConfig {
        output_dir: data_dir.join(creation_time.format(SESSION_DIRNAME_TEMPLATE).to_string()),
        flush_interval: Duration::from_secs_f64(cfg.telemetry.flush_interval_secs),
        frame_timestamps: cli.frame_timestamps.clone(),
        frame_rate: cfg.video.frame_rate,
    };
    let recorder_jh = tokio::task::spawn_blocking(move || {
        writing_state::recorder_task_main(telemetry_rx, recorder_cfg, creation_time)
    });

    let saved_lens_position = match i32::load(&APP_INFO, LENS_POSITION_KEY) {
        Ok(position) => {
            log::debug!("loaded {LENS_POSITION_KEY}: {position}");
            Some(position)
        }
        Err(e) => {
            log::debug!("{LENS_POSITION_KEY} not loaded: {e}");
            None
        }
    };

    let devices = tracking::Collaborators {
        mocap: Box::new(mocap),
        pantilt,
        lens,
    };
    let controller = tracking::TrackingController::new(
        cfg,
        &record,
        devices,
        Some(telemetry_tx),
        saved_lens_position,
    )?;

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => log::info!("Ctrl-C received, stopping"),
                Err(e) => log::error!("cannot listen for Ctrl-C: {e}"),
            }
            cancel.cancel();
        });
    }

    let loop_cancel = cancel.clone();
    let (summary, result) =
        tokio::task::spawn_blocking(move || controller.run(loop_cancel)).await?;
    cancel.cancel();

    // Saved on failure too, the lens stays where it was left.
    if let Some(position) = summary.lens_position {
        match position.save(&APP_INFO, LENS_POSITION_KEY) {
            Ok(()) => log::debug!("saved {LENS_POSITION_KEY}: {position}"),
            Err(e) => log::error!("saving {LENS_POSITION_KEY}: {e}"),
        }
    }

    // The controller dropped its sender, so the recorder finishes.
    let n_samples = recorder_jh.await??;
    feed_jh.await??;
    result?;
    log::info!(
        "session done after {:.1} s: {} iterations, {n_samples} samples recorded, {} dropped",
        summary.elapsed.as_secs_f64(),
        summary.iterations,
        summary.dropped_samples
    );
    Ok(())
}
