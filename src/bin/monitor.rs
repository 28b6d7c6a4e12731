//! `can-monitor`: command-line entry point for the frame monitor pipeline.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;

use can_uds_toolkit::config::MonitorConfig;
use can_uds_toolkit::dtc::DtcTable;
use can_uds_toolkit::error::IoError;
use can_uds_toolkit::frame::{FrameIo, LoopbackFrameIo};
use can_uds_toolkit::hardware::{setup_interface, SystemCommands};
use can_uds_toolkit::isotp::IsoTpConfig;
use can_uds_toolkit::metrics::Metrics;
use can_uds_toolkit::monitor::{run_with_reconnect, MonitorPipeline};
use can_uds_toolkit::reassembler::PassiveReassembler;
use can_uds_toolkit::signal_db::{JsonSignalDatabase, SignalDatabase};

#[derive(Parser, Debug)]
#[command(name = "can-monitor", about = "Passive CAN/UDS diagnostic monitor")]
struct Cli {
    /// CAN bitrate, used when bringing the interface up ourselves.
    #[arg(long, default_value_t = 500_000)]
    bitrate: u32,
    /// CAN interface name.
    #[arg(long, default_value = "can0")]
    interface: String,
    /// If given, the current metrics snapshot is rewritten to this path on every mutation.
    #[arg(long)]
    log: Option<PathBuf>,
    /// Run against an in-memory loopback device instead of real hardware.
    #[arg(long)]
    listen_only: bool,
    /// Log every observed frame's raw bytes and decoded signals.
    #[arg(long)]
    print_raw: bool,
    /// Path to a JSON configuration file (patches, UDS/DTC table).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the logging level (`error`, `warn`, `info`, `debug`, `trace`).
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(cli: &Cli, cfg: &Option<MonitorConfig>) {
    let level = cli
        .log_level
        .clone()
        .or_else(|| cfg.as_ref().and_then(|c| c.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn build_databases(cfg: &Option<MonitorConfig>) -> Vec<Box<dyn SignalDatabase>> {
    let Some(path) = cfg.as_ref().and_then(|c| c.signal_db.as_ref()) else {
        return Vec::new();
    };
    match JsonSignalDatabase::load(path) {
        Ok(db) => vec![Box::new(db)],
        Err(e) => {
            log::warn!("failed to load signal database {path}: {e}");
            Vec::new()
        }
    }
}

fn build_reassembler(cfg: &Option<MonitorConfig>) -> Option<PassiveReassembler> {
    let uds = cfg.as_ref()?.uds.as_ref()?;
    let isotp_cfg = IsoTpConfig {
        rx_block_size: uds.flow_control.block_size,
        rx_st_min: std::time::Duration::from_millis(uds.flow_control.st_min_ms),
        ..IsoTpConfig::normal(uds.ecu_request_id, uds.ecu_response_id)
    };
    let table = DtcTable::new(uds.dtcs.clone());
    Some(PassiveReassembler::new(isotp_cfg, table))
}

fn main() {
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => match MonitorConfig::load(path) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                eprintln!("failed to load config {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => None,
    };

    init_logging(&cli, &cfg);

    let metrics = Arc::new(Metrics::new());
    if let Some(path) = cli.log.clone() {
        metrics.set_output_file(Some(path));
    }

    let bitrate = cfg.as_ref().map(|c| c.bitrate).unwrap_or(cli.bitrate);
    let interface = cfg
        .as_ref()
        .map(|c| c.interface.clone())
        .unwrap_or_else(|| cli.interface.clone());

    // No signal handler is installed: the stop flag exists for programmatic callers (see the
    // `monitor` module's tests); a real Ctrl+C falls through to the OS default SIGINT action.
    let stop = Arc::new(AtomicBool::new(false));

    let listen_only = cli.listen_only;
    let print_raw = cli.print_raw;
    let cfg_for_factory = cfg.clone();

    let exit_code = if listen_only {
        let metrics_for_factory = metrics.clone();
        let factory = move || -> Result<MonitorPipeline<LoopbackFrameIo>, IoError> {
            let io = LoopbackFrameIo::new();
            Ok(build_pipeline(io, &cfg_for_factory, print_raw, metrics_for_factory.clone()))
        };
        run_with_reconnect(factory, &stop, metrics.clone())
    } else {
        #[cfg(feature = "socketcan")]
        {
            use can_uds_toolkit::hardware::socketcan::SocketCanFrameIo;
            let metrics_for_factory = metrics.clone();
            let factory = move || -> Result<MonitorPipeline<SocketCanFrameIo>, IoError> {
                if let Err(e) = setup_interface(&SystemCommands, &interface, bitrate) {
                    log::warn!("interface setup failed (continuing anyway): {e}");
                }
                let io = SocketCanFrameIo::open(&interface)?;
                Ok(build_pipeline(io, &cfg_for_factory, print_raw, metrics_for_factory.clone()))
            };
            run_with_reconnect(factory, &stop, metrics.clone())
        }
        #[cfg(not(feature = "socketcan"))]
        {
            eprintln!("built without the `socketcan` feature; pass --listen-only");
            1
        }
    };

    std::process::exit(exit_code);
}

fn build_pipeline<IO: FrameIo>(
    io: IO,
    cfg: &Option<MonitorConfig>,
    print_raw: bool,
    metrics: Arc<Metrics>,
) -> MonitorPipeline<IO> {
    let databases = build_databases(cfg);
    let mut pipeline = MonitorPipeline::new(io, databases, metrics).with_print_raw(print_raw);
    if let Some(reassembler) = build_reassembler(cfg) {
        pipeline = pipeline.with_reassembler(reassembler);
    }
    pipeline
}

