//! Posture Agent CLI
//!
//! Keeps a session to the posture corrector open and records daily posture
//! statistics.

use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use crossbeam_channel::unbounded;
use posture_agent::{
    activity::{create_shared_log_with_persistence, ActivityLog, SharedActivityLog},
    config::Config,
    device::{
        ConnectionSession, ConnectionState, PeripheralProfile, PostureEvent, PostureScript,
        SimulatedTransport, Transport,
    },
    stats::{
        report, ExportFormat, JsonFileStore, PostureAggregator, DEFAULT_HISTORY_DAYS,
        MAX_HISTORY_DAYS,
    },
    VERSION,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Address used when `--simulate` runs without a configured device.
const SIMULATED_ADDRESS: &str = "D4:D4:DA:44:28:86";

const PUMP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "posture-agent")]
#[command(version = VERSION)]
#[command(about = "Records daily posture statistics from a BLE posture corrector", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the posture corrector and record statistics until Ctrl+C
    Start {
        /// Device address (overrides the configured one)
        #[arg(long)]
        address: Option<String>,

        /// Use a simulated peripheral instead of Bluetooth
        #[arg(long)]
        simulate: bool,

        /// Bluetooth adapter to use (requires ble feature)
        #[arg(long)]
        adapter: Option<String>,
    },

    /// Show today's statistics and agent activity
    Status,

    /// Show stretched time for the last days
    History {
        /// Number of days to show, ending today
        #[arg(
            long,
            default_value_t = DEFAULT_HISTORY_DAYS,
            value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_HISTORY_DAYS))
        )]
        days: u32,
    },

    /// Remember the posture corrector's address
    SetDevice {
        /// Address such as D4:D4:DA:44:28:86
        address: String,
    },

    /// Show configuration
    Config,

    /// Export all recorded day statistics
    Export {
        /// Output file (stdout when omitted)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Export format
        #[arg(long, value_enum, default_value = "json")]
        format: ExportFormat,
    },
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            address,
            simulate,
            adapter,
        } => {
            cmd_start(address, simulate, adapter);
        }
        Commands::Status => {
            cmd_status();
        }
        Commands::History { days } => {
            cmd_history(days);
        }
        Commands::SetDevice { address } => {
            cmd_set_device(&address);
        }
        Commands::Config => {
            cmd_config();
        }
        Commands::Export { output, format } => {
            cmd_export(output, format);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("posture_agent=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config() -> Config {
    match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Could not load config, using defaults: {e}");
            Config::default()
        }
    }
}

fn open_store(config: &Config) -> JsonFileStore {
    match JsonFileStore::open(config.statistics_path()) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error opening statistics: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_start(address: Option<String>, simulate: bool, adapter: Option<String>) {
    println!("Posture Agent v{VERSION}");
    println!();

    let mut config = load_config();
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }
    if adapter.is_some() {
        config.adapter = adapter;
    }

    let activity = create_shared_log_with_persistence(config.activity_path());
    let store = open_store(&config);
    let aggregator = PostureAggregator::new(store).with_activity_log(activity.clone());

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    #[cfg(not(feature = "ble"))]
    let simulate = {
        if !simulate {
            eprintln!("Warning: built without the ble feature, using the simulated peripheral");
        }
        if config.adapter.is_some() {
            eprintln!("Warning: --adapter ignored (ble feature not enabled at compile time)");
        }
        true
    };

    let address = address
        .or_else(|| config.device_address.clone())
        .or_else(|| simulate.then(|| SIMULATED_ADDRESS.to_string()));
    let Some(address) = address else {
        eprintln!("Error: No device address configured.");
        eprintln!("Run 'posture-agent set-device <address>' or pass --address.");
        std::process::exit(1);
    };

    if simulate {
        let transport = SimulatedTransport::new(PeripheralProfile::default());
        let peripheral = transport.peripheral();
        peripheral.set_value(b"ok");

        println!("  Device: {address} (simulated)");
        println!(
            "  Posture change every {}s, {:.0}% hunched",
            config.simulation.interval.as_secs(),
            config.simulation.hunched_ratio * 100.0
        );
        let _script = PostureScript::start(
            peripheral,
            config.simulation.interval,
            config.simulation.hunched_ratio,
        );
        run_session(transport, &address, aggregator, &activity, &running);
    } else {
        #[cfg(feature = "ble")]
        {
            use posture_agent::device::{BtleSettings, BtleTransport};

            let settings = BtleSettings {
                adapter: config.adapter.clone(),
                scan_timeout: config.scan_timeout,
            };
            let transport = match BtleTransport::new(settings) {
                Ok(transport) => transport,
                Err(e) => {
                    eprintln!("Error initialising Bluetooth: {e}");
                    std::process::exit(1);
                }
            };
            println!("  Device: {address}");
            println!("  Scan timeout: {}s", config.scan_timeout.as_secs());
            run_session(transport, &address, aggregator, &activity, &running);
        }
    }

    if let Err(e) = activity.save() {
        eprintln!("Warning: Could not save activity log: {e}");
    }

    println!();
    println!("{}", activity.summary());
}

/// Run one session until Ctrl+C or link loss, feeding every event to the
/// aggregator.
fn run_session<T: Transport>(
    transport: T,
    address: &str,
    mut aggregator: PostureAggregator<JsonFileStore>,
    activity: &SharedActivityLog,
    running: &AtomicBool,
) {
    let mut session = ConnectionSession::new(transport).with_activity_log(activity.clone());
    let (tx, rx) = unbounded();

    if let Err(e) = session.connect(address, tx) {
        eprintln!("Error connecting to {address}: {e}");
        return;
    }

    if let Some(device) = session.address() {
        println!("  Connecting to {device} via {}", session.transport().name());
    }
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let handle = |event: PostureEvent, aggregator: &mut PostureAggregator<JsonFileStore>| {
        print_event(event);
        if let Err(e) = aggregator.handle_event(event) {
            eprintln!("Warning: Could not record posture interval: {e}");
        }
    };

    let mut degraded_reported = false;
    while running.load(Ordering::SeqCst) {
        session.pump(PUMP_INTERVAL);
        for event in rx.try_iter() {
            handle(event, &mut aggregator);
        }

        if session.is_degraded() && !degraded_reported {
            eprintln!("Warning: Connected, but the posture characteristic is unavailable.");
            degraded_reported = true;
        }
        if session.state() == ConnectionState::Disconnected {
            println!("Connection lost.");
            break;
        }
    }

    println!();
    println!("Stopping...");
    if let Some(posture) = aggregator.current_posture() {
        println!("Closing open {posture} interval");
    }
    session.disconnect();
    for event in rx.try_iter() {
        handle(event, &mut aggregator);
    }

    let today = Local::now().date_naive();
    match report::today(aggregator.store(), today) {
        Ok(stat) => {
            println!();
            println!("{}", report::format_summary(&stat));
        }
        Err(e) => eprintln!("Warning: Could not read today's statistics: {e}"),
    }
}

fn print_event(event: PostureEvent) {
    let time = Local::now().format("%H:%M:%S");
    match event {
        PostureEvent::Connected => println!("[{time}] Connected"),
        PostureEvent::PostureChanged(posture) => println!("[{time}] Posture: {posture}"),
        PostureEvent::SessionEnded => {}
        PostureEvent::Disconnected => println!("[{time}] Disconnected"),
    }
}

fn cmd_status() {
    let config = load_config();

    println!("Posture Agent Status");
    println!("====================");
    println!();

    println!("Configuration:");
    println!(
        "  Device: {}",
        config.device_address.as_deref().unwrap_or("not set")
    );
    println!(
        "  Adapter: {}",
        config.adapter.as_deref().unwrap_or("default")
    );
    println!(
        "  Bluetooth support: {}",
        if cfg!(feature = "ble") {
            "enabled"
        } else {
            "disabled (simulation only)"
        }
    );
    println!();

    let store = open_store(&config);
    match report::today(&store, Local::now().date_naive()) {
        Ok(stat) => println!("{}", report::format_summary(&stat)),
        Err(e) => eprintln!("Error reading statistics: {e}"),
    }
    println!();

    if config.activity_path().exists() {
        let log = ActivityLog::with_persistence(config.activity_path());
        let stats = log.stats();
        println!("Cumulative Activity:");
        println!("  Sessions started: {}", stats.sessions);
        println!("  Payloads received: {}", stats.payloads_received);
        println!("  Payloads dropped: {}", stats.payloads_dropped);
        println!("  Posture changes: {}", stats.posture_changes);
        println!("  Records written: {}", stats.records_written);
    } else {
        println!("No previous session data found.");
    }
}

fn cmd_history(days: u32) {
    let config = load_config();
    let store = open_store(&config);

    match report::history(&store, Local::now().date_naive(), days) {
        Ok(days) => print!("{}", report::format_history(&days)),
        Err(e) => {
            eprintln!("Error reading statistics: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_set_device(address: &str) {
    let mut config = load_config();
    let parsed = match config.set_device_address(address) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.save() {
        eprintln!("Error saving config: {e}");
        std::process::exit(1);
    }
    println!("Device set to {parsed}");
}

fn cmd_config() {
    let config = load_config();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!("Statistics: {:?}", config.statistics_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );
}

fn cmd_export(output: Option<PathBuf>, format: ExportFormat) {
    let config = load_config();
    let store = open_store(&config);

    let content = match report::export(&store, format) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Error exporting statistics: {e}");
            std::process::exit(1);
        }
    };

    let Some(output) = output else {
        print!("{content}");
        return;
    };

    let output = if output.is_dir() {
        let extension = match format {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        };
        output.join(format!(
            "posture_{}.{extension}",
            Utc::now().format("%Y%m%d_%H%M%S")
        ))
    } else {
        output
    };

    match std::fs::write(&output, content) {
        Ok(_) => println!("Exported to {output:?}"),
        Err(e) => eprintln!("Error writing export: {e}"),
    }
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) {
    if let Err(e) = ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    }) {
        eprintln!("Warning: Could not set Ctrl+C handler: {e}");
    }
}
