//! Command line tool for ATMD measurement boards.
//!
//! Subcommands:
//! - `status`: Query the board status
//! - `config` / `configure`: Read or write the acquisition configuration
//! - `start` / `stop`: Control the measurement
//! - `watch`: Follow the status with a live countdown
//! - `list`, `stats`, `save`, `delete`, `clear`: Manage stored measurements
//! - `agents`: List network agents
//! - `repl`: Send raw protocol commands interactively
//! - `deadtime`: Estimate readout deadtime (offline)
//! - `settings`: Show or save the effective connection settings

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use atmd_client::measurement::STATUS_IDLE;
use atmd_client::{
    deadtime, AtmdClient, ClientSettings, DeviceConfig, MeasurementStats, MonitorConfig,
    PollEvent, Response, StatusPoller, TimeString,
};
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::info;
use tracing_subscriber::EnvFilter;

const HISTORY_MAX_LINES: usize = 500;

/// Control tool for ATMD measurement boards
#[derive(Parser, Debug)]
#[command(name = "atmd_tool")]
#[command(about = "Configure and run measurements on an ATMD server")]
#[command(version)]
struct Args {
    /// JSON settings file (host, port, poll_interval, response_timeout)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server host name or IP, overrides the settings file
    #[arg(long, global = true)]
    host: Option<String>,

    /// Server port, overrides the settings file
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Reply timeout in seconds, overrides the settings file
    #[arg(long, global = true)]
    timeout: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Query the board status
    Status,

    /// Read the acquisition configuration
    Config {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write the acquisition configuration ("0u" leaves a time unchanged)
    Configure {
        /// Total measurement time, e.g. 10s, 5M, 1h
        #[arg(long, default_value = "0u")]
        total_time: TimeString,

        /// Start window time
        #[arg(long, default_value = "0u")]
        window_time: TimeString,

        /// Deadtime between windows
        #[arg(long, default_value = "0u")]
        deadtime: TimeString,

        /// Autosave file prefix (required with --autosave)
        #[arg(long, default_value = "")]
        prefix: String,

        /// Autosave every N starts (0 = off)
        #[arg(long, default_value = "0")]
        autosave: u32,

        /// Monitor: save every N starts
        #[arg(long, default_value = "0")]
        monitor_save: u32,

        /// Monitor: number of starts kept
        #[arg(long, default_value = "0")]
        monitor_count: u32,

        /// Monitor file name (monitor is off unless all monitor flags are set)
        #[arg(long, default_value = "")]
        monitor_file: String,

        /// Load the configuration from a JSON file instead of flags
        #[arg(long)]
        from: Option<PathBuf>,
    },

    /// Start a measurement
    Start {
        /// Set the total time before starting; the board's value is used otherwise
        #[arg(short, long)]
        duration: Option<TimeString>,

        /// Follow the countdown until the measurement finishes
        #[arg(short, long)]
        watch: bool,
    },

    /// Stop the running measurement
    Stop,

    /// Follow the board status with a live countdown
    Watch {
        /// Exit once a measurement has finished
        #[arg(long)]
        until_finished: bool,
    },

    /// List stored measurements with cumulative statistics
    List,

    /// Show statistics of a stored measurement
    Stats {
        /// Measurement number
        id: u32,

        /// One line per start instead of the cumulative line
        #[arg(long)]
        per_start: bool,
    },

    /// Save a stored measurement to a file on the server
    Save {
        /// Measurement number
        id: u32,

        /// Target file name on the server
        file: String,
    },

    /// Delete a stored measurement
    Delete {
        /// Measurement number
        id: u32,
    },

    /// Delete all stored measurements
    Clear,

    /// List network agents
    Agents,

    /// Interactive protocol REPL
    Repl,

    /// Estimate readout deadtime per window
    Deadtime {
        /// Expected count rate
        #[arg(long)]
        counts: f64,

        /// Window length, in units matching the count rate
        #[arg(long)]
        window_time: f64,

        /// Number of TDMA slots
        #[arg(long, default_value = "1")]
        tdma_slots: f64,

        /// TDMA cycle length (the result has this unit)
        #[arg(long)]
        cycle: f64,
    },

    /// Show the effective connection settings
    Settings {
        /// Write them to this JSON file
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = load_settings(&args)?;

    match args.command {
        Command::Status => cmd_status(&settings),
        Command::Config { json } => cmd_config(&settings, json),
        Command::Configure {
            total_time,
            window_time,
            deadtime,
            prefix,
            autosave,
            monitor_save,
            monitor_count,
            monitor_file,
            from,
        } => {
            let config = match from {
                Some(path) => load_device_config(&path)?,
                None => DeviceConfig {
                    total_time,
                    window_time,
                    deadtime,
                    prefix,
                    autosave,
                    monitor: Some(MonitorConfig {
                        save: monitor_save,
                        count: monitor_count,
                        filename: monitor_file,
                    }),
                    ..DeviceConfig::default()
                },
            };
            cmd_configure(&settings, &config)
        }
        Command::Start { duration, watch } => cmd_start(&settings, duration, watch),
        Command::Stop => cmd_stop(&settings),
        Command::Watch { until_finished } => {
            let client = connect(&settings)?;
            watch(client, settings.poll_interval, until_finished)
        }
        Command::List => cmd_list(&settings),
        Command::Stats { id, per_start } => cmd_stats(&settings, id, per_start),
        Command::Save { id, file } => cmd_save(&settings, id, &file),
        Command::Delete { id } => cmd_delete(&settings, id),
        Command::Clear => cmd_clear(&settings),
        Command::Agents => cmd_agents(&settings),
        Command::Repl => cmd_repl(&settings),
        Command::Deadtime {
            counts,
            window_time,
            tdma_slots,
            cycle,
        } => cmd_deadtime(counts, window_time, tdma_slots, cycle),
        Command::Settings { save } => cmd_settings(&settings, save.as_deref()),
    }
}

// ==================== Settings & Connection ====================

fn load_settings(args: &Args) -> Result<ClientSettings> {
    let mut settings = match &args.config {
        Some(path) => ClientSettings::load_from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => ClientSettings::default(),
    };

    if let Some(host) = &args.host {
        settings.host = host.clone();
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(timeout) = args.timeout {
        settings.response_timeout = parse_timeout(timeout)?;
    }

    Ok(settings)
}

fn parse_timeout(secs: f64) -> Result<Duration> {
    if secs.is_nan() || secs <= 0.0 {
        bail!("Timeout must be a positive number of seconds");
    }
    match Duration::try_from_secs_f64(secs) {
        Ok(timeout) => Ok(timeout),
        Err(e) => bail!("Timeout of {secs} seconds is out of range: {e}"),
    }
}

fn load_device_config(path: &Path) -> Result<DeviceConfig> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Invalid configuration in {}", path.display()))
}

fn connect(settings: &ClientSettings) -> Result<AtmdClient> {
    info!("Connecting to ATMD server at {}", settings.address());
    let mut client = AtmdClient::connect(settings.address())?;
    client.session_mut().set_timeout(settings.response_timeout)?;
    Ok(client)
}

fn format_stats(stats: &MeasurementStats) -> String {
    stats
        .fields()
        .iter()
        .map(|v| format!("{v:>8}"))
        .collect::<Vec<_>>()
        .join(" ")
}

const STATS_HEADER: &str =
    "  starts   win_ns     ch.1     ch.2     ch.3     ch.4     ch.5     ch.6     ch.7     ch.8";

// ==================== Status Command ====================

fn cmd_status(settings: &ClientSettings) -> Result<()> {
    let mut client = connect(settings)?;
    println!("{}", client.status()?);
    Ok(())
}

// ==================== Config Commands ====================

fn cmd_config(settings: &ClientSettings, json: bool) -> Result<()> {
    let mut client = connect(settings)?;
    let config = DeviceConfig::read_from(&mut client)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    println!("Total time:   {}", config.total_time);
    println!("Window time:  {}", config.window_time);
    println!("Deadtime:     {}", config.deadtime);
    if config.prefix.is_empty() {
        println!("Prefix:       (none)");
    } else {
        println!("Prefix:       {}", config.prefix);
    }
    println!("Autosave:     {}", config.autosave);
    match &config.monitor {
        Some(m) => println!(
            "Monitor:      save every {} starts, keep {}, file {}",
            m.save, m.count, m.filename
        ),
        None => println!("Monitor:      off"),
    }
    Ok(())
}

fn cmd_configure(settings: &ClientSettings, config: &DeviceConfig) -> Result<()> {
    let mut client = connect(settings)?;
    config.write_to(&mut client)?;
    println!("Configuration written");
    Ok(())
}

// ==================== Measurement Commands ====================

fn cmd_start(settings: &ClientSettings, duration: Option<TimeString>, follow: bool) -> Result<()> {
    let mut client = connect(settings)?;

    let duration = match duration {
        Some(d) => {
            client.set_total_time(&d)?;
            d
        }
        None => client.total_time()?,
    };

    client.start_measurement(&duration)?;
    println!("Measurement started ({duration})");

    if follow {
        watch(client, settings.poll_interval, true)?;
    }
    Ok(())
}

fn cmd_stop(settings: &ClientSettings) -> Result<()> {
    let mut client = connect(settings)?;
    client.stop_measurement()?;
    println!("Measurement stopped");
    Ok(())
}

// ==================== Watch Command ====================

fn watch(client: AtmdClient, interval: Duration, until_finished: bool) -> Result<()> {
    let client = Arc::new(Mutex::new(client));
    let poller = StatusPoller::spawn(client, interval);

    println!("Polling every {interval:?}, Ctrl+C to quit");
    for event in poller.events().iter() {
        match event {
            PollEvent::Status(update) => {
                print!("\r{:<10} {:>12}   ", update.status, update.countdown.to_string());
                io::stdout().flush()?;
                if update.finished {
                    println!();
                    println!("Measurement finished");
                    if until_finished {
                        break;
                    }
                } else if until_finished && update.status == STATUS_IDLE {
                    println!();
                    println!("No measurement running");
                    break;
                }
            }
            PollEvent::Failed(reason) => {
                println!();
                bail!("Status polling stopped: {reason}");
            }
        }
    }

    poller.stop();
    Ok(())
}

// ==================== Stored Measurement Commands ====================

fn cmd_list(settings: &ClientSettings) -> Result<()> {
    let mut client = connect(settings)?;
    let rows = client.measurement_table()?;
    if rows.is_empty() {
        println!("No stored measurements");
        return Ok(());
    }

    println!("   id {STATS_HEADER}");
    for (entry, stats) in rows {
        println!("{:>5} {}", entry.id, format_stats(&stats));
    }
    Ok(())
}

fn cmd_stats(settings: &ClientSettings, id: u32, per_start: bool) -> Result<()> {
    let mut client = connect(settings)?;
    let stats = client.measurement_stats(id, !per_start)?;

    println!("{STATS_HEADER}");
    for line in &stats {
        println!("{}", format_stats(line));
    }
    Ok(())
}

fn cmd_save(settings: &ClientSettings, id: u32, file: &str) -> Result<()> {
    let mut client = connect(settings)?;
    client.save_measurement(id, file)?;
    println!("Measurement {id} saved to {file}");
    Ok(())
}

fn cmd_delete(settings: &ClientSettings, id: u32) -> Result<()> {
    let mut client = connect(settings)?;
    client.delete_measurement(id)?;
    println!("Measurement {id} deleted");
    Ok(())
}

fn cmd_clear(settings: &ClientSettings) -> Result<()> {
    let mut client = connect(settings)?;
    client.clear_measurements()?;
    println!("All measurements deleted");
    Ok(())
}

// ==================== Agents Command ====================

fn cmd_agents(settings: &ClientSettings) -> Result<()> {
    let mut client = connect(settings)?;
    let agents = client.agents()?;
    if agents.is_empty() {
        println!("No agents");
    }
    for agent in agents {
        println!("{:>3}  {}", agent.id, agent.mac);
    }
    Ok(())
}

// ==================== REPL Command ====================

fn get_history_path() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    let config_dir = Path::new(&home).join(".config");
    std::fs::create_dir_all(&config_dir).ok()?;
    Some(config_dir.join("atmd_tool_hist.txt"))
}

fn truncate_history_file(path: &Path, max_lines: usize) {
    if let Ok(contents) = std::fs::read_to_string(path) {
        let lines: Vec<&str> = contents.lines().collect();
        if lines.len() > max_lines {
            let skip_count = lines.len() - max_lines;
            let truncated: Vec<&str> = lines.into_iter().skip(skip_count).collect();
            let _ = std::fs::write(path, truncated.join("\n") + "\n");
        }
    }
}

fn print_response(response: &Response) {
    match response {
        Response::Ack | Response::Empty => println!("OK"),
        Response::Timing { key, value } => println!("{} = {}", key.as_str(), value),
        Response::Prefix(p) if p.is_empty() => println!("PREFIX = (none)"),
        Response::Prefix(p) => println!("PREFIX = {p}"),
        Response::Autosave(n) => println!("AUTOSAVE = {n}"),
        Response::Monitor(m) => println!("MONITOR = {} {} {}", m.save, m.count, m.filename),
        Response::Agents(agents) => {
            println!("{} agent(s)", agents.len());
            for agent in agents {
                println!("{:>3}  {}", agent.id, agent.mac);
            }
        }
        Response::Status(status) => println!("{status}"),
        Response::Measurements(list) => {
            println!("{} measurement(s)", list.len());
            for entry in list {
                println!("{:>5}  {} starts", entry.id, entry.starts);
            }
        }
        Response::Statistics(stats) => println!("{}", format_stats(stats)),
        Response::StatisticsList(list) => {
            for stats in list {
                println!("{}", format_stats(stats));
            }
        }
    }
}

/// Reconnect with exponential backoff, giving up after a few attempts.
fn reconnect(settings: &ClientSettings) -> Option<AtmdClient> {
    const MAX_ATTEMPTS: u32 = 5;
    const MAX_BACKOFF_MS: u64 = 3000;
    let mut backoff_ms = 100u64;

    for attempt in 1..=MAX_ATTEMPTS {
        print!("\rReconnecting... (attempt {attempt}/{MAX_ATTEMPTS})      ");
        io::stdout().flush().ok();
        match connect(settings) {
            Ok(client) => {
                println!("\rReconnected                                  ");
                return Some(client);
            }
            Err(_) => {
                std::thread::sleep(Duration::from_millis(backoff_ms));
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
    println!();
    None
}

fn cmd_repl(settings: &ClientSettings) -> Result<()> {
    println!("Connecting to ATMD server at {}...", settings.address());
    let mut client = connect(settings)?;
    println!("Board status: {}", client.status()?);
    println!();
    println!("ATMD REPL - Enter protocol commands, 'quit' to exit");
    println!("Use Up/Down arrows for command history");
    println!("Examples: GET TT, SET TT 10s, GET AGENTS, MSR STATUS, MSR LST");
    println!();

    let mut rl = DefaultEditor::new()?;

    let history_path = get_history_path();
    if let Some(ref path) = history_path {
        truncate_history_file(path, HISTORY_MAX_LINES);
        if path.exists() {
            let _ = rl.load_history(path);
        }
    }

    loop {
        match rl.readline("> ") {
            Ok(line) => {
                let cmd = line.trim();
                if cmd.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(&line);
                if let Some(ref path) = history_path {
                    let _ = rl.save_history(path);
                }

                if cmd.eq_ignore_ascii_case("quit") || cmd.eq_ignore_ascii_case("exit") {
                    println!("Bye!");
                    break;
                }

                match client.raw(cmd) {
                    Ok(response) => print_response(&response),
                    Err(e) if e.invalidates_connection() => {
                        println!("Connection lost: {e}");
                        match reconnect(settings) {
                            Some(fresh) => client = fresh,
                            None => bail!("Could not reconnect to {}", settings.address()),
                        }
                    }
                    Err(e) => println!("Error: {e}"),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                break;
            }
            Err(ReadlineError::Eof) => {
                break;
            }
            Err(err) => {
                println!("Error: {err}");
                break;
            }
        }
    }

    Ok(())
}

// ==================== Deadtime Command ====================

fn cmd_deadtime(counts: f64, window_time: f64, tdma_slots: f64, cycle: f64) -> Result<()> {
    match deadtime::estimate(counts, window_time, tdma_slots, cycle) {
        Some(dt) => println!("Deadtime: {dt:.1}"),
        None => println!("Deadtime: n.a."),
    }
    Ok(())
}

// ==================== Settings Command ====================

fn cmd_settings(settings: &ClientSettings, save: Option<&Path>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    if let Some(path) = save {
        settings
            .save_to_file(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved to {}", path.display());
    }
    Ok(())
}
