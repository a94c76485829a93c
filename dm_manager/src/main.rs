use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use dm_core::config::WatchdogConfig;
use dm_core::DmResult;
use dm_library::choreography::Waveform;
use dm_library::discovery::DEFAULT_PROBE_DURATION;
use dm_library::protocol::params::ControlMode;
use dm_library::protocol::MitTarget;
use tracing_subscriber::EnvFilter;

use dm_manager::commands::motor::MotorAction;
use dm_manager::commands::{
    self, config, discover, flatten_ids, motor, param, play, stats, watch, IdList,
};
use dm_manager::{Session, SessionOptions};

#[derive(Parser)]
#[command(name = "dmctl")]
#[command(about = "Discover, command and monitor Damiao DM servos on a CAN bus")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(propagate_version = true)]
struct Cli {
    /// CAN interface (defaults to the first configured bus)
    #[arg(short = 'c', long = "channel", global = true)]
    channel: Option<String>,

    /// Use the in-process simulated bus instead of SocketCAN
    #[arg(long = "sim", global = true)]
    sim: bool,

    /// Configuration file (defaults to ~/.config/dm_tui/config.yaml)
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for feedback without transmitting
    Sniff {
        /// Listening time in seconds
        #[arg(short = 'd', long = "duration", default_value_t = 1.0)]
        duration: f64,

        /// Write discovered motors to the config
        #[arg(long = "save")]
        save: bool,
    },

    /// Send disable + zero velocity to candidate ids and record who answers
    Probe {
        /// Candidate ESC ids, e.g. "1-8" or "1,3,0x0A"
        #[arg(default_value = "1-16")]
        ids: IdList,

        /// Wait per candidate in milliseconds
        #[arg(short = 't', long = "timeout", default_value_t = DEFAULT_PROBE_DURATION.as_millis() as u64)]
        timeout_ms: u64,

        /// Write discovered motors to the config
        #[arg(long = "save")]
        save: bool,
    },

    /// Enable motors (all configured motors if no ids are given)
    Enable {
        ids: Vec<IdList>,
    },

    /// Disable motors (all configured motors if no ids are given)
    Disable {
        ids: Vec<IdList>,
    },

    /// Set the current position as mechanical zero
    Zero {
        ids: Vec<IdList>,
    },

    /// Command zero velocity
    Brake {
        ids: Vec<IdList>,
    },

    /// Velocity setpoint (position-velocity mode with --position)
    Velocity {
        #[arg(value_parser = commands::parse_esc_id)]
        esc_id: u8,

        /// Target velocity [rad/s]
        #[arg(allow_negative_numbers = true)]
        velocity: f64,

        /// Target position [rad]
        #[arg(short = 'p', long = "position", allow_negative_numbers = true)]
        position: Option<f64>,

        /// Wait for and print feedback (milliseconds, 0 to skip)
        #[arg(long = "feedback", default_value_t = 100)]
        feedback_ms: u64,
    },

    /// MIT impedance setpoint
    Mit {
        #[arg(value_parser = commands::parse_esc_id)]
        esc_id: u8,

        /// Target position [rad]
        #[arg(short = 'p', long = "position", default_value_t = 0.0, allow_negative_numbers = true)]
        position: f64,

        /// Target velocity [rad/s]
        #[arg(short = 'v', long = "velocity", default_value_t = 0.0, allow_negative_numbers = true)]
        velocity: f64,

        /// Feed-forward torque [Nm]
        #[arg(short = 't', long = "torque", default_value_t = 0.0, allow_negative_numbers = true)]
        torque: f64,

        #[arg(long = "kp", default_value_t = 0.0)]
        kp: f64,

        #[arg(long = "kd", default_value_t = 0.0)]
        kd: f64,

        /// Wait for and print feedback (milliseconds, 0 to skip)
        #[arg(long = "feedback", default_value_t = 100)]
        feedback_ms: u64,
    },

    /// Read a register (e.g. 0x15 for P_MAX)
    ReadParam {
        #[arg(value_parser = commands::parse_esc_id)]
        esc_id: u8,

        #[arg(value_parser = commands::parse_rid)]
        rid: u8,

        /// Response deadline in milliseconds
        #[arg(short = 't', long = "timeout", default_value_t = 500)]
        timeout_ms: u64,
    },

    /// Read P_MAX / V_MAX / T_MAX
    Limits {
        #[arg(value_parser = commands::parse_esc_id)]
        esc_id: u8,

        /// Response deadline per register in milliseconds
        #[arg(short = 't', long = "timeout", default_value_t = 500)]
        timeout_ms: u64,

        /// Store the limits on the configured motor
        #[arg(long = "save")]
        save: bool,
    },

    /// Re-address a motor and persist the new ids to its flash
    AssignIds {
        /// Current ESC id
        #[arg(value_parser = commands::parse_esc_id)]
        current: u8,

        /// New ESC id (1..=127)
        #[arg(value_parser = commands::parse_esc_id)]
        esc_id: u8,

        /// New feedback (MST) id
        #[arg(value_parser = commands::parse_mst_id)]
        mst_id: u16,

        /// Control mode: mit, pos-vel or vel
        #[arg(short = 'm', long = "mode", default_value = "vel")]
        mode: ControlMode,
    },

    /// Drive a group with a sine-wave velocity pattern
    Demo {
        /// Motor ids (all configured motors if omitted)
        #[arg(long = "ids")]
        ids: Option<IdList>,

        /// Peak velocity [rad/s]
        #[arg(short = 'a', long = "amplitude", default_value_t = 1.0)]
        amplitude: f64,

        /// Frequency [Hz]
        #[arg(short = 'f', long = "frequency", default_value_t = 0.5)]
        frequency: f64,

        /// sine, antiphase or figure-8
        #[arg(short = 'm', long = "mode", default_value = "sine")]
        mode: Waveform,

        /// Stop after this many seconds
        #[arg(short = 'd', long = "duration")]
        duration: Option<f64>,
    },

    /// Live telemetry with the stale-feedback watchdog
    Watch {
        /// Append samples to a CSV file
        #[arg(long = "csv")]
        csv: Option<PathBuf>,

        /// Watchdog staleness threshold in milliseconds
        #[arg(long = "threshold")]
        threshold_ms: Option<u64>,

        /// Minimum time between repeated disables in milliseconds
        #[arg(long = "cooldown")]
        cooldown_ms: Option<u64>,

        /// Run without the watchdog
        #[arg(long = "no-watchdog")]
        no_watchdog: bool,

        /// Stop after this many seconds
        #[arg(short = 'd', long = "duration")]
        duration: Option<f64>,
    },

    /// Interface state and error counters
    Stats {
        /// Output as JSON
        #[arg(long = "json")]
        json: bool,
    },

    /// Configuration file management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Sniff { .. } => "sniff",
            Commands::Probe { .. } => "probe",
            Commands::Enable { .. } => "enable",
            Commands::Disable { .. } => "disable",
            Commands::Zero { .. } => "zero",
            Commands::Brake { .. } => "brake",
            Commands::Velocity { .. } => "velocity",
            Commands::Mit { .. } => "mit",
            Commands::ReadParam { .. } => "read-param",
            Commands::Limits { .. } => "limits",
            Commands::AssignIds { .. } => "assign-ids",
            Commands::Demo { .. } => "demo",
            Commands::Watch { .. } => "watch",
            Commands::Stats { .. } => "stats",
            Commands::Config { .. } => "config",
        }
    }
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration
    Init {
        /// Overwrite an existing file
        #[arg(short = 'f', long = "force")]
        force: bool,
    },

    /// List configuration files
    List,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let options = SessionOptions {
        channel: cli.channel,
        simulation: cli.sim,
        config_path: cli.config,
    };
    tracing::debug!("dmctl {:?}", options);

    if let Err(e) = run(cli.command, &options) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(command: Commands, options: &SessionOptions) -> anyhow::Result<()> {
    let name = command.name();
    run_command(command, options).with_context(|| format!("dmctl {} failed", name))
}

fn optional_seconds(value: Option<f64>) -> DmResult<Option<Duration>> {
    value.map(commands::seconds).transpose()
}

fn run_command(command: Commands, options: &SessionOptions) -> DmResult<()> {
    let config_path = options.config_path.as_deref();
    match command {
        Commands::Config { command } => match command {
            ConfigCommands::Show => config::run_show(config_path),
            ConfigCommands::Init { force } => {
                config::run_init(config_path, options.channel.as_deref(), force)
            }
            ConfigCommands::List => config::run_list(config_path),
        },

        Commands::Stats { json } => {
            let loaded = dm_core::config::load_config(config_path)?;
            let channel = dm_manager::session::resolve_bus(&loaded, options).channel;
            stats::run_stats(&channel, json)
        }

        Commands::Sniff { duration, save } => {
            let mut session = Session::open(options)?;
            discover::run_sniff(&mut session, commands::seconds(duration)?, save)
        }

        Commands::Probe {
            ids,
            timeout_ms,
            save,
        } => {
            let mut session = Session::open(options)?;
            discover::run_probe(&mut session, &ids.0, Duration::from_millis(timeout_ms), save)
        }

        Commands::Enable { ids } => {
            motor::run_action(&Session::open(options)?, MotorAction::Enable, &flatten_ids(&ids))
        }
        Commands::Disable { ids } => {
            motor::run_action(&Session::open(options)?, MotorAction::Disable, &flatten_ids(&ids))
        }
        Commands::Zero { ids } => {
            motor::run_action(&Session::open(options)?, MotorAction::Zero, &flatten_ids(&ids))
        }
        Commands::Brake { ids } => {
            motor::run_action(&Session::open(options)?, MotorAction::Brake, &flatten_ids(&ids))
        }

        Commands::Velocity {
            esc_id,
            velocity,
            position,
            feedback_ms,
        } => motor::run_velocity(
            &Session::open(options)?,
            esc_id,
            velocity,
            position,
            Duration::from_millis(feedback_ms),
        ),

        Commands::Mit {
            esc_id,
            position,
            velocity,
            torque,
            kp,
            kd,
            feedback_ms,
        } => motor::run_mit(
            &Session::open(options)?,
            esc_id,
            MitTarget::new(position, velocity, torque, kp, kd),
            Duration::from_millis(feedback_ms),
        ),

        Commands::ReadParam {
            esc_id,
            rid,
            timeout_ms,
        } => param::run_read_param(
            &Session::open(options)?,
            esc_id,
            rid,
            Duration::from_millis(timeout_ms),
        ),

        Commands::Limits {
            esc_id,
            timeout_ms,
            save,
        } => param::run_limits(
            &mut Session::open(options)?,
            esc_id,
            Duration::from_millis(timeout_ms),
            save,
        ),

        Commands::AssignIds {
            current,
            esc_id,
            mst_id,
            mode,
        } => param::run_assign_ids(&mut Session::open(options)?, current, esc_id, mst_id, mode),

        Commands::Demo {
            ids,
            amplitude,
            frequency,
            mode,
            duration,
        } => play::run_demo(
            &Session::open(options)?,
            &play::DemoOptions {
                ids: ids.map(|l| l.0).unwrap_or_default(),
                amplitude,
                frequency_hz: frequency,
                waveform: mode,
                duration: optional_seconds(duration)?,
            },
        ),

        Commands::Watch {
            csv,
            threshold_ms,
            cooldown_ms,
            no_watchdog,
            duration,
        } => {
            let session = Session::open(options)?;
            let watchdog = if threshold_ms.is_some() || cooldown_ms.is_some() {
                let base = session.config.watchdog;
                Some(WatchdogConfig::new(
                    Duration::from_millis(threshold_ms.unwrap_or(base.threshold_ms)),
                    Duration::from_millis(cooldown_ms.unwrap_or(base.cooldown_ms)),
                    base.interval(),
                )?)
            } else {
                None
            };
            watch::run_watch(
                &session,
                &watch::WatchOptions {
                    csv,
                    watchdog,
                    no_watchdog,
                    duration: optional_seconds(duration)?,
                },
            )
        }
    }
}
