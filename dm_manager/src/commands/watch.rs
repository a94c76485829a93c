//! Live telemetry with the stale-feedback watchdog (`watch`)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use colored::*;
use dm_core::config::WatchdogConfig;
use dm_core::DmResult;
use dm_library::protocol;
use dm_library::telemetry::CsvTelemetrySink;
use dm_library::{TelemetryIngest, Watchdog, WatchdogRunner, WatchdogState};

use super::{interrupt_flag, run_until};
use crate::Session;

const REFRESH_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Append every feedback sample to this CSV file
    pub csv: Option<PathBuf>,
    /// Override the configured watchdog timing
    pub watchdog: Option<WatchdogConfig>,
    /// Disable the watchdog entirely
    pub no_watchdog: bool,
    /// Run until Ctrl+C when `None`
    pub duration: Option<Duration>,
}

/// Stream feedback, print a status table every second and let the watchdog
/// disable motors that go quiet
pub fn run_watch(session: &Session, options: &WatchOptions) -> DmResult<()> {
    if !session.config.motors.is_empty() {
        let filters = protocol::build_filters(
            session.config.motors.iter().map(|m| m.mst_id as u32),
        );
        if let Err(e) = session.bus.set_filters(filters) {
            log::warn!("Could not install acceptance filters: {}", e);
        }
    }

    let ingest = Arc::new(TelemetryIngest::from_config(&session.config));
    if let Some(path) = &options.csv {
        ingest.add_sink(Arc::new(CsvTelemetrySink::open(path)?));
        println!("{} Logging telemetry to {}", "→".cyan(), path.display());
    }
    ingest.attach(&session.bus);

    let runner = if options.no_watchdog {
        None
    } else {
        let config = options.watchdog.unwrap_or(session.config.watchdog);
        let watchdog = Arc::new(Watchdog::new(
            config,
            Arc::clone(ingest.liveness()),
            Arc::clone(ingest.telemetry()),
        )?);
        Some((
            Arc::clone(&watchdog),
            WatchdogRunner::spawn(watchdog, Arc::clone(&session.bus))?,
        ))
    };

    println!(
        "{} Watching {} (Ctrl+C to stop)",
        "→".cyan(),
        session.bus.channel().white().bold()
    );

    let running = interrupt_flag();
    run_until(&running, options.duration, REFRESH_PERIOD, || {
        let states = runner
            .as_ref()
            .map(|(watchdog, _)| watchdog.snapshot())
            .unwrap_or_default();
        print_table(&ingest, &states);
    });

    if let Some((_, runner)) = runner {
        runner.stop();
    }
    Ok(())
}

fn print_table(ingest: &TelemetryIngest, states: &[(u8, WatchdogState)]) {
    let now = Instant::now();
    println!();
    println!(
        "  {:<6} {:<6} {:>9} {:>10} {:>9} {:>6} {:>6} {:>7}  {}",
        "ESC".dimmed(),
        "MST".dimmed(),
        "POS rad".dimmed(),
        "VEL rad/s".dimmed(),
        "TRQ Nm".dimmed(),
        "MOS°C".dimmed(),
        "ROT°C".dimmed(),
        "AGE ms".dimmed(),
        "STATE".dimmed()
    );

    let samples = ingest.telemetry().snapshot();
    if samples.is_empty() {
        println!("  {}", "no feedback yet".yellow());
        return;
    }
    for sample in samples {
        let fb = &sample.engineering;
        let age = now.saturating_duration_since(sample.timestamp).as_millis();
        let tripped = states
            .iter()
            .any(|(esc_id, state)| *esc_id == fb.esc_id && state.tripped);
        let state = if tripped {
            "TRIPPED".red().bold()
        } else {
            "ok".green()
        };
        println!(
            "  {:<6} {:<6} {:>9.3} {:>10.3} {:>9.3} {:>6.0} {:>6.0} {:>7}  {}",
            format!("0x{:02X}", fb.esc_id),
            format!("0x{:03X}", sample.mst_id),
            fb.position_rad,
            fb.velocity_rad_s,
            fb.torque_nm,
            fb.temp_mos_c,
            fb.temp_rotor_c,
            age,
            state
        );
    }
}
