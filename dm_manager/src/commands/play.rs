//! Choreography demo (`demo`)

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use colored::*;
use dm_core::{DmError, DmResult};
use dm_library::choreography::{Choreographer, RunPath, Waveform};
use dm_library::controllers;

use super::motor::format_ids;
use super::{interrupt_flag, run_until};
use crate::Session;

/// Parameters of one demo run
#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub ids: Vec<u8>,
    pub amplitude: f64,
    pub frequency_hz: f64,
    pub waveform: Waveform,
    /// Run until Ctrl+C when `None`
    pub duration: Option<Duration>,
}

/// Enable the group, drive the waveform, then stop and disable
pub fn run_demo(session: &Session, options: &DemoOptions) -> DmResult<()> {
    let ids = session.ids_or_configured(&options.ids);
    if ids.is_empty() {
        return Err(DmError::invalid_input(
            "no motors given and none configured; pass --ids or run 'dmctl sniff --save'",
        ));
    }

    controllers::enable_all(&session.bus, &ids)?;
    let choreographer = Choreographer::new(Arc::clone(&session.bus));
    let path = choreographer.start(&ids, options.amplitude, options.frequency_hz, options.waveform)?;

    println!(
        "{} Running {} on {} ({:.2} rad/s, {:.2} Hz, {})",
        "→".cyan(),
        options.waveform.to_string().as_str().white().bold(),
        format_ids(&ids),
        options.amplitude,
        options.frequency_hz,
        match path {
            RunPath::Periodic => "periodic",
            RunPath::Fallback => "direct sends",
        }
    );
    println!("  {} Press Ctrl+C to stop", "Tip:".dimmed());

    let running = interrupt_flag();
    let mut failed = false;
    run_until(&running, options.duration, Duration::from_millis(100), || {
        if !choreographer.is_running() {
            failed = true;
            running.store(false, Ordering::SeqCst);
        }
    });

    choreographer.stop(true)?;
    if failed {
        return Err(DmError::transport(
            "choreography stopped after a send failure; motors were disabled",
        ));
    }
    println!("{} Stopped and disabled {}", "✓".green(), format_ids(&ids));
    Ok(())
}
