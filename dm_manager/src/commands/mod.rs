//! `dmctl` subcommand implementations
//!
//! Each `run_*` function takes an opened [`Session`](crate::Session) (or the
//! session options for commands that never touch the bus) and prints its
//! result to the terminal.

pub mod config;
pub mod discover;
pub mod motor;
pub mod param;
pub mod play;
pub mod stats;
pub mod watch;

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dm_core::{DmError, DmResult};

/// Parse a decimal or `0x`-prefixed hexadecimal id
pub fn parse_id(value: &str) -> Result<u32, String> {
    let value = value.trim();
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };
    parsed.map_err(|_| format!("'{}' is not a valid id", value))
}

/// ESC id argument (`1`, `0x0A`, ...)
pub fn parse_esc_id(value: &str) -> Result<u8, String> {
    let id = parse_id(value)?;
    u8::try_from(id).map_err(|_| format!("ESC id {} does not fit in 8 bits", id))
}

/// Register id argument
pub fn parse_rid(value: &str) -> Result<u8, String> {
    let id = parse_id(value)?;
    u8::try_from(id).map_err(|_| format!("register id {} does not fit in 8 bits", id))
}

/// Standard-frame address argument
pub fn parse_mst_id(value: &str) -> Result<u16, String> {
    let id = parse_id(value)?;
    if id > 0x7FF {
        return Err(format!("MST id 0x{:X} is outside the 11-bit range", id));
    }
    Ok(id as u16)
}

/// Expand id lists such as `1,2,5-8` into ESC ids
pub fn parse_id_list(value: &str) -> Result<Vec<u8>, String> {
    let mut ids = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start = parse_esc_id(start)?;
                let end = parse_esc_id(end)?;
                if start > end {
                    return Err(format!("range {} is reversed", part));
                }
                ids.extend(start..=end);
            }
            None => ids.push(parse_esc_id(part)?),
        }
    }
    if ids.is_empty() {
        return Err("no ids given".to_string());
    }
    Ok(ids)
}

/// Parsed id list argument
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdList(pub Vec<u8>);

impl FromStr for IdList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_id_list(s).map(IdList)
    }
}

/// Concatenate repeated id list arguments
pub fn flatten_ids(lists: &[IdList]) -> Vec<u8> {
    lists.iter().flat_map(|l| l.0.iter().copied()).collect()
}

/// Seconds as a `Duration`, rejecting negative or non-finite values
pub fn seconds(value: f64) -> DmResult<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(DmError::invalid_input(format!(
            "duration must be a non-negative number of seconds, got {}",
            value
        )));
    }
    Ok(Duration::from_secs_f64(value))
}

/// Flag cleared by Ctrl+C
pub fn interrupt_flag() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }) {
        log::warn!("Failed to install Ctrl+C handler: {}", e);
    }
    running
}

/// Block until `running` is cleared or `limit` elapses, calling `tick` every `period`
pub fn run_until<F>(running: &AtomicBool, limit: Option<Duration>, period: Duration, mut tick: F)
where
    F: FnMut(),
{
    let deadline = limit.map(|l| Instant::now() + l);
    let mut next_tick = Instant::now() + period;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if deadline.map_or(false, |d| now >= d) {
            break;
        }
        if now >= next_tick {
            tick();
            next_tick = now + period;
        }
        thread::sleep(Duration::from_millis(20));
    }
}
