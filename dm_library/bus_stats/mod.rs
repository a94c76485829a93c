//! CAN interface statistics
//!
//! Reads `ip -details -statistics link show <channel>` and extracts the
//! fields an operator cares about: link state, controller error state,
//! bitrate, bus-error counters and the RX/TX counter tables.

use std::collections::BTreeMap;
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;

use dm_core::error::{DmError, DmResult};

use crate::discovery::SweepGuard;

static CAN_STATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"state\s+([A-Z-]+)").expect("static regex"));
static BERR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"tx\s+(\d+)\s+rx\s+(\d+)").expect("static regex"));
static BITRATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"bitrate\s+(\d+)").expect("static regex"));

/// Parsed interface statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStatistics {
    /// Link operational state (`UP`, `DOWN`, ...)
    pub oper_state: Option<String>,
    pub tx_queue_len: Option<u64>,
    /// CAN controller state (`ERROR-ACTIVE`, `BUS-OFF`, ...)
    pub state: Option<String>,
    pub bitrate: Option<u64>,
    /// Bus-error counters
    pub berr_tx: Option<u64>,
    pub berr_rx: Option<u64>,
    /// RX table keyed by lower-cased label (`bytes`, `packets`, `errors`, ...)
    pub rx: BTreeMap<String, u64>,
    pub tx: BTreeMap<String, u64>,
    /// Unparsed command output
    pub raw: String,
}

impl BusStatistics {
    pub fn rx_counter(&self, label: &str) -> Option<u64> {
        self.rx.get(label).copied()
    }

    pub fn tx_counter(&self, label: &str) -> Option<u64> {
        self.tx.get(label).copied()
    }
}

fn parse_counters(labels: &str, values: &str) -> BTreeMap<String, u64> {
    labels
        .split_whitespace()
        .zip(values.split_whitespace())
        .filter_map(|(label, value)| match value.parse::<u64>() {
            Ok(v) => Some((label.to_lowercase(), v)),
            Err(_) => {
                log::debug!("Skipping non-numeric counter {}={}", label, value);
                None
            }
        })
        .collect()
}

/// Parse the output of `ip -details -statistics link show`
pub fn parse_bus_statistics(output: &str) -> BusStatistics {
    let mut stats = BusStatistics {
        raw: output.trim().to_string(),
        ..Default::default()
    };
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    for (index, line) in lines.iter().enumerate() {
        let next = lines.get(index + 1).copied().unwrap_or("");

        if line.contains(':') && line.contains("state") && line.contains(" qlen ") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let after = |key: &str| {
                parts
                    .iter()
                    .position(|p| *p == key)
                    .and_then(|i| parts.get(i + 1))
                    .copied()
            };
            stats.oper_state = after("state").map(str::to_string);
            stats.tx_queue_len = after("qlen").and_then(|v| v.parse().ok());
        } else if line.starts_with("can ") && line.contains("state") {
            if stats.state.is_none() {
                stats.state = CAN_STATE.captures(line).map(|c| c[1].to_string());
            }
            if let Some(c) = BERR.captures(line) {
                stats.berr_tx = c[1].parse().ok();
                stats.berr_rx = c[2].parse().ok();
            }
        } else if line.starts_with("bitrate") {
            stats.bitrate = BITRATE.captures(line).and_then(|c| c[1].parse().ok());
        } else if let Some(labels) = line.strip_prefix("RX:") {
            stats.rx.extend(parse_counters(labels, next));
        } else if let Some(labels) = line.strip_prefix("TX:") {
            stats.tx.extend(parse_counters(labels, next));
        }
    }

    stats
}

/// Run `ip` for `channel` and parse its output
pub fn read_bus_statistics(channel: &str) -> DmResult<BusStatistics> {
    let output = Command::new("ip")
        .args(["-details", "-statistics", "link", "show", channel])
        .output()
        .map_err(|e| DmError::CommandFailed(format!("failed to run ip: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("ip exited with {}", output.status)
        } else {
            stderr
        };
        return Err(DmError::CommandFailed(message));
    }

    Ok(parse_bus_statistics(&String::from_utf8_lossy(&output.stdout)))
}

/// Cached statistics refreshed by at most one caller at a time
pub struct BusStatsService {
    channel: String,
    refreshing: Arc<AtomicBool>,
    latest: RwLock<Option<BusStatistics>>,
}

impl BusStatsService {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            refreshing: Arc::new(AtomicBool::new(false)),
            latest: RwLock::new(None),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Refresh with `reader`; `Ok(None)` when another refresh is in flight
    pub fn refresh_with<F>(&self, reader: F) -> DmResult<Option<BusStatistics>>
    where
        F: FnOnce(&str) -> DmResult<BusStatistics>,
    {
        let Some(_guard) = SweepGuard::try_acquire(&self.refreshing) else {
            log::debug!("Statistics refresh for {} already running", self.channel);
            return Ok(None);
        };
        let stats = reader(&self.channel)?;
        *self.latest.write() = Some(stats.clone());
        Ok(Some(stats))
    }

    pub fn refresh(&self) -> DmResult<Option<BusStatistics>> {
        self.refresh_with(read_bus_statistics)
    }

    pub fn latest(&self) -> Option<BusStatistics> {
        self.latest.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
4: canB: <NOARP,UP,LOWER_UP> mtu 72 qdisc noop state UP mode DEFAULT group default qlen 1000
    link/can  promiscuity 0
    can state ERROR-ACTIVE (berr-counter tx 1 rx 2) restart-ms 0
          bitrate 1000000 sample-point 0.875
          tq 125 prop-seg 6 phase-seg1 7 phase-seg2 2 sjw 1
    RX: bytes  packets  errors  dropped overrun mcast
    10         3        0       0       0      0
    TX: bytes  packets  errors  dropped carrier collsns
    5          2        1       0       0       0
";

    #[test]
    fn test_parse_extracts_key_fields() {
        let stats = parse_bus_statistics(SAMPLE);
        assert_eq!(stats.oper_state.as_deref(), Some("UP"));
        assert_eq!(stats.state.as_deref(), Some("ERROR-ACTIVE"));
        assert_eq!(stats.bitrate, Some(1_000_000));
        assert_eq!(stats.berr_tx, Some(1));
        assert_eq!(stats.berr_rx, Some(2));
        assert_eq!(stats.tx_queue_len, Some(1000));
        assert_eq!(stats.rx_counter("packets"), Some(3));
        assert_eq!(stats.rx_counter("bytes"), Some(10));
        assert_eq!(stats.tx_counter("packets"), Some(2));
        assert_eq!(stats.tx_counter("errors"), Some(1));
        assert_eq!(stats.tx_counter("collsns"), Some(0));
        assert!(stats.raw.starts_with("4: canB"));
    }

    #[test]
    fn test_parse_empty_output() {
        let stats = parse_bus_statistics("");
        assert_eq!(stats, BusStatistics::default());
    }

    #[test]
    fn test_service_caches_latest() {
        let service = BusStatsService::new("canB");
        assert!(service.latest().is_none());

        let stats = service
            .refresh_with(|channel| {
                assert_eq!(channel, "canB");
                Ok(parse_bus_statistics(SAMPLE))
            })
            .unwrap()
            .unwrap();
        assert_eq!(stats.bitrate, Some(1_000_000));
        assert_eq!(service.latest(), Some(stats));
    }

    #[test]
    fn test_service_single_flight() {
        let service = BusStatsService::new("canB");
        let nested = service
            .refresh_with(|_| {
                let inner = service.refresh_with(|_| Ok(BusStatistics::default()));
                assert!(matches!(inner, Ok(None)));
                Ok(BusStatistics::default())
            })
            .unwrap();
        assert!(nested.is_some());
    }

    #[test]
    fn test_service_error_releases_guard() {
        let service = BusStatsService::new("canB");
        let err = service.refresh_with(|_| Err(DmError::CommandFailed("no such device".into())));
        assert!(err.is_err());
        assert!(service
            .refresh_with(|_| Ok(BusStatistics::default()))
            .unwrap()
            .is_some());
    }
}
