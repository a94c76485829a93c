//! Command session: loaded configuration plus an opened bus

use std::path::PathBuf;
use std::sync::Arc;

use dm_core::config::{self, AppConfig, BusConfig};
use dm_core::{BackendKind, DmResult};
use dm_library::drivers::SimulatedMotor;
use dm_library::{BusManager, TelemetryIngest};

/// Motors seeded into an empty simulated bus so the tool has something to talk to
const SIM_DEFAULT_MOTORS: [(u8, u16); 4] = [(1, 0x11), (2, 0x12), (3, 0x13), (4, 0x14)];

/// Global options shared by every subcommand
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub channel: Option<String>,
    pub simulation: bool,
    pub config_path: Option<PathBuf>,
}

pub struct Session {
    pub config: AppConfig,
    pub config_path: Option<PathBuf>,
    pub bus: Arc<BusManager>,
}

impl Session {
    /// Load configuration and open the selected bus
    pub fn open(options: &SessionOptions) -> DmResult<Self> {
        let config = config::load_config(options.config_path.as_deref())?;
        let bus_config = resolve_bus(&config, options);
        log::debug!(
            "Opening {} on {} ({} bit/s)",
            bus_config.backend,
            bus_config.channel,
            bus_config.bitrate
        );

        let bus = BusManager::from_config(&bus_config)?;
        if let Some(sim) = bus.driver().as_simulation() {
            let seeded: Vec<(u8, u16)> = if config.motors.is_empty() {
                SIM_DEFAULT_MOTORS.to_vec()
            } else {
                config.motors.iter().map(|m| (m.esc_id, m.mst_id)).collect()
            };
            for (esc_id, mst_id) in seeded {
                let mut motor = SimulatedMotor::new(esc_id, mst_id);
                motor.limits = config.scale_limits(esc_id);
                sim.add_simulated_motor(motor);
            }
        }
        bus.open()?;

        Ok(Self {
            config,
            config_path: options.config_path.clone(),
            bus: Arc::new(bus),
        })
    }

    /// ESC ids of every configured motor, in configuration order
    pub fn configured_ids(&self) -> Vec<u8> {
        self.config.motors.iter().map(|m| m.esc_id).collect()
    }

    /// `ids` if given, otherwise every configured motor
    pub fn ids_or_configured(&self, ids: &[u8]) -> Vec<u8> {
        if ids.is_empty() {
            self.configured_ids()
        } else {
            ids.to_vec()
        }
    }

    /// Feedback ingest seeded with configured scale limits, listening on the bus
    pub fn attach_ingest(&self) -> Arc<TelemetryIngest> {
        let ingest = Arc::new(TelemetryIngest::from_config(&self.config));
        ingest.attach(&self.bus);
        ingest
    }

    pub fn save_config(&self) -> DmResult<()> {
        config::save_config(&self.config, self.config_path.as_deref())
    }

    pub fn close(&self) -> DmResult<()> {
        self.bus.close()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.bus.close() {
            log::warn!("Failed to close bus {}: {}", self.bus.channel(), e);
        }
    }
}

/// Pick the bus to use: `--channel` selects (or overrides) the interface and
/// `--sim` forces the simulated backend
pub fn resolve_bus(config: &AppConfig, options: &SessionOptions) -> BusConfig {
    let mut bus = match &options.channel {
        Some(channel) => config
            .buses
            .iter()
            .find(|b| &b.channel == channel)
            .cloned()
            .unwrap_or_else(|| BusConfig {
                channel: channel.clone(),
                ..BusConfig::default()
            }),
        None => config.buses.first().cloned().unwrap_or_default(),
    };
    if options.simulation {
        bus.backend = BackendKind::Simulation;
    }
    bus
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_bus_defaults_to_first_configured() {
        let mut config = AppConfig::default();
        config.ensure_bus("can1", 500_000);
        let bus = resolve_bus(&config, &SessionOptions::default());
        assert_eq!(bus.channel, "canB");
        assert_eq!(bus.backend, BackendKind::SocketCan);
    }

    #[test]
    fn test_resolve_bus_channel_override() {
        let mut config = AppConfig::default();
        config.ensure_bus("can1", 500_000);

        let options = SessionOptions {
            channel: Some("can1".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_bus(&config, &options).bitrate, 500_000);

        let options = SessionOptions {
            channel: Some("vcan7".to_string()),
            simulation: true,
            ..Default::default()
        };
        let bus = resolve_bus(&config, &options);
        assert_eq!(bus.channel, "vcan7");
        assert_eq!(bus.bitrate, 1_000_000);
        assert_eq!(bus.backend, BackendKind::Simulation);
    }
}
