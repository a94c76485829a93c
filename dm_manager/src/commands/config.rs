//! Configuration file commands (`config show|init|list`)

use std::path::Path;

use colored::*;
use dm_core::config::{self, AppConfig};
use dm_core::{DmError, DmResult};

fn display_path(path: Option<&Path>) -> String {
    path.map(Path::to_path_buf)
        .unwrap_or_else(config::default_config_path)
        .display()
        .to_string()
}

/// Print the effective configuration
pub fn run_show(path: Option<&Path>) -> DmResult<()> {
    let config = config::load_config(path)?;
    println!("{} {}", "Config:".green().bold(), display_path(path).cyan());
    println!();

    println!("{}", "Buses:".cyan());
    for bus in &config.buses {
        println!(
            "  {:<10} {:>9} bit/s  {}",
            bus.channel.as_str().white().bold(),
            bus.bitrate,
            bus.backend.to_string().as_str().dimmed()
        );
    }
    println!();

    println!("{}", "Motors:".cyan());
    if config.motors.is_empty() {
        println!("  {}", "none".yellow());
        println!(
            "  {} Run 'dmctl sniff --save' or 'dmctl probe --save' to add motors",
            "Tip:".dimmed()
        );
    } else {
        println!(
            "  {:<6} {:<6} {:<14} {:<10} {}",
            "ESC".dimmed(),
            "MST".dimmed(),
            "NAME".dimmed(),
            "GROUP".dimmed(),
            "LIMITS (P/V/T)".dimmed()
        );
        for motor in &config.motors {
            let limits = motor.scale_limits();
            println!(
                "  {:<6} {:<6} {:<14} {:<10} {}/{}/{}",
                format!("0x{:02X}", motor.esc_id),
                format!("0x{:03X}", motor.mst_id),
                motor.name.as_deref().unwrap_or("-"),
                motor.group.as_deref().unwrap_or("-"),
                limits.p_max,
                limits.v_max,
                limits.t_max
            );
        }
    }
    println!();

    let wd = &config.watchdog;
    println!(
        "{} threshold {} ms, cooldown {} ms, interval {} ms",
        "Watchdog:".cyan(),
        wd.threshold_ms,
        wd.cooldown_ms,
        wd.interval_ms
    );
    Ok(())
}

/// Write a default configuration, refusing to overwrite unless `force`
pub fn run_init(path: Option<&Path>, channel: Option<&str>, force: bool) -> DmResult<()> {
    let target = path
        .map(Path::to_path_buf)
        .unwrap_or_else(config::default_config_path);
    if target.exists() && !force {
        return Err(DmError::config(format!(
            "{} already exists (use --force to overwrite)",
            target.display()
        )));
    }

    let mut config = AppConfig::default();
    if let Some(channel) = channel {
        config.buses[0].channel = channel.to_string();
    }
    config::save_config(&config, Some(&target))?;
    println!("{} Wrote {}", "✓".green(), target.display());
    Ok(())
}

/// List configuration files next to the active one
pub fn run_list(path: Option<&Path>) -> DmResult<()> {
    let dir = path.and_then(Path::parent).filter(|p| !p.as_os_str().is_empty());
    let files = config::list_config_files(dir)?;
    if files.is_empty() {
        println!("{}", "No configuration files found.".yellow());
        return Ok(());
    }
    for file in files {
        println!("  {}", file.display());
    }
    Ok(())
}
