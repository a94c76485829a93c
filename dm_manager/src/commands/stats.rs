//! Interface statistics (`stats`)

use colored::*;
use dm_core::{DmError, DmResult};
use dm_library::{BusStatistics, BusStatsService};

/// Print `ip` link statistics for `channel`
pub fn run_stats(channel: &str, json: bool) -> DmResult<()> {
    let service = BusStatsService::new(channel);
    let stats = match service.refresh()? {
        Some(stats) => stats,
        None => return Err(DmError::Internal("statistics refresh already running".to_string())),
    };

    if json {
        let output = serde_json::to_string_pretty(&stats)
            .map_err(|e| DmError::Serialization(e.to_string()))?;
        println!("{}", output);
        return Ok(());
    }

    print_stats(channel, &stats);
    Ok(())
}

fn print_stats(channel: &str, stats: &BusStatistics) {
    let unknown = || "?".to_string();
    println!("{} {}", "Interface:".green().bold(), channel.white().bold());
    println!(
        "  {:<12} {}",
        "Link:".dimmed(),
        stats.oper_state.clone().unwrap_or_else(unknown)
    );

    let state = stats.state.clone().unwrap_or_else(unknown);
    let state = match state.as_str() {
        "ERROR-ACTIVE" => state.as_str().green(),
        "ERROR-WARNING" | "ERROR-PASSIVE" => state.as_str().yellow(),
        "BUS-OFF" => state.as_str().red().bold(),
        other => other.normal(),
    };
    println!("  {:<12} {}", "CAN state:".dimmed(), state);
    println!(
        "  {:<12} {}",
        "Bitrate:".dimmed(),
        stats.bitrate.map_or_else(unknown, |b| b.to_string())
    );
    println!(
        "  {:<12} {}",
        "TX qlen:".dimmed(),
        stats.tx_queue_len.map_or_else(unknown, |q| q.to_string())
    );
    println!(
        "  {:<12} tx {}  rx {}",
        "Bus errors:".dimmed(),
        stats.berr_tx.map_or_else(unknown, |c| c.to_string()),
        stats.berr_rx.map_or_else(unknown, |c| c.to_string())
    );

    for (label, table) in [("RX", &stats.rx), ("TX", &stats.tx)] {
        if table.is_empty() {
            continue;
        }
        let counters: Vec<String> = table.iter().map(|(k, v)| format!("{} {}", k, v)).collect();
        println!("  {:<12} {}", format!("{}:", label).as_str().dimmed(), counters.join("  "));
    }
}
