//! Command-line interface for hashfleet.
//!
//! Reads fleet status from the daemon's HTTP API.

use std::env;

use anyhow::Result;

use hashfleet::api_client;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: hashfleet-cli <command>");
        eprintln!();
        eprintln!("Commands:");
        eprintln!("  status       Show strategy and device status");
        eprintln!("  transitions  Show band transition history");
        eprintln!("  rules        Show the last rule evaluation");
        eprintln!("  audit        Show recently dispatched actions");
        eprintln!();
        eprintln!("Environment:");
        eprintln!(
            "  HASHFLEET_API_URL    API base URL (default: {})",
            api_client::DEFAULT_BASE_URL
        );
        std::process::exit(1);
    }

    let command = &args[1];

    match command.as_str() {
        "status" => cmd_status().await?,
        "transitions" => cmd_transitions().await?,
        "rules" => cmd_rules().await?,
        "audit" => cmd_audit().await?,
        _ => {
            eprintln!("Unknown command: {}", command);
            eprintln!("Run without arguments to see usage.");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Build an API client, honoring HASHFLEET_API_URL if set.
fn make_client() -> api_client::Client {
    match env::var("HASHFLEET_API_URL") {
        Ok(url) => api_client::Client::with_base_url(url),
        Err(_) => api_client::Client::new(),
    }
}

fn or_dash<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_owned(), |v| v.to_string())
}

/// Print strategy state and one line per device.
async fn cmd_status() -> Result<()> {
    let client = make_client();
    let fleet = client.get_fleet().await?;

    println!("Uptime:   {} s", fleet.uptime_secs);
    println!(
        "Band:     {} (override {})",
        fleet.strategy.active, fleet.strategy.override_mode
    );
    if let Some(cycle) = &fleet.last_cycle {
        println!(
            "Price:    {} p/kWh (next {})",
            or_dash(cycle.price),
            or_dash(cycle.next_price)
        );
    }
    println!("Hashrate: {:.1} GH/s", fleet.hashrate_ghs);
    println!("Power:    {:.1} W", fleet.power_w);

    if fleet.devices.is_empty() {
        println!("Devices:  (none)");
    } else {
        println!("Devices:");
        for d in &fleet.devices {
            println!(
                "  - {:<16} {:<8} {:<8} {:>10} GH/s {:>6} C {:>7} W",
                d.name,
                d.family,
                d.status,
                or_dash(d.hashrate_ghs.map(|h| format!("{h:.1}"))),
                or_dash(d.temperature_c.map(|t| format!("{t:.0}"))),
                or_dash(d.power_w.map(|p| format!("{p:.1}"))),
            );
        }
    }

    Ok(())
}

async fn cmd_transitions() -> Result<()> {
    let transitions = make_client().get_transitions().await?;
    if transitions.is_empty() {
        println!("(no transitions)");
    }
    for t in &transitions {
        println!(
            "{}  {} -> {}  {}  price {}",
            t.at,
            t.from,
            t.to,
            t.reason,
            or_dash(t.price)
        );
    }
    Ok(())
}

async fn cmd_rules() -> Result<()> {
    for r in &make_client().get_rules().await? {
        let state = match (r.enabled, r.matched) {
            (false, _) => "disabled",
            (true, true) => "matched",
            (true, false) => "-",
        };
        println!(
            "{:>4}  {:<20} {:<9} {}",
            r.priority,
            r.name,
            state,
            r.detail.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_audit() -> Result<()> {
    for e in &make_client().get_audit().await? {
        println!(
            "{}  {:<10} {:<12} {:<10} {} -> {}  {}",
            e.at,
            e.device.as_deref().unwrap_or("-"),
            e.action,
            e.origin,
            e.old.as_deref().unwrap_or("-"),
            e.new.as_deref().unwrap_or("-"),
            e.outcome
        );
    }
    Ok(())
}
