//! Replay a half-hourly price series through the band strategy.
//!
//! Reads the band table from a fleet definition and prices from a CSV file
//! with `start,price` rows (RFC 3339 start, p/kWh), then prints every band
//! transition the controller would have made. The same input always gives
//! the same output.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use time::OffsetDateTime;

use hashfleet::config::FleetConfig;
use hashfleet::price::{PriceSlot, SlotTable};
use hashfleet::strategy::{ActiveBand, BandTable, BandTransition, Override, StrategyEngine};

#[derive(Parser)]
#[command(name = "hashfleet-replay")]
#[command(about = "Replay a price series through the band strategy", long_about = None)]
struct Cli {
    /// Fleet definition (JSON) holding the band table
    #[arg(short, long)]
    fleet: PathBuf,

    /// CSV file with `start,price` rows
    #[arg(short, long)]
    prices: PathBuf,

    /// Override mode: auto, force_enabled or force_disabled
    #[arg(short = 'o', long = "override", default_value = "auto")]
    override_mode: Override,

    /// Print the active band for every slot, not only transitions
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct Row {
    #[serde(with = "time::serde::rfc3339")]
    start: OffsetDateTime,
    price: f64,
}

/// Slots from CSV rows. Each slot ends where the next begins; the last
/// one is half an hour long.
fn read_slots<R: io::Read>(reader: R) -> Result<Vec<PriceSlot>> {
    let mut rows = Vec::new();
    for (line, row) in csv::Reader::from_reader(reader).deserialize::<Row>().enumerate() {
        rows.push(row.with_context(|| format!("row {}", line + 1))?);
    }
    rows.sort_by_key(|r| r.start);

    let ends: Vec<OffsetDateTime> = rows
        .iter()
        .skip(1)
        .map(|r| r.start)
        .chain(rows.last().map(|r| r.start + time::Duration::minutes(30)))
        .collect();

    Ok(rows
        .iter()
        .zip(ends)
        .map(|(row, end)| PriceSlot {
            start: row.start,
            end,
            price: row.price,
        })
        .collect())
}

/// Evaluate once at the start of every slot.
fn replay(
    bands: BandTable,
    slots: Vec<PriceSlot>,
    override_mode: Override,
    mut on_slot: impl FnMut(&PriceSlot, ActiveBand),
) -> Vec<BandTransition> {
    let table = SlotTable::new(slots);
    let mut engine = StrategyEngine::new(bands, None);
    engine.set_override(override_mode);

    let mut transitions = Vec::new();
    for slot in table.iter() {
        let next = table.next_after(slot.start);
        if let Some(t) = engine.evaluate(slot.start, Some(slot), next) {
            transitions.push(t);
        }
        on_slot(slot, engine.state().active);
    }
    transitions
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let fleet = FleetConfig::load(&cli.fleet)
        .with_context(|| format!("loading {}", cli.fleet.display()))?;
    let file = std::fs::File::open(&cli.prices)
        .with_context(|| format!("opening {}", cli.prices.display()))?;
    let slots = read_slots(file)?;
    if slots.is_empty() {
        bail!("no prices in {}", cli.prices.display());
    }

    let mut slots_in: BTreeMap<String, usize> = BTreeMap::new();
    let verbose = cli.verbose;
    let transitions = replay(
        fleet.bands,
        slots,
        cli.override_mode,
        |slot, active| {
            *slots_in.entry(active.to_string()).or_default() += 1;
            if verbose {
                println!("{}  {:>7.2}p  {}", slot.start, slot.price, active);
            }
        },
    );

    for t in &transitions {
        let price = t.price.map_or_else(|| "-".to_owned(), |p| format!("{p:.2}p"));
        println!("{}  {} -> {}  {}  {}", t.at, t.from, t.to, t.reason, price);
    }
    println!();
    println!("Transitions: {}", transitions.len());
    for (band, count) in &slots_in {
        println!("  {band:<10} {count} slots");
    }

    Ok(())
}
