//! LoRa Mesh Simulation Command-Line Interface
//!
//! This CLI provides tools for:
//! - Running deterministic multi-node mesh simulations
//! - Comparing routing metrics under identical seeds
//! - Inspecting LoRa airtime for a given radio configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loramesh_core::{AirtimeModel, LoraAirtime, RoutingMetric};
use std::path::PathBuf;
use tracing::info;

mod sim;

use sim::{SimOptions, Simulator};

#[derive(Parser)]
#[command(name = "loramesh")]
#[command(author, version, about = "LoRa mesh simulation CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a multi-node mesh simulation
    Sim {
        /// Number of nodes
        #[arg(short, long, default_value = "8")]
        nodes: u32,

        /// Routing metric (no-forwarding, flooding, smart-flooding, hop-count,
        /// rssi-sum, rssi-prod, etx, toa-hop, toa-sf)
        #[arg(short, long, default_value = "hop-count")]
        metric: String,

        /// Random seed for reproducibility
        #[arg(short, long, default_value = "42")]
        seed: u64,

        /// Simulated duration in seconds
        #[arg(short, long, default_value = "3600")]
        duration: f64,

        /// DATA packets originated per node
        #[arg(short, long, default_value = "10")]
        packets: u32,

        /// DATA payload size in bytes
        #[arg(long, default_value = "20")]
        payload: usize,

        /// Duty-cycle fraction (e.g. 0.01 for 1%)
        #[arg(long, default_value = "0.01")]
        duty_cycle: f64,

        /// Track the duty cycle without enforcing silence windows
        #[arg(long)]
        no_duty_enforcement: bool,

        /// Enable reactive route discovery on route misses
        #[arg(long)]
        discovery: bool,

        /// Index-distance adjacency range (1 = line topology)
        #[arg(long, default_value = "1")]
        link_range: u32,

        /// Number of nodes that fail permanently mid-run
        #[arg(long, default_value = "0")]
        failures: usize,

        /// Earliest failure time in seconds
        #[arg(long, default_value = "600")]
        failure_start: f64,

        /// Fixed destination address (omit for uniform-random)
        #[arg(long)]
        dest: Option<u32>,

        /// Load all run parameters from a JSON scenario file instead
        #[arg(long, conflicts_with_all = ["nodes", "metric", "seed", "duration", "packets"])]
        scenario: Option<PathBuf>,

        /// Emit the report as JSON
        #[arg(long)]
        json: bool,

        /// Write the report to a file (stdout if not specified)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show time-on-air for a radio configuration
    Airtime {
        /// Spreading factor (7-12)
        #[arg(long, default_value = "7")]
        sf: u8,

        /// Bandwidth in kHz (125, 250, 500)
        #[arg(long, default_value = "125")]
        bw: u32,

        /// Coding rate index (1-4 for 4/5 to 4/8)
        #[arg(long, default_value = "1")]
        cr: u8,

        /// Payload length in bytes
        #[arg(long, default_value = "20")]
        payload: usize,
    },
}

fn parse_metric(metric: &str) -> Result<RoutingMetric> {
    match metric.to_lowercase().as_str() {
        "no-forwarding" | "none" => Ok(RoutingMetric::NoForwarding),
        "flooding" | "flooding-broadcast" => Ok(RoutingMetric::FloodingBroadcast),
        "smart-flooding" | "smart-broadcast" => Ok(RoutingMetric::SmartBroadcast),
        "hop-count" | "hops" => Ok(RoutingMetric::HopCount),
        "rssi-sum" => Ok(RoutingMetric::RssiSum),
        "rssi-prod" => Ok(RoutingMetric::RssiProd),
        "etx" => Ok(RoutingMetric::Etx),
        "toa-hop" | "time-on-air-hop" => Ok(RoutingMetric::TimeOnAirHopCount),
        "toa-sf" | "time-on-air-sf" => Ok(RoutingMetric::TimeOnAirSf),
        _ => anyhow::bail!(
            "Unknown metric: {}. Use no-forwarding, flooding, smart-flooding, hop-count, rssi-sum, rssi-prod, etx, toa-hop, or toa-sf",
            metric
        ),
    }
}

fn validate_sf(sf: u8) -> Result<u8> {
    if (7..=12).contains(&sf) {
        Ok(sf)
    } else {
        anyhow::bail!("Invalid spreading factor: {}. Must be 7-12", sf)
    }
}

fn validate_bw(bw: u32) -> Result<f64> {
    match bw {
        125 => Ok(125_000.0),
        250 => Ok(250_000.0),
        500 => Ok(500_000.0),
        _ => anyhow::bail!("Invalid bandwidth: {}kHz. Must be 125, 250, or 500", bw),
    }
}

fn validate_cr(cr: u8) -> Result<u8> {
    if (1..=4).contains(&cr) {
        Ok(cr)
    } else {
        anyhow::bail!("Invalid coding rate index: {}. Must be 1-4 (4/5 to 4/8)", cr)
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_sim(
    nodes: u32,
    metric: String,
    seed: u64,
    duration: f64,
    packets: u32,
    payload: usize,
    duty_cycle: f64,
    no_duty_enforcement: bool,
    discovery: bool,
    link_range: u32,
    failures: usize,
    failure_start: f64,
    dest: Option<u32>,
    scenario: Option<PathBuf>,
    json: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let opts = match scenario {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read scenario file {:?}", path))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid scenario file {:?}", path))?
        }
        None => SimOptions {
            nodes,
            metric: parse_metric(&metric)?,
            seed,
            duration,
            packets_per_node: packets,
            payload_bytes: payload,
            duty_cycle,
            enforce_duty_cycle: !no_duty_enforcement,
            route_discovery: discovery,
            link_range,
            failures,
            failure_start,
            destination: dest,
        },
    };

    info!(
        nodes = opts.nodes, metric = ?opts.metric, seed = opts.seed,
        duration = opts.duration, "starting simulation"
    );
    let mut simulator = Simulator::new(opts).context("Invalid simulation configuration")?;
    let report = simulator.run();

    let text = if json {
        serde_json::to_string_pretty(&report).context("Failed to serialize report")?
    } else {
        render_report(&report)
    };

    if let Some(path) = output {
        std::fs::write(&path, &text).context("Failed to write report file")?;
        println!("Report written to {:?}", path);
    } else {
        println!("{}", text);
    }

    Ok(())
}

fn render_report(report: &sim::SimReport) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "=== Mesh Simulation Report ===");
    let _ = writeln!(out);
    let _ = writeln!(out, "Nodes:            {}", report.nodes);
    let _ = writeln!(out, "Simulated time:   {:.1} s", report.elapsed);
    let _ = writeln!(out, "Transmissions:    {}", report.transmissions);
    let _ = writeln!(out, "DATA sent:        {}", report.data_sent);
    let _ = writeln!(out, "DATA delivered:   {}", report.data_delivered);
    let _ = writeln!(out, "ACKs delivered:   {}", report.acks_delivered);
    let _ = writeln!(out, "Delivery rate:    {:.1}%", report.delivery_rate() * 100.0);
    let _ = writeln!(out, "Converged nodes:  {}", report.converged_nodes);
    let _ = writeln!(out, "Failed nodes:     {}", report.failed_nodes);
    let _ = writeln!(out);
    let _ = writeln!(out, "Per node:");
    let _ = writeln!(out, "  {:>4} {:>6} {:>7} {:>9} {:>9} {:>9} {:>10}", "id", "failed", "routes", "sent", "fwd", "for-me", "converged");
    for node in &report.per_node {
        let converged = node
            .converged_at
            .map(|t| format!("{:.1}s", t))
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "  {:>4} {:>6} {:>7} {:>9} {:>9} {:>9} {:>10}",
            node.id,
            if node.failed { "yes" } else { "no" },
            node.known_destinations,
            node.stats.sent_data,
            node.stats.sent_forwarded,
            node.stats.received_data_for_me,
            converged,
        );
    }
    out
}

fn cmd_airtime(sf: u8, bw: u32, cr: u8, payload: usize) -> Result<()> {
    validate_sf(sf)?;
    validate_cr(cr)?;
    let bw_hz = validate_bw(bw)?;

    let model = LoraAirtime;
    let toa = model.airtime(payload, sf, bw_hz, cr);
    let symbol_ms = (1u64 << sf) as f64 / (bw_hz / 1000.0);

    println!("=== LoRa Airtime ===");
    println!();
    println!("Configuration:");
    println!("  Spreading Factor:  SF{}", sf);
    println!("  Bandwidth:         {} kHz", bw);
    println!("  Coding Rate:       4/{}", cr + 4);
    println!("  Payload Length:    {} bytes", payload);
    println!();
    println!("Timing:");
    println!("  Symbol duration:   {:.3} ms", symbol_ms);
    println!("  Time on air:       {:.3} ms", toa * 1000.0);
    println!();
    println!("Duty cycle silence after one packet:");
    for duty in [0.01, 0.001] {
        println!("  {:>5.1}%:            {:.2} s", duty * 100.0, toa / duty);
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Sim {
            nodes,
            metric,
            seed,
            duration,
            packets,
            payload,
            duty_cycle,
            no_duty_enforcement,
            discovery,
            link_range,
            failures,
            failure_start,
            dest,
            scenario,
            json,
            output,
        } => cmd_sim(
            nodes,
            metric,
            seed,
            duration,
            packets,
            payload,
            duty_cycle,
            no_duty_enforcement,
            discovery,
            link_range,
            failures,
            failure_start,
            dest,
            scenario,
            json,
            output,
        ),
        Commands::Airtime { sf, bw, cr, payload } => cmd_airtime(sf, bw, cr, payload),
    }
}
