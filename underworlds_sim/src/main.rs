//! Underworlds DST Simulator CLI
//!
//! Run deterministic replication scenarios with fault injection.

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use underworlds_sim::scenarios::ScenarioId;
use underworlds_sim::{ScenarioRunner, SimConfig, SimReport};

/// Underworlds Deterministic Simulation Testing CLI
#[derive(Parser, Debug)]
#[command(name = "underworlds-sim")]
#[command(about = "Run deterministic replication scenarios for Underworlds", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of client sessions
    #[arg(short, long, default_value = "3")]
    clients: usize,

    /// Nodes written per client
    #[arg(short, long, default_value = "10")]
    nodes: usize,

    /// Scenario to run (create_observe, delete_ordering, reparenting,
    /// index_stability, mesh_dedup, session_eviction, concurrent_writers,
    /// slow_link, lossy_link, standard, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Server delivery timeout in milliseconds
    #[arg(long, default_value = "1000")]
    delivery_timeout_ms: u64,

    /// Client propagation window in milliseconds
    #[arg(long, default_value = "50")]
    propagation_window_ms: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Write the JSON report to a file
    #[arg(long)]
    export: Option<String>,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("Underworlds DST Simulator v0.1.0");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = match args.scenario.as_str() {
        "all" => ScenarioId::all(),
        "standard" => ScenarioId::standard(),
        name => match name.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, standard, all", names.join(", "));
                std::process::exit(2);
            }
        },
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    let base_config = SimConfig {
        seed: base_seed,
        num_clients: args.clients,
        nodes_per_client: args.nodes,
        delivery_timeout_ms: args.delivery_timeout_ms,
        propagation_window_ms: args.propagation_window_ms,
        ..SimConfig::default()
    };
    let mut report = SimReport::new(base_config.clone(), args.seeds);

    // Run simulations
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::from_config(SimConfig {
            seed,
            ..base_config.clone()
        });

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!(
                        "✓ {} (seed={}) PASSED in {:.2}s virtual",
                        scenario.name(),
                        seed,
                        result.final_time_secs
                    );
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            report.add(result);
        }
    }

    if let Some(path) = &args.export {
        match report.write_to_file(path) {
            Ok(()) => info!("Exported {} results to {}", report.total, path),
            Err(e) => error!("Failed to write export: {:?}", e),
        }
    }

    if args.json {
        // JSON output for CI parsing
        match report.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to serialize report: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if report.all_passed() {
            info!("✅ All {} scenario runs passed!", report.total);
        } else {
            error!("❌ {}/{} scenario runs failed!", report.failed, report.total);

            // List failed seeds
            for result in report.failures() {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if !report.all_passed() {
        std::process::exit(1);
    }
}
