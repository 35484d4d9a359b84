//! Steward CLI
//!
//! Drives simulated clusters: start a population of children, kill members,
//! watch failover and graceful handoff, and inspect placement.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{bail, WrapErr};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use steward_cluster::{place, NodeConfig, WorkerSpec};
use steward_core::{ChildId, MemberId};
use steward_runtime::{EntryRegistry, StartDescriptor};
use steward_sim::{Latency, SimCluster, SimConfig, SimSeed};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "steward")]
#[command(about = "Steward - distributed supervision on a simulated cluster", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated cluster through start, failure and leave
    Simulate(SimulateArgs),
    /// Show where rendezvous placement puts children
    Placement {
        /// Number of members
        #[arg(short, long, default_value_t = 3)]
        members: usize,
        /// Number of generated child ids, when no ids are given
        #[arg(short, long, default_value_t = 1000)]
        children: usize,
        /// Child ids to place
        ids: Vec<String>,
    },
    /// Print the default member configuration, or validate a file
    Config {
        /// Configuration file to validate
        #[arg(long)]
        check: Option<PathBuf>,
    },
}

#[derive(Args)]
struct SimulateArgs {
    /// Number of members
    #[arg(short, long, default_value_t = 3)]
    members: usize,
    /// Number of children to start
    #[arg(short, long, default_value_t = 200)]
    children: usize,
    /// Members to crash after the children run
    #[arg(short, long, default_value_t = 1)]
    kill: usize,
    /// Let the failure detector find crashed members instead of notifying
    #[arg(long)]
    detect: bool,
    /// Gracefully stop one surviving member at the end
    #[arg(long)]
    leave: bool,
    /// Simulation seed
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Maximum one-way network delay in milliseconds
    #[arg(long, default_value_t = 2)]
    latency_ms: u64,
    /// Send every message through its JSON encoding
    #[arg(long)]
    wire_json: bool,
    /// Member configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Wait limit for each phase, in seconds
    #[arg(long, default_value_t = 30)]
    wait_secs: u64,
}

fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    let Some(path) = path else {
        return Ok(NodeConfig::default().with_gossip_interval(50));
    };
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    let config: NodeConfig = serde_json::from_str(&text)
        .wrap_err_with(|| format!("parsing {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn member_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("m{}", i)).collect()
}

fn heading(text: &str) {
    println!("{}", style(text).bold().cyan());
}

async fn simulate(args: SimulateArgs) -> Result<()> {
    if args.members == 0 {
        bail!("need at least one member");
    }
    if args.kill >= args.members {
        bail!("cannot kill {} of {} members", args.kill, args.members);
    }

    let node = load_config(args.config.as_deref())?;
    let config = SimConfig::new(SimSeed::from_literal(args.seed))
        .with_node(node)
        .with_latency(Latency::new(0, args.latency_ms))
        .with_wire_json(args.wire_json);
    let wait = Duration::from_secs(args.wait_secs);

    let mut registry = EntryRegistry::new();
    registry.register("idle", |ctx| async move {
        ctx.shutdown_requested().await;
        Ok(())
    })?;

    let sim = SimCluster::new(config, registry);
    let names = member_names(args.members);
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();

    heading(&format!("Forming a cluster of {} members", args.members));
    sim.spawn_cluster(&refs).await?;
    sim.await_converged(wait).await?;

    heading(&format!("Starting {} children", args.children));
    let first = sim.node(&names[0]).await?;
    let progress = ProgressBar::new(args.children as u64);
    progress.set_style(ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")?);
    for i in 0..args.children {
        let spec = WorkerSpec::new(format!("worker-{}", i), StartDescriptor::new("idle"));
        first.start_child(spec).await?;
        progress.inc(1);
    }
    progress.finish_with_message("started");
    sim.await_active(&names[0], args.children, wait).await?;
    print_distribution(&sim).await;

    if args.kill > 0 {
        let victims = &names[args.members - args.kill..];
        heading(&format!("Crashing {}", victims.join(", ")));
        let started = Instant::now();
        for victim in victims {
            sim.crash(victim).await?;
            if !args.detect {
                sim.notify_down(victim).await;
            }
        }
        let counts = sim.await_active(&names[0], args.children, wait).await?;
        println!(
            "{} {} of {} children running again after {:?}",
            style("✔").green(),
            counts.active,
            counts.specs,
            started.elapsed()
        );
        print_distribution(&sim).await;
    }

    let survivors = args.members - args.kill;
    if args.leave && survivors > 1 {
        let leaver = &names[survivors - 1];
        heading(&format!("Stopping {} gracefully", leaver));
        let report = sim.stop(leaver, wait).await?;
        println!(
            "handed off {}, released {}, dropped {}, forced {}{}",
            report.handed_off.len(),
            report.released.len(),
            report.dropped.len(),
            report.forced.len(),
            if report.timed_out { " (timed out)" } else { "" }
        );
        let counts = sim.await_active(&names[0], args.children, wait).await?;
        println!("{} {} children running", style("✔").green(), counts.active);
        print_distribution(&sim).await;
    }

    let stats = sim.network().stats();
    println!(
        "{}",
        style(format!("network: {} delivered, {} refused", stats.delivered, stats.refused)).dim()
    );
    Ok(())
}

async fn print_distribution(sim: &SimCluster) {
    for node in sim.nodes().await {
        let running = node
            .local_children()
            .await
            .iter()
            .filter(|report| report.handle.is_some())
            .count();
        println!("  {} {:>6}", style(node.id().short()).yellow(), running);
    }
}

fn placement(members: usize, children: usize, ids: Vec<String>) -> Result<()> {
    if members == 0 {
        bail!("need at least one member");
    }
    let names = member_names(members);
    let alive: Vec<MemberId> = names.iter().map(|name| SimCluster::member_id(name)).collect();
    let name_of = |member: MemberId| {
        alive
            .iter()
            .position(|m| *m == member)
            .map_or("?", |i| names[i].as_str())
    };

    if !ids.is_empty() {
        for id in ids {
            let owner = place(&ChildId::new(id.clone()), &alive)?;
            println!("{} -> {}", id, style(name_of(owner)).yellow());
        }
        return Ok(());
    }

    let generated: Vec<ChildId> = (0..children).map(|i| ChildId::new(format!("worker-{}", i))).collect();
    let mut spread: BTreeMap<&str, usize> = BTreeMap::new();
    for id in &generated {
        *spread.entry(name_of(place(id, &alive)?)).or_default() += 1;
    }
    heading(&format!("{} children over {} members", children, members));
    for (name, count) in &spread {
        println!("  {} {:>6}", style(name).yellow(), count);
    }

    if members > 1 {
        let fewer = &alive[..members - 1];
        let mut moved = 0;
        for id in &generated {
            if place(id, &alive)? != place(id, fewer)? {
                moved += 1;
            }
        }
        println!(
            "removing {} moves {} children (only its own)",
            names[members - 1],
            moved
        );
    }
    Ok(())
}

fn config(check: Option<PathBuf>) -> Result<()> {
    match check {
        Some(path) => {
            let config = load_config(Some(&path))?;
            println!("{} {} is valid", style("✔").green(), path.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        None => println!("{}", serde_json::to_string_pretty(&NodeConfig::default())?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("steward=info")))
        .init();

    match cli.command {
        Commands::Simulate(args) => simulate(args).await,
        Commands::Placement { members, children, ids } => placement(members, children, ids),
        Commands::Config { check } => config(check),
    }
}
