//! Strand workload driver
//!
//! Runs small concurrent programs on the Strand runtime and prints what the
//! scheduler did while running them.

mod scenarios;

use anyhow::Context;
use clap::{Parser, Subcommand};
use strand_core::logger::{self, LogLevel};
use strand_core::{Builder, RuntimeStats};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "strand")]
#[command(about = "Drive workloads on the Strand runtime", long_about = None)]
#[command(version)]
struct Cli {
    /// Worker threads (defaults to STRAND_WORKERS, then CPU count)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Seed for reproducible select choices
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Two tasks bounce a counter over unbuffered channels
    PingPong {
        /// Round trips to make
        #[arg(short, long, default_value_t = 10_000)]
        rounds: u64,
    },

    /// A chain of stages connected by channels
    Pipeline {
        /// Number of stages
        #[arg(short, long, default_value_t = 8)]
        stages: usize,
        /// Items pushed through the chain
        #[arg(short, long, default_value_t = 10_000)]
        items: u64,
        /// Buffer size of each link (0 = synchronous)
        #[arg(short, long, default_value_t = 0)]
        capacity: usize,
    },

    /// Dining philosophers sharing forks guarded by mutexes
    Philosophers {
        /// Number of philosophers
        #[arg(short, long, default_value_t = 5)]
        count: usize,
        /// Meals each philosopher eats
        #[arg(short, long, default_value_t = 100)]
        meals: u32,
    },

    /// Producers feed one consumer that selects across their channels
    FanIn {
        /// Number of producers
        #[arg(short, long, default_value_t = 4)]
        producers: usize,
        /// Items per producer
        #[arg(short, long, default_value_t = 1_000)]
        items: u64,
        /// Give up after this many milliseconds without input
        #[arg(long, default_value_t = 1_000)]
        idle_timeout_ms: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logger::init_with_level(match cli.verbose {
        0 => LogLevel::Warn,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    });

    let mut builder = Builder::from_env().context("reading runtime settings from environment")?;
    if let Some(workers) = cli.workers {
        builder = builder.worker_threads(workers);
    }
    if let Some(seed) = cli.seed {
        builder = builder.seed(seed);
    }
    let rt = builder.build().context("starting runtime")?;
    tracing::info!(workers = rt.worker_count(), "runtime started");

    let start = Instant::now();
    let summary = match cli.command {
        Commands::PingPong { rounds } => scenarios::ping_pong::execute(&rt, rounds)?,
        Commands::Pipeline {
            stages,
            items,
            capacity,
        } => scenarios::pipeline::execute(&rt, stages, items, capacity)?,
        Commands::Philosophers { count, meals } => {
            scenarios::philosophers::execute(&rt, count, meals)?
        }
        Commands::FanIn {
            producers,
            items,
            idle_timeout_ms,
        } => scenarios::fan_in::execute(&rt, producers, items, idle_timeout_ms)?,
    };
    let elapsed = start.elapsed();

    rt.shutdown_on_idle();

    println!("{}", summary);
    println!("Elapsed: {:.2?}", elapsed);
    print_stats(&rt.stats());
    Ok(())
}

fn print_stats(stats: &RuntimeStats) {
    println!();
    println!("Runtime:");
    println!("  workers:   {}", stats.workers);
    println!("  spawned:   {}", stats.spawned);
    println!("  completed: {}", stats.completed);
    println!("  panicked:  {}", stats.panicked);
    println!("  steals:    {}", stats.steals);
    if stats.live > 0 {
        println!("  live:      {} ({} blocked)", stats.live, stats.blocked);
    }
}
