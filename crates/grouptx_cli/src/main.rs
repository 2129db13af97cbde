//! grouptx CLI
//!
//! Command-line tools for exercising grouptx transaction coordination
//! against an in-process coordination service.
//!
//! # Commands
//!
//! - `simulate` - Run concurrent writers, crash some of them and groom
//! - `allocate` - Allocate transaction IDs, optionally across a bucket rollover

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// grouptx transaction coordination tools.
#[derive(Parser)]
#[command(name = "grouptx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Tenant the commands operate on
    #[arg(global = true, short, long, default_value = "demo")]
    tenant: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run concurrent writers over shared entity groups, then groom
    Simulate {
        /// Number of writer processes
        #[arg(short, long, default_value = "4")]
        writers: usize,

        /// Transactions per writer
        #[arg(short = 'n', long, default_value = "100")]
        transactions: usize,

        /// Number of entity groups contended for
        #[arg(short, long, default_value = "8")]
        groups: usize,

        /// Fraction of transactions whose process crashes mid-flight
        #[arg(short, long, default_value = "0.05")]
        crash_rate: f64,

        /// Fraction of transactions that cross entity groups
        #[arg(short, long, default_value = "0.2")]
        xg_rate: f64,

        /// Print the coordination tree afterwards
        #[arg(short, long)]
        dump: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Allocate transaction IDs and print them
    Allocate {
        /// Number of IDs to allocate
        #[arg(short, long, default_value = "5")]
        count: usize,

        /// Start this many IDs before the first bucket wraps
        #[arg(short, long)]
        near_rollover: Option<u32>,

        /// Manual ID offset for the tenant
        #[arg(short, long)]
        offset: Option<u64>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            writers,
            transactions,
            groups,
            crash_rate,
            xg_rate,
            dump,
            format,
        } => {
            let options = commands::simulate::Options {
                tenant: cli.tenant,
                writers,
                transactions,
                groups,
                crash_rate,
                xg_rate,
            };
            commands::simulate::run(&options, dump, &format)?;
        }
        Commands::Allocate {
            count,
            near_rollover,
            offset,
        } => {
            commands::allocate::run(&cli.tenant, count, near_rollover, offset)?;
        }
        Commands::Version => {
            println!("grouptx CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("grouptx Core v{}", grouptx_core::VERSION);
        }
    }

    Ok(())
}
