//! kiln CLI - a thin wrapper over the goal engine, store, and evaluator.

mod commands;
mod output;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "kiln - a reproducible build orchestrator for a content-addressed store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Make one or more store paths valid, building or substituting as needed
    Realise {
        /// Store paths, `<hash>-<name>` components, or `.drv` names
        paths: Vec<String>,

        /// Rebuild and verify paths whose contents no longer match their registered hash
        #[arg(long)]
        repair: bool,
    },

    /// Run garbage collection over the store
    Gc {
        /// return-live | return-dead | delete-dead | delete-specific
        #[arg(long, default_value = "delete-dead")]
        action: String,

        /// Stop once this many bytes have been freed
        #[arg(long)]
        max_freed: Option<u64>,

        /// Paths to consider (required for --action delete-specific)
        paths: Vec<String>,
    },

    /// Evaluate an expression (or a `.kiln` file) to normal form
    Eval {
        /// The expression text, or a path to a `.kiln` file
        expr_or_file: String,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Realise { paths, repair } => commands::realise::run(&paths, repair),
        Commands::Gc { action, max_freed, paths } => commands::gc::run(&action, max_freed, &paths),
        Commands::Eval { expr_or_file } => commands::eval::run(&expr_or_file, cli.verbose),
    };

    if let Err(e) = result {
        if !cli.quiet {
            eprintln!("error: {}", e);
        }
        let code = if e.contains("permanently") { 100 } else { 1 };
        std::process::exit(code);
    }
}
