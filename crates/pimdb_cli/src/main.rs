//! pimdb shell
//!
//! Inspection and poking tools for pimdb resource instances.
//!
//! # Commands
//!
//! - `repl` - interactive shell over a resource
//! - `inspect` - one-shot statistics dump
//! - `query` - run a single query from the command line

mod commands;
mod state;
mod syntax;

use clap::{Parser, Subcommand};
use state::ShellState;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// pimdb command-line tools.
#[derive(Parser)]
#[command(name = "pimdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive shell over a resource instance
    Repl {
        /// Storage root directory
        root: PathBuf,
        /// Resource instance id
        instance: String,
    },

    /// One-shot statistics dump
    Inspect {
        /// Storage root directory
        root: PathBuf,
        /// Resource instance id
        instance: String,
    },

    /// Run one query and print the rows
    Query {
        /// Storage root directory
        root: PathBuf,
        /// Resource instance id
        instance: String,
        /// Entity type to list
        entity_type: String,
        /// Optional property filter
        #[arg(short, long, num_args = 2, value_names = ["PROPERTY", "VALUE"])]
        filter: Vec<String>,
    },
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Commands::Repl { root, instance } => repl(&root, &instance),
        Commands::Inspect { root, instance } => {
            one_shot(&root, &instance, "stat".to_string())
        }
        Commands::Query {
            root,
            instance,
            entity_type,
            filter,
        } => {
            let mut line = format!("list {entity_type}");
            if let [property, value] = filter.as_slice() {
                line.push_str(&format!(" {property} {value}"));
            }
            one_shot(&root, &instance, line)
        }
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn one_shot(root: &std::path::Path, instance: &str, line: String) -> Result<(), String> {
    let mut state = ShellState::open(root, instance)?;
    let output = commands::run_line(&line, &mut state)?;
    print!("{output}");
    Ok(())
}

fn repl(root: &std::path::Path, instance: &str) -> Result<(), String> {
    let mut state = ShellState::open(root, instance)?;
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    loop {
        write!(stdout, "pimdb> ").and_then(|()| stdout.flush()).ok();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(error) => return Err(error.to_string()),
        }
        match commands::run_line(&line, &mut state) {
            Ok(output) => print!("{output}"),
            Err(message) => eprintln!("error: {message}"),
        }
        if state.exit_requested {
            break;
        }
    }
    Ok(())
}
