//! ElOyente offline checker.
//!
//! Validates job trigger files and service configuration, and dry-runs an
//! event payload against a job's subscription entries without connecting to
//! an XMPP server.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use eloyente::{evaluate_entry, ElOyenteConfig, JobTriggerConfig, PublishedItem};

#[derive(Parser, Debug)]
#[command(name = "eloyente-check")]
#[command(version)]
#[command(about = "Check ElOyente trigger declarations offline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate job trigger files
    Validate {
        /// Job trigger files (TOML)
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Validate a service configuration file
    Config {
        /// Configuration file (TOML)
        file: PathBuf,
    },

    /// Evaluate an event payload against a job's subscriptions
    DryRun {
        /// Job trigger file (TOML)
        #[arg(short, long)]
        job: PathBuf,

        /// Node the event was published on
        #[arg(short, long)]
        node: String,

        /// Event payload file, `-` for stdin
        #[arg(short, long, default_value = "-")]
        event: String,

        /// Item id reported in the build cause
        #[arg(long, default_value = "dry-run")]
        item_id: String,

        /// Print causes as JSON
        #[arg(long)]
        json: bool,
    },
}

fn read_text(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))
}

fn load_job(path: &Path) -> Result<JobTriggerConfig, String> {
    let text = read_text(path)?;
    JobTriggerConfig::from_toml(&text).map_err(|e| format!("{}: {e}", path.display()))
}

fn validate(files: &[PathBuf]) -> Result<(), String> {
    let mut failures = 0;
    for path in files {
        match load_job(path) {
            Ok(config) => {
                let entries = config.subscriptions.entries().len();
                println!(
                    "{}: job '{}', {entries} subscription(s) on [{}]",
                    path.display(),
                    config.job,
                    config.subscriptions.nodes().join(", ")
                );
            }
            Err(e) => {
                eprintln!("error: {e}");
                failures += 1;
            }
        }
    }
    if failures == 0 {
        Ok(())
    } else {
        Err(format!("{failures} file(s) failed validation"))
    }
}

fn check_config(path: &Path) -> Result<(), String> {
    let config = ElOyenteConfig::load(path).map_err(|e| e.to_string())?;
    println!("{config:#?}");
    config.xmpp.validate().map_err(|e| e.to_string())
}

fn dry_run(job: &Path, node: &str, event: &str, item_id: &str, json: bool) -> Result<(), String> {
    let config = load_job(job)?;
    let payload = if event == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("stdin: {e}"))?;
        buf
    } else {
        read_text(Path::new(event))?
    };
    let item = PublishedItem::new(item_id, payload);

    let mut matched = 0;
    for (idx, entry) in config.subscriptions.lookup_by_node(node).enumerate() {
        match evaluate_entry(node, entry, &item) {
            Ok(Some(cause)) => {
                matched += 1;
                if json {
                    let rendered = serde_json::to_string_pretty(&cause).map_err(|e| e.to_string())?;
                    println!("{rendered}");
                } else {
                    println!("entry {idx}: match\n{cause}");
                }
            }
            Ok(None) => {
                if !json {
                    println!("entry {idx}: no match (filter '{}')", entry.filter());
                }
            }
            Err(e) => eprintln!("entry {idx}: evaluation failed: {e}"),
        }
    }
    tracing::info!(job = %config.job, node = %node, matched, "dry run finished");
    if !json {
        println!("job '{}' would be triggered {matched} time(s)", config.job);
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "eloyente=warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Validate { files } => validate(&files),
        Commands::Config { file } => check_config(&file),
        Commands::DryRun {
            job,
            node,
            event,
            item_id,
            json,
        } => dry_run(&job, &node, &event, &item_id, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
