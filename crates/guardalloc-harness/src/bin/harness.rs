//! CLI entrypoint for guarded heap dump tooling.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use guardalloc_harness::{SortKey, aggregate, diff_dumps, load_dump, load_merged, render_diff, render_table};

/// Offline aggregation of guarded heap dumps.
#[derive(Debug, Parser)]
#[command(name = "guardalloc-harness")]
#[command(about = "Aggregate and compare guarded heap dumps")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Group the blocks of one or more dumps by owner name.
    Summarize {
        /// Structured dump JSON files; blocks of all files are merged.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Group ordering.
        #[arg(long, value_enum, default_value = "size")]
        sort: SortKey,
        /// Only print the first N groups.
        #[arg(long)]
        top: Option<usize>,
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
        /// Output path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show per-name growth between two dumps.
    Diff {
        before: PathBuf,
        after: PathBuf,
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Summarize {
            inputs,
            sort,
            top,
            format,
            output,
        } => {
            let dump = load_merged(&inputs)?;
            let mut groups = aggregate(&dump, sort);
            if let Some(top) = top {
                groups.truncate(top);
            }
            let rendered = match format {
                OutputFormat::Table => render_table(&groups),
                OutputFormat::Json => serde_json::to_string_pretty(&groups)?,
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered + "\n")?;
                    eprintln!(
                        "Wrote {} groups from {} blocks to {}",
                        groups.len(),
                        dump.blocks.len(),
                        path.display()
                    );
                }
                None => println!("{rendered}"),
            }
        }
        Command::Diff {
            before,
            after,
            format,
        } => {
            let deltas = diff_dumps(&load_dump(&before)?, &load_dump(&after)?);
            match format {
                OutputFormat::Table => println!("{}", render_diff(&deltas)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&deltas)?),
            }
        }
    }

    Ok(())
}
