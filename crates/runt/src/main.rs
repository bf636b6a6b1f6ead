//! runt CLI entry point.
//!
//! Builds a throwaway notebook in memory, runs its cells against the
//! simulated kernel and prints where every cell ended up.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use notebook_core::settings::{load_settings, settings_path};
use notebook_core::{
    lock, spawn_queue_processor, CellDraft, CellPatch, ExecutionCoordinator, Notebook,
    NotebookStore, OutputPolicy, SimulatedKernel, SimulatedKernelConfig,
};

#[derive(Parser, Debug)]
#[command(name = "runt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a notebook from the given cell sources and run all of them
    Run {
        /// Notebook name
        #[arg(long, default_value = "Untitled")]
        name: String,
        /// Keep every output event instead of only the latest
        #[arg(long)]
        append: bool,
        /// Simulated delay before each output event, in milliseconds
        #[arg(long, default_value = "10")]
        delay_ms: u64,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
        /// Cell sources, one per cell
        #[arg(required = true)]
        cells: Vec<String>,
    },
    /// Print the effective settings
    Settings,
}

#[derive(Serialize, Tabled)]
struct CellRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "COUNT")]
    count: String,
    #[tabled(rename = "OUTPUT")]
    output: String,
}

fn cell_rows(notebook: &Notebook) -> Vec<CellRow> {
    notebook
        .cells
        .iter()
        .enumerate()
        .map(|(index, cell)| CellRow {
            index,
            id: cell.id.to_string(),
            kind: cell.kind.to_string(),
            status: cell.status.to_string(),
            count: cell
                .execution_count
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            output: cell
                .last_output()
                .map(|o| truncate(&o.payload.to_text(), 48))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect()
}

/// Truncate text for display, replacing newlines with spaces.
fn truncate(text: &str, max_chars: usize) -> String {
    let single_line = text.trim_end().replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else if max_chars < 3 {
        single_line.chars().take(max_chars).collect()
    } else {
        let head: String = single_line.chars().take(max_chars - 3).collect();
        format!("{}...", head)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Commands::Run {
            name,
            append,
            delay_ms,
            json,
            cells,
        } => run_notebook(name, append, Duration::from_millis(delay_ms), json, cells).await,
        Commands::Settings => print_settings(),
    }
}

async fn run_notebook(
    name: String,
    append: bool,
    event_delay: Duration,
    json: bool,
    sources: Vec<String>,
) -> Result<()> {
    let mut settings = load_settings();
    if append {
        settings.output_policy = OutputPolicy::Append;
    }
    let default_kind = settings.default_cell_kind;

    let store = NotebookStore::with_settings(settings).into_shared();
    let kernel = Arc::new(SimulatedKernel::new(SimulatedKernelConfig {
        event_delay,
        ..Default::default()
    }));
    let coordinator = ExecutionCoordinator::new(store.clone(), kernel);

    let notebook_id = {
        let mut store = lock(&store);
        let notebook_id = store.create_notebook(&name)?;
        let first = store
            .notebook(&notebook_id)
            .and_then(|nb| nb.cells.first())
            .map(|c| c.id.clone())
            .ok_or_else(|| anyhow!("new notebook has no cells"))?;

        let mut sources = sources.into_iter();
        if let Some(source) = sources.next() {
            store.update_cell(&notebook_id, &first, CellPatch::content(source));
        }
        for source in sources {
            store.add_cell(
                &notebook_id,
                CellDraft {
                    kind: default_kind,
                    content: source,
                },
            )?;
        }
        notebook_id
    };

    let kernel_id = coordinator
        .attach_kernel(&notebook_id)
        .await
        .map_err(|e| anyhow!("Failed to start kernel: {}", e))?;
    info!("Running notebook {} on kernel {}", notebook_id, kernel_id);

    let queue = spawn_queue_processor(coordinator.clone());
    queue.run_all(&notebook_id).await?;
    queue.wait_idle().await?;

    let (title, rows) = {
        let store = lock(&store);
        let notebook = store
            .notebook(&notebook_id)
            .ok_or_else(|| anyhow!("notebook {} disappeared", notebook_id))?;
        (
            format!("{} ({})", notebook.name, notebook.kernel_status),
            cell_rows(notebook),
        )
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("{}", title);
        let table = Table::new(rows).with(Style::rounded()).to_string();
        println!("{}", table);
    }

    if let Err(e) = coordinator.remove_notebook(&notebook_id).await {
        warn!("Failed to shut down kernel {}: {}", kernel_id, e);
    }
    Ok(())
}

fn print_settings() -> Result<()> {
    let settings = load_settings();
    eprintln!("Settings file: {}", settings_path().display());
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_text_untouched() {
        assert_eq!(truncate("Out[1]: 1 line(s)", 48), "Out[1]: 1 line(s)");
    }

    #[test]
    fn test_truncate_flattens_and_shortens() {
        assert_eq!(truncate("abc\ndef\n", 48), "abc def");
        assert_eq!(truncate("abcdefghij", 6), "abc...");
    }

    #[test]
    fn test_truncate_narrow_width_skips_ellipsis() {
        assert_eq!(truncate("abcdef", 2), "ab");
        assert_eq!(truncate("abcdef", 0), "");
        assert_eq!(truncate("abcdef", 3), "...");
    }

    #[test]
    fn test_cli_parses_run_arguments() {
        let cli = Cli::parse_from(["runt", "run", "--append", "--name", "Demo", "x = 1", "y = 2"]);
        match cli.command {
            Commands::Run {
                name,
                append,
                cells,
                ..
            } => {
                assert_eq!(name, "Demo");
                assert!(append);
                assert_eq!(cells, vec!["x = 1", "y = 2"]);
            }
            Commands::Settings => panic!("expected run"),
        }
    }
}
