use std::io::{Write, stdout};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use memwatch::app::App;
use memwatch::config::{Config, load_config, load_config_from_path};
use memwatch::format::{format_bytes, format_epoch, truncate_unicode};
use memwatch::logging::{LogOptions, init_tracing};
use memwatch::system::snapshot::{Snapshot, ViewQuery, apply_view};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "memwatch",
    about = "Process memory and CPU monitor with optional history logging"
)]
struct Cli {
    /// Path to config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Sampling interval in seconds
    #[arg(long, global = true)]
    interval: Option<f64>,

    /// Default sort field for sampled snapshots
    #[arg(long, global = true)]
    sort: Option<String>,

    /// Storage backend: structured, flat-file
    #[arg(long, global = true)]
    storage: Option<String>,

    /// Record samples and events to the configured store
    #[arg(long, global = true, default_value_t = false)]
    enable_logging: bool,

    /// Emit diagnostics as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    /// Write diagnostics to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Sample continuously and print each snapshot as a JSON line
    Run {
        /// Processes per printed snapshot; 0 prints all
        #[arg(long, default_value_t = 20)]
        top: usize,
    },
    /// Print one filtered view of the process table
    View {
        #[arg(long)]
        top: Option<usize>,
        #[arg(long)]
        sort_by: Option<String>,
        #[arg(long)]
        min_mem: Option<f64>,
        /// Print JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Terminate a process, escalating to a kill after the timeout
    Kill {
        #[arg(long)]
        pid: u32,
        /// Skip the graceful request and kill immediately
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Show recorded samples for a process, newest first
    History {
        #[arg(long)]
        pid: u32,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show system memory and swap usage
    Memory,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(&LogOptions {
        json: cli.log_json,
        file: cli.log_file.clone(),
        level: None,
    })?;
    let config = load_config_for_cli(&cli);

    match cli.command.unwrap_or(Command::Run { top: 20 }) {
        Command::Run { top } => run(&config, top).await,
        Command::View {
            top,
            sort_by,
            min_mem,
            json,
        } => view(&config, top, sort_by.as_deref(), min_mem, json).await,
        Command::Kill { pid, force } => kill(&config, pid, force).await,
        Command::History { pid, limit } => history(&config, pid, limit).await,
        Command::Memory => memory(&config),
    }
}

fn load_config_for_cli(cli: &Cli) -> Config {
    let mut config = match &cli.config {
        Some(path) => load_config_from_path(path),
        None => load_config(),
    };
    config.apply_env(|key| std::env::var(key).ok());

    if let Some(secs) = cli.interval {
        config.general.interval_secs = secs;
    }
    if let Some(ref sort) = cli.sort {
        config.general.default_sort = sort.clone();
    }
    if let Some(ref storage) = cli.storage {
        config.storage.backend = storage.clone();
    }
    if cli.enable_logging {
        config.general.logging_enabled = true;
    }

    config
}

async fn run(config: &Config, top: usize) -> Result<()> {
    let app = App::new(config);
    let mut feed = app.subscribe();
    let pipeline = app.start();
    let query = ViewQuery {
        top: Some(top),
        ..ViewQuery::default()
    };

    let mut out = stdout().lock();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = feed.recv() => {
                let Some(snapshot) = next else { break };
                let view = apply_view(
                    &snapshot,
                    &query,
                    snapshot.system_memory,
                    snapshot.timestamp,
                );
                serde_json::to_writer(&mut out, &view)?;
                writeln!(out)?;
                out.flush()?;
            }
        }
    }

    info!("shutting down");
    pipeline.shutdown().await;
    Ok(())
}

async fn view(
    config: &Config,
    top: Option<usize>,
    sort_by: Option<&str>,
    min_mem: Option<f64>,
    json: bool,
) -> Result<()> {
    let app = App::new(config);
    // CPU usage needs two reads spaced by at least the sysinfo minimum.
    app.refresh().await?;
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.max(config.general.interval())).await;
    app.refresh().await?;

    let snapshot = app.view_named(top, sort_by, min_mem)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_table(&snapshot);
    }
    Ok(())
}

fn print_table(snapshot: &Snapshot) {
    let mem = &snapshot.system_memory;
    println!(
        "{}  memory {} / {} available ({:.1}% used)  showing {} of {}",
        snapshot.datetime,
        format_bytes(mem.available),
        format_bytes(mem.total),
        mem.percent,
        snapshot.filtered_processes,
        snapshot.total_processes,
    );
    println!(
        "{:>7}  {:<24}  {:<12}  {:>10}  {:>6}  {:>6}  {:<10}",
        "PID", "NAME", "USER", "RSS", "MEM%", "CPU%", "STATUS"
    );
    for p in &snapshot.processes {
        println!(
            "{:>7}  {:<24}  {:<12}  {:>10}  {:>6.2}  {:>6.2}  {:<10}",
            p.pid,
            truncate_unicode(&p.name, 24),
            truncate_unicode(&p.username, 12),
            format_bytes(p.memory_rss),
            p.memory_percent,
            p.cpu_percent,
            p.status,
        );
    }
}

async fn kill(config: &Config, pid: u32, force: bool) -> Result<()> {
    let app = App::new(config);
    let outcome = app.terminate_recorded(pid, force).await;
    println!("{}", serde_json::to_string(&outcome)?);
    if outcome.success {
        Ok(())
    } else {
        Err(eyre!(outcome.message))
    }
}

async fn history(config: &Config, pid: u32, limit: Option<usize>) -> Result<()> {
    let app = App::new(config);
    let rows = app.history(pid, limit).await?;
    for row in &rows {
        println!(
            "{}  {:<20}  {:>10}  {:>10.2} MB  {:>6.2}%  {:>6.2}%",
            format_epoch(row.timestamp),
            truncate_unicode(&row.name, 20),
            row.status,
            row.memory_rss_mb,
            row.memory_percent,
            row.cpu_percent,
        );
    }
    if rows.is_empty() {
        println!("no history recorded for pid {pid}");
    }
    Ok(())
}

fn memory(config: &Config) -> Result<()> {
    let app = App::new(config);
    println!("{}", serde_json::to_string_pretty(&app.memory_report())?);
    Ok(())
}
