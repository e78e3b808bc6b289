//! harvline - resumable, rate-limited collection of community communication
//!
//! Harvests review comments, chat logs and similar records from remote
//! endpoints into append-only JSON Lines stores, resuming where earlier runs
//! left off.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "harvline")]
#[command(about = "Resumable, rate-limited harvesting into append-only stores")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./harvline.toml or ~/.config/harvline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Harvest configured sources
    Run(cmd::run::RunArgs),
    /// Show what a source's store, backups and artifacts already cover
    Ledger(cmd::ledger::LedgerArgs),
    /// Show current configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = Arc::new(harvline_core::ProgressContext::new());

    // Logging:
    //   TTY:     quiet (warn) unless --debug; spinner lines show activity
    //   non-TTY: info unless --debug; logs are the only progress indicator
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = if is_tty { !cli.debug } else { false };
    harvline_core::init_logging(quiet, cli.debug, multi).context("Failed to init logging")?;

    harvline_core::install_signal_handlers().context("Failed to install signal handlers")?;

    let config = if let Some(path) = cli.config {
        Config::from_file(&path)?
    } else {
        Config::load()?
    };

    match cli.command {
        Command::Run(args) => cmd::run::run(args, &config, &progress),
        Command::Ledger(args) => cmd::ledger::run(args, &config),
        Command::Config => {
            print_config(&config);
            Ok(())
        }
    }
}

fn print_config(config: &Config) {
    use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

    let d = &config.defaults;
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Setting").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);
    table.add_row(vec!["Data directory", &d.data_dir.display().to_string()]);
    table.add_row(vec!["Backup directory", &d.backup_dir.display().to_string()]);
    table.add_row(vec![
        "Rate budget",
        &format!("{} calls / {}s", d.max_calls, d.time_window_seconds),
    ]);
    table.add_row(vec![
        "Retries",
        &format!("{} (backoff {}s × n)", d.max_retries, d.backoff_base_seconds),
    ]);
    table.add_row(vec![
        "Empty-unit threshold",
        &d.consecutive_empty_threshold.to_string(),
    ]);
    table.add_row(vec![
        "Max consecutive errors",
        &d.max_consecutive_errors.to_string(),
    ]);
    eprintln!("\n{table}");

    if config.sources.is_empty() {
        eprintln!("No sources configured.");
        return;
    }

    let mut sources = Table::new();
    sources
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Source").fg(Color::Cyan),
            Cell::new("Remote").fg(Color::Cyan),
            Cell::new("Store").fg(Color::Cyan),
            Cell::new("Rate").fg(Color::Cyan),
            Cell::new("URL").fg(Color::Cyan),
            Cell::new("Headers").fg(Color::Cyan),
        ]);
    for entry in &config.sources {
        let cfg = config.source_config(entry);
        sources.add_row(vec![
            cfg.name.clone(),
            cfg.remote.clone(),
            cfg.store_path.display().to_string(),
            format!("{}/{}s", cfg.max_calls, cfg.time_window_seconds),
            entry.http.url.clone(),
            if entry.http.headers.is_empty() {
                "none".to_string()
            } else {
                format!("{} configured", entry.http.headers.len())
            },
        ]);
    }
    eprintln!("{sources}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_run_flags() {
        let cli = Cli::try_parse_from([
            "harvline", "--debug", "run", "-s", "gerrit", "-s", "irc", "--parallel", "-l", "20",
        ])
        .unwrap();
        assert!(cli.debug);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.source, vec!["gerrit", "irc"]);
                assert!(args.parallel);
                assert_eq!(args.max_units, Some(20));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn ledger_requires_source() {
        assert!(Cli::try_parse_from(["harvline", "ledger"]).is_err());
    }
}
