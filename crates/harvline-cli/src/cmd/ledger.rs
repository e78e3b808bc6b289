//! `harvline ledger` - inspect what a source already has, without harvesting

use anyhow::Result;
use clap::Args;
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

use harvline_core::progress::fmt_num;
use harvline_core::{LedgerPaths, load_exclusions};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct LedgerArgs {
    /// Source name from the config
    #[arg(short, long)]
    pub source: String,
}

pub fn run(args: LedgerArgs, config: &Config) -> Result<()> {
    let entry = config.find(&args.source)?;
    let cfg = config.source_config(entry);
    let paths = LedgerPaths::discover(&cfg.store_path, &cfg.backup_dir, &cfg.artifacts);
    let (set, stats) = load_exclusions(&paths, &cfg.name, &cfg.identity)?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Kind").fg(Color::Cyan),
            Cell::new("File").fg(Color::Cyan),
            Cell::new("Lines").fg(Color::Cyan),
            Cell::new("New keys").fg(Color::Cyan),
            Cell::new("Malformed").fg(Color::Cyan),
            Cell::new("Unkeyed").fg(Color::Cyan),
        ]);
    for f in &stats.files {
        table.add_row(vec![
            f.kind.to_string(),
            f.path.display().to_string(),
            fmt_num(f.lines),
            fmt_num(f.new_keys),
            f.malformed.to_string(),
            f.unkeyed.to_string(),
        ]);
    }
    eprintln!("\n{table}");

    eprintln!(
        "{}: {} known keys ({} strong, {} weak) from {} files, {} backups",
        cfg.name,
        fmt_num(set.len()),
        fmt_num(set.strong_len()),
        fmt_num(set.weak_len()),
        stats.files.len(),
        stats.backups()
    );
    if !cfg.store_path.exists() {
        eprintln!("{} does not exist yet; next run starts fresh", cfg.store_path.display());
    }
    Ok(())
}
