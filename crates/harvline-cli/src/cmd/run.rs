//! `harvline run` - harvest configured sources

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;
use rayon::prelude::*;

use harvline_core::{
    HarvestContext, HarvestSummary, Harvester, SharedProgress, SourceConfig, StoreError,
    SystemClock, is_shutdown_requested, run_stamp, summary_table,
};
use harvline_http::JsonHttpAdapter;

use crate::config::Config;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Source to harvest (repeatable; default: every configured source)
    #[arg(short, long)]
    pub source: Vec<String>,

    /// Harvest sources concurrently
    #[arg(long)]
    pub parallel: bool,

    /// Stop each source after this many units
    #[arg(short = 'l', long)]
    pub max_units: Option<usize>,
}

/// One source ready to harvest.
struct Job {
    config: SourceConfig,
    adapter: JsonHttpAdapter,
}

fn plan(args: &RunArgs, config: &Config) -> Result<Vec<Job>> {
    let entries = if args.source.is_empty() {
        config.sources.iter().collect::<Vec<_>>()
    } else {
        args.source
            .iter()
            .map(|name| config.find(name))
            .collect::<Result<Vec<_>>>()?
    };
    if entries.is_empty() {
        bail!("No sources configured (add [[source]] tables to harvline.toml)");
    }

    entries
        .into_iter()
        .map(|entry| {
            let mut source_config = config.source_config(entry);
            if args.max_units.is_some() {
                source_config.max_units = args.max_units;
            }
            let adapter = JsonHttpAdapter::new(entry.name.as_str(), entry.http.clone())
                .with_context(|| format!("Failed to set up source {}", entry.name))?;
            Ok(Job {
                config: source_config,
                adapter,
            })
        })
        .collect()
}

pub fn run(args: RunArgs, config: &Config, progress: &SharedProgress) -> Result<()> {
    let jobs = plan(&args, config)?;
    let ctx = HarvestContext::new(
        Arc::new(SystemClock),
        progress.clone(),
        run_stamp(chrono::Utc::now()),
    );
    log::info!("Run {}: {} source(s)", ctx.run_stamp, jobs.len());

    let harvest = |job: &Job| -> (String, Result<HarvestSummary, StoreError>) {
        let result = Harvester::new(&ctx, &job.config).run(&job.adapter);
        (job.config.name.clone(), result)
    };

    let results: Vec<_> = if args.parallel {
        jobs.par_iter().map(harvest).collect()
    } else {
        let mut results = Vec::with_capacity(jobs.len());
        for job in &jobs {
            if is_shutdown_requested() {
                log::warn!("Shutdown requested, skipping {}", job.config.name);
                continue;
            }
            results.push(harvest(job));
        }
        results
    };

    let mut summaries = Vec::new();
    let mut errors = Vec::new();
    for (name, result) in results {
        match result {
            Ok(summary) => {
                summary.log();
                summaries.push(summary);
            }
            Err(e) => errors.push(format!("{name}: {e}")),
        }
    }

    if !summaries.is_empty() {
        eprintln!("\n{}", summary_table(&summaries));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        for e in &errors {
            log::error!("{e}");
        }
        bail!("{} source(s) failed", errors.len())
    }
}
