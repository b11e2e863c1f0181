use anyhow::{bail, Result};
use saberetl::{config::PipelineConfig, consolidate, load, lookup, lookup::LookupTable, merge};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();
    info!("startup");

    // ─── 2) parse args, build config ─────────────────────────────────
    let mut steps: Vec<String> = ["consolidate", "lookup", "merge", "load"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut cfg = PipelineConfig::from_env();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--steps" => {
                let list = args.next().unwrap_or_default();
                steps = list
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "--table" => {
                if let Some(table) = args.next() {
                    cfg.table = table;
                }
            }
            "--replace" => cfg.replace = true,
            other => bail!("unknown argument: {other} (expected --steps, --table, --replace)"),
        }
    }
    info!(?steps, data_dir = %cfg.data_dir.display(), "configured");

    // ─── 3) run stages in order ──────────────────────────────────────
    // Each stage is an idempotent unit taking the prior stage's outputs;
    // a failure aborts everything after it.
    let mut consolidated: Option<PathBuf> = None;
    let mut lookup_table: Option<LookupTable> = None;
    let mut enriched: Option<PathBuf> = None;

    if steps.iter().any(|s| s == "consolidate") {
        let summary = consolidate::run(&cfg, None, None)?;
        info!(result = %serde_json::to_string(&summary)?, "consolidate done");
        consolidated = Some(summary.path);
    }

    if steps.iter().any(|s| s == "lookup") {
        let raw = cfg.lookup_raw_path();
        let (summary, table) = lookup::run(&cfg, &raw, None)?;
        info!(result = %serde_json::to_string(&summary)?, "lookup done");
        lookup_table = Some(table);
    }

    if steps.iter().any(|s| s == "merge") {
        let input = consolidated
            .clone()
            .unwrap_or_else(|| cfg.consolidated_path());
        // When the lookup stage ran in a previous invocation, its output
        // file is reloaded instead.
        let table = match lookup_table.take() {
            Some(table) => table,
            None => LookupTable::from_csv(&cfg.lookup_path())?,
        };
        let summary = merge::run(&cfg, &input, &table, None)?;
        info!(result = %serde_json::to_string(&summary)?, "merge done");
        enriched = Some(summary.path);
    }

    if steps.iter().any(|s| s == "load") {
        let table = cfg.table.clone();
        let summary = load::run(&cfg, enriched.as_deref(), &table, cfg.replace)?;
        info!(result = %serde_json::to_string(&summary)?, "load done");
    }

    info!("all done");
    Ok(())
}
