//! `rl` — command surface over the RunLedger experiment catalog.
//!
//! One `record` invocation maps to one session: stage everything passed on
//! the command line, commit once, print the assigned id. `best`, `show` and
//! `list` only read committed data.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use runledger_core::{parse_rfc3339_utc, ExperimentRecord, ExperimentSummary, SortOrder};
use runledger_store_sqlite::ExperimentCatalog;

pub mod capture;

use capture::output_sink;

#[derive(Debug, Parser)]
#[command(name = "rl")]
#[command(about = "RunLedger: tidy up your machine learning experiments")]
pub struct Cli {
    #[arg(long, default_value = "./runledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Commit one experiment run with its parameters, outputs, scores and
    /// features.
    Record(RecordArgs),
    /// Rank committed experiments by a score label.
    Best(BestArgs),
    /// Look up one committed experiment by id.
    Show(ShowArgs),
    /// List all committed experiments.
    List,
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    comment: Option<String>,
    /// RFC 3339 timestamp of the run; defaults to now.
    #[arg(long)]
    recorded_at: Option<String>,
    #[arg(long = "param", value_name = "NAME=VALUE")]
    params: Vec<String>,
    #[arg(long = "output", value_name = "LABEL=PATH")]
    outputs: Vec<String>,
    #[arg(long = "score", value_name = "LABEL=VALUE")]
    scores: Vec<String>,
    #[arg(long = "feature", value_name = "NAME=VALUE")]
    features: Vec<String>,
    /// Also append everything printed to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct BestArgs {
    #[arg(long)]
    score_label: String,
    #[arg(long, value_enum, default_value_t = OrderArg::Max)]
    order: OrderArg,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
    /// Also append everything printed to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    id: i64,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OrderArg {
    Max,
    Min,
}

impl From<OrderArg> for SortOrder {
    fn from(value: OrderArg) -> Self {
        match value {
            OrderArg::Max => Self::Max,
            OrderArg::Min => Self::Min,
        }
    }
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let mut catalog = ExperimentCatalog::open(&cli.db)?;

    match cli.command {
        Command::Record(args) => run_record(&mut catalog, &args),
        Command::Best(args) => run_best(&catalog, &args),
        Command::Show(args) => run_show(&catalog, &args),
        Command::List => run_list(&catalog),
    }
}

fn run_record(catalog: &mut ExperimentCatalog, args: &RecordArgs) -> Result<()> {
    let recorded_at = args
        .recorded_at
        .as_deref()
        .map(parse_rfc3339_utc)
        .transpose()?;

    let mut session = catalog.begin(&args.name, args.comment.as_deref(), recorded_at)?;
    session.set_parameters(parse_entries(&args.params, "--param")?)?;
    session.set_outputs(parse_entries(&args.outputs, "--output")?)?;
    session.set_scores(parse_entries(&args.scores, "--score")?)?;
    session.set_features(parse_entries(&args.features, "--feature")?)?;
    let experiment_id = session.commit()?;

    let mut out = output_sink(args.log_file.as_deref())?;
    writeln!(out, "{}", serde_json::json!({ "experiment_id": experiment_id }))?;
    Ok(())
}

fn run_best(catalog: &ExperimentCatalog, args: &BestArgs) -> Result<()> {
    let ranked = catalog.best_experiments(&args.score_label, args.order.into(), args.limit)?;

    let mut out = output_sink(args.log_file.as_deref())?;
    if args.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&ranked)?)?;
    } else {
        for (index, record) in ranked.iter().enumerate() {
            let banner = format!("TOP {} EXPERIMENT", index + 1);
            print_record_tables(&mut *out, &banner, record)?;
        }
    }
    Ok(())
}

fn run_show(catalog: &ExperimentCatalog, args: &ShowArgs) -> Result<()> {
    let record = catalog
        .get_experiment(args.id)?
        .ok_or_else(|| anyhow!("no experiment with id {}", args.id))?;

    let mut out = output_sink(None)?;
    if args.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&record)?)?;
    } else {
        let banner = format!("EXPERIMENT {}", args.id);
        print_record_tables(&mut *out, &banner, &record)?;
    }
    Ok(())
}

fn run_list(catalog: &ExperimentCatalog) -> Result<()> {
    let summaries = catalog.list_experiments()?;

    let mut out = output_sink(None)?;
    writeln!(out, "{:<6} {:<22} {:<24} comment", "id", "recorded_at", "name")?;
    writeln!(out, "{}", "-".repeat(78))?;
    for summary in &summaries {
        print_summary_line(&mut *out, summary)?;
    }
    Ok(())
}

fn print_summary_line(out: &mut dyn Write, summary: &ExperimentSummary) -> Result<()> {
    writeln!(
        out,
        "{:<6} {:<22} {:<24} {}",
        summary.experiment_id,
        summary.recorded_at,
        summary.name,
        summary.comment.as_deref().unwrap_or("n/a")
    )?;
    Ok(())
}

fn print_record_tables(out: &mut dyn Write, banner: &str, record: &ExperimentRecord) -> Result<()> {
    writeln!(out, "{}", "═".repeat(banner.chars().count() + 4))?;
    writeln!(out, "│ {banner} │")?;
    writeln!(out, "{}", "═".repeat(banner.chars().count() + 4))?;
    writeln!(
        out,
        "id={} name={} comment={} recorded_at={}",
        record.experiment.experiment_id,
        record.experiment.name,
        record.experiment.comment.as_deref().unwrap_or("n/a"),
        record.experiment.recorded_at
    )?;

    print_text_table(out, "parameters", &record.parameters)?;
    print_text_table(out, "outputs", &record.outputs)?;
    if !record.scores.is_empty() {
        writeln!(out, "scores:")?;
        for (label, value) in &record.scores {
            writeln!(out, "  {label:<28} {value}")?;
        }
    }
    print_text_table(out, "features", &record.features)?;
    writeln!(out)?;
    Ok(())
}

fn print_text_table(
    out: &mut dyn Write,
    title: &str,
    entries: &BTreeMap<String, String>,
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    writeln!(out, "{title}:")?;
    for (name, value) in entries {
        writeln!(out, "  {name:<28} {value}")?;
    }
    Ok(())
}

fn parse_entries(raw_entries: &[String], flag: &str) -> Result<Vec<(String, String)>> {
    raw_entries
        .iter()
        .map(|raw| {
            let (name, value) = raw
                .split_once('=')
                .with_context(|| format!("{flag} expects NAME=VALUE, got '{raw}'"))?;
            Ok((name.to_string(), value.to_string()))
        })
        .collect()
}
