use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use dossier::config::{CompanyConfig, Settings, load_companies};
use dossier::error::DossierError;
use dossier::http::{Fetcher, ShutdownFlag};
use dossier::ingest::{self, trials};
use dossier::oracle::Oracle;
use dossier::sanitize::{Classifier, Lexicon};
use dossier::store::Store;

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<DossierError> for CliError {
    fn from(value: DossierError) -> Self {
        Self::new(value.code(), value.to_string())
    }
}

impl From<rusqlite::Error> for CliError {
    fn from(value: rusqlite::Error) -> Self {
        Self::new("sqlite_error", value.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "dossier")]
#[command(about = "Pharma pipeline intelligence: extract, canonicalize, link, diff")]
struct Cli {
    /// Settings YAML; in-code defaults apply when omitted.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Company roster YAML.
    #[arg(long, global = true, default_value = "configs/companies.yaml")]
    companies: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database and its schema.
    InitDb,
    /// Fetch and ingest a company's pipeline disclosure.
    IngestPipeline(CompanyArgs),
    /// Query the trial registry for a company's assets.
    IngestTrials(CompanyArgs),
    /// Re-sanitize a company's assets and aliases.
    Cleanup(CompanyArgs),
    /// List ingestion runs for a company.
    Runs(CompanyArgs),
    /// List recent change events for a company.
    Events(EventsArgs),
}

#[derive(Args, Debug)]
struct CompanyArgs {
    #[arg(long)]
    company: String,
}

#[derive(Args, Debug)]
struct EventsArgs {
    #[arg(long)]
    company: String,
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dossier=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.settings.as_deref())?;
    match cli.command {
        Command::InitDb => cmd_init_db(&settings),
        Command::IngestPipeline(args) => cmd_ingest_pipeline(&cli.companies, &settings, &args),
        Command::IngestTrials(args) => cmd_ingest_trials(&cli.companies, &settings, &args),
        Command::Cleanup(args) => cmd_cleanup(&settings, &args),
        Command::Runs(args) => cmd_runs(&settings, &args),
        Command::Events(args) => cmd_events(&settings, &args),
    }
}

fn open_store(settings: &Settings) -> Result<Store, CliError> {
    if let Some(parent) = settings.db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| CliError::new("io_error", err.to_string()))?;
    }
    Ok(Store::open(&settings.db_path)?)
}

fn company_config(path: &PathBuf, company_id: &str) -> Result<CompanyConfig, CliError> {
    let mut companies = load_companies(path)?;
    companies.remove(company_id).ok_or_else(|| {
        CliError::new(
            "unknown_company",
            format!("company `{company_id}` is not in {}", path.display()),
        )
    })
}

fn cmd_init_db(settings: &Settings) -> Result<(), CliError> {
    let _ = open_store(settings)?;
    print_json(&json!({
        "status": "ok",
        "db_path": settings.db_path,
        "evidence_root": settings.evidence_root,
    }))
}

fn cmd_ingest_pipeline(
    companies: &PathBuf,
    settings: &Settings,
    args: &CompanyArgs,
) -> Result<(), CliError> {
    let company = company_config(companies, &args.company)?;
    let store = open_store(settings)?;
    let shutdown = ShutdownFlag::install();
    let fetcher = Fetcher::new(settings, shutdown)?;
    let oracle = Oracle::from_settings(settings)?;

    let summary = ingest::ingest_pipeline(&store, settings, &company, &fetcher, &oracle)?;
    print_json(&json!({
        "status": "ok",
        "run_id": summary.run_id,
        "company": company.company_id,
        "assets_seen": summary.assets_seen,
        "rows_parsed": summary.rows_parsed,
        "as_of_date": summary.as_of_date,
    }))
}

fn cmd_ingest_trials(
    companies: &PathBuf,
    settings: &Settings,
    args: &CompanyArgs,
) -> Result<(), CliError> {
    let company = company_config(companies, &args.company)?;
    let store = open_store(settings)?;
    let shutdown = ShutdownFlag::install();
    let fetcher = Fetcher::new(settings, shutdown)?;

    let summary = trials::ingest_trials(&store, settings, &company, &fetcher)?;
    print_json(&json!({
        "status": "ok",
        "run_id": summary.run_id,
        "company": company.company_id,
        "trials_seen": summary.trials_seen,
        "inserted": summary.inserted,
        "updated": summary.updated,
        "status_changed": summary.status_changed,
        "bad_aliases": summary.bad_aliases,
        "bootstrapped": summary.bootstrapped,
    }))
}

fn cmd_cleanup(settings: &Settings, args: &CompanyArgs) -> Result<(), CliError> {
    let store = open_store(settings)?;
    let classifier = Classifier::new(Lexicon::with_overlay(&settings.lexicon));
    let stats = store.clean_company(&classifier, &args.company)?;
    print_json(&json!({
        "status": "ok",
        "company": args.company,
        "assets_seen": stats.assets_seen,
        "hidden": stats.hidden,
        "renamed": stats.renamed,
        "merged": stats.merged,
        "aliases_dropped": stats.aliases_dropped,
    }))
}

fn cmd_runs(settings: &Settings, args: &CompanyArgs) -> Result<(), CliError> {
    let store = open_store(settings)?;
    for run in store.runs_for_company(&args.company)? {
        print_json(&json!({
            "id": run.id,
            "run_type": run.run_type,
            "started_at": run.started_at,
            "finished_at": run.finished_at,
            "status": run.status,
            "notes": run.notes,
        }))?;
    }
    Ok(())
}

fn cmd_events(settings: &Settings, args: &EventsArgs) -> Result<(), CliError> {
    let store = open_store(settings)?;
    for event in store.recent_events(&args.company, args.limit)? {
        print_json(&json!({
            "id": event.id,
            "event_type": event.event_type,
            "occurred_at": event.occurred_at,
            "payload": event.payload,
            "evidence_id": event.evidence_id,
            "asset_id": event.asset_id,
            "trial_id": event.trial_id,
        }))?;
    }
    Ok(())
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}
