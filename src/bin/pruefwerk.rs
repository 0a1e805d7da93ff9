use std::{fs, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::{Parser, Subcommand, ValueEnum};
use pruefwerk::{
    eval::{
        compare_to_baseline,
        report::{format_score, render_regression, render_run},
        save_baseline, ContainsExpected, Dataset, EvalRunner, EvalStore, HttpExecutor,
        JsonDirStore, MetadataPolicy, RunOptions, RunSnapshot, SetEquality,
    },
    EvalConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "pruefwerk")]
#[command(about = "Run agent evaluation datasets, track runs and compare against baselines")]
struct Args {
    /// Directory holding datasets, runs and baselines
    #[arg(long, global = true, default_value = ".pruefwerk")]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute every case of a dataset file against an HTTP agent
    Run {
        /// Dataset JSON file; it is imported into the store before the run
        #[arg(long)]
        dataset: PathBuf,

        /// Endpoint receiving `{"messages": [...]}`
        #[arg(long)]
        agent_url: String,

        #[arg(long)]
        name: Option<String>,

        /// Cases executed at once (defaults to PRUEFWERK_MAX_WORKERS or 1)
        #[arg(long)]
        max_workers: Option<usize>,

        /// Only run these case ids (repeatable)
        #[arg(long = "case-id")]
        case_ids: Vec<String>,

        /// Per-case timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Compare expected metadata with this checker
        #[arg(long, value_enum)]
        metadata_check: Option<MetadataCheck>,

        /// Fail the metadata gate when the agent reports none
        #[arg(long)]
        strict_metadata: bool,
    },
    /// Judge a single already produced output
    Eval {
        #[arg(long)]
        input: String,

        #[arg(long)]
        output: String,

        #[arg(long)]
        expected: String,

        #[arg(long)]
        name: Option<String>,
    },
    /// List runs, newest first
    Runs {
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Show a run with its results
    Show { run_id: Uuid },
    #[command(subcommand)]
    Baseline(BaselineCommand),
}

#[derive(Subcommand)]
enum BaselineCommand {
    /// Make a completed run the dataset's baseline
    Save { dataset_id: String, run_id: Uuid },
    /// Compare a run against the dataset's baseline
    Compare { dataset_id: String, run_id: Uuid },
}

#[derive(Clone, Copy, ValueEnum)]
enum MetadataCheck {
    /// Every expected key must match as an unordered set
    Set,
    /// Every expected item must be present, extra items are allowed
    Contains,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pruefwerk=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let store: Arc<dyn EvalStore> = Arc::new(JsonDirStore::open(&args.store).await?);

    match args.command {
        Command::Run {
            dataset,
            agent_url,
            name,
            max_workers,
            case_ids,
            timeout_ms,
            metadata_check,
            strict_metadata,
        } => {
            let dataset: Dataset = serde_json::from_str(&fs::read_to_string(&dataset)?)?;
            let dataset_id = dataset.id.clone();
            store.put_dataset(dataset).await?;

            let runner = EvalRunner::new(store, EvalConfig::from_env())?;
            let executor = Arc::new(HttpExecutor::new(agent_url)?);

            let mut options = RunOptions::new();
            if let Some(name) = name {
                options = options.with_eval_name(name);
            }
            if let Some(workers) = max_workers {
                options = options.with_concurrency(workers);
            }
            if !case_ids.is_empty() {
                options = options.with_case_ids(case_ids);
            }
            if let Some(ms) = timeout_ms {
                options = options.with_case_timeout(Duration::from_millis(ms));
            }
            if strict_metadata {
                options = options.with_metadata_policy(MetadataPolicy::Strict);
            }
            options = match metadata_check {
                Some(MetadataCheck::Set) => options.with_metadata_checker(SetEquality::all_keys()),
                Some(MetadataCheck::Contains) => options.with_metadata_checker(ContainsExpected),
                None => options,
            };

            let outcome = runner.run_to_completion(&dataset_id, executor, options).await?;
            print!("{}", render_run(&outcome.run, &outcome.results));
            if let Some(report) = &outcome.regression {
                println!("{}", render_regression(report));
            }
            Ok(exit_code(outcome.is_clean()))
        }
        Command::Eval {
            input,
            output,
            expected,
            name,
        } => {
            let runner = EvalRunner::new(store, EvalConfig::from_env())?;
            let outcome = runner
                .evaluate_single(&input, &output, &expected, name.as_deref())
                .await?;
            print!("{}", render_run(&outcome.run, &outcome.results));
            Ok(exit_code(outcome.is_clean()))
        }
        Command::Runs { dataset } => {
            for run in store.list_runs(dataset.as_deref()).await? {
                println!(
                    "{}  {:<9}  {:<20}  {}/{}  {}",
                    run.id,
                    run.status.to_string(),
                    run.dataset_id.as_deref().unwrap_or("(ad-hoc)"),
                    run.passed,
                    run.total,
                    format_score(run.score)
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Show { run_id } => match RunSnapshot::load(store.as_ref(), run_id).await? {
            Some(snapshot) => {
                print!("{}", render_run(&snapshot.run, &snapshot.results));
                Ok(ExitCode::SUCCESS)
            }
            None => {
                eprintln!("run {run_id} not found");
                Ok(ExitCode::FAILURE)
            }
        },
        Command::Baseline(BaselineCommand::Save { dataset_id, run_id }) => {
            let baseline = save_baseline(store.as_ref(), &dataset_id, run_id).await?;
            println!(
                "baseline for {} saved from run {} ({}/{} passed, score {})",
                baseline.dataset_id,
                baseline.source_run_id,
                baseline.passed,
                baseline.total,
                format_score(baseline.score)
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Baseline(BaselineCommand::Compare { dataset_id, run_id }) => {
            let report = compare_to_baseline(store.as_ref(), &dataset_id, run_id).await?;
            println!("{}", render_regression(&report));
            Ok(exit_code(!report.has_regressions()))
        }
    }
}

fn exit_code(clean: bool) -> ExitCode {
    if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
