use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::models::{EvaluationFilter, NewJudge, Provider};
use crate::progress::ProgressReporter;
use crate::results::{export_evaluations_csv, EvaluationStats};
use crate::submissions::parse_submission_upload;
use crate::{cli::CommonArgs, create_app_state, open_judgeflow_pool, AppState};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    pub common_args: CommonArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a JSON file of submissions
    Upload {
        #[arg(long)]
        file: PathBuf,
    },

    /// Manage judges
    Judges {
        #[command(subcommand)]
        command: JudgeCommands,
    },

    /// Replace the judges assigned to a question in a queue
    Assign {
        #[arg(long)]
        queue: String,

        #[arg(long)]
        question: String,

        /// Judge id; repeat for several judges
        #[arg(long = "judge")]
        judges: Vec<String>,
    },

    /// Run every assigned judge over a queue
    Run {
        #[arg(long)]
        queue: String,
    },

    /// Show or export evaluation results
    Results {
        #[arg(long)]
        queue: Option<String>,

        #[arg(long, value_enum, default_value_t = ResultsFormat::Text)]
        format: ResultsFormat,

        /// Where to write CSV output (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum JudgeCommands {
    List,
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        model: String,

        #[arg(long)]
        provider: Provider,

        /// Rubric given to the model as its system prompt
        #[arg(long, conflicts_with = "system_prompt_file")]
        system_prompt: Option<String>,

        #[arg(long)]
        system_prompt_file: Option<PathBuf>,
    },
    Activate {
        id: String,
    },
    Deactivate {
        id: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ResultsFormat {
    Text,
    Csv,
}

pub async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    run_app().await
}

pub async fn run_app() -> Result<()> {
    let cli = Cli::parse();

    let pool = open_judgeflow_pool(&cli.common_args.db).with_context(|| {
        format!("Failed to open database {}", cli.common_args.db.display())
    })?;
    let state = create_app_state(cli.common_args.app_config(pool))?;

    match cli.command {
        Commands::Upload { file } => upload(&state, &file).await?,
        Commands::Judges { command } => judges(&state, command).await?,
        Commands::Assign {
            queue,
            question,
            judges,
        } => {
            let assignment = state
                .store
                .save_assignment(&queue, &question, judges)
                .await?;
            println!(
                "Assigned {} judge(s) to question {} in queue {}",
                assignment.judge_ids.len(),
                question,
                queue
            );
        }
        Commands::Run { queue } => run(state, &queue).await?,
        Commands::Results {
            queue,
            format,
            output,
        } => results(&state, queue, format, output).await?,
    }

    Ok(())
}

async fn upload(state: &AppState, file: &Path) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let submissions = parse_submission_upload(&text)?;
    let stored = state.store.upload_submissions(submissions).await?;
    println!("Successfully uploaded {} submission(s)", stored.len());
    Ok(())
}

async fn judges(state: &AppState, command: JudgeCommands) -> Result<()> {
    match command {
        JudgeCommands::List => {
            let judges = state.store.get_judges().await?;
            if judges.is_empty() {
                println!("No judges configured");
            }
            for judge in judges {
                println!(
                    "{}  {:<24} {:<10} {:<28} {}",
                    judge.id,
                    judge.name,
                    judge.provider,
                    judge.model_name,
                    if judge.active { "active" } else { "inactive" }
                );
            }
        }
        JudgeCommands::Add {
            name,
            model,
            provider,
            system_prompt,
            system_prompt_file,
        } => {
            let system_prompt = match (system_prompt, system_prompt_file) {
                (Some(prompt), _) => prompt,
                (None, Some(path)) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| {
                        format!("Failed to read {}", path.display())
                    })?,
                (None, None) => {
                    anyhow::bail!(
                        "Provide --system-prompt or --system-prompt-file"
                    )
                }
            };
            let judge = state
                .store
                .create_judge(NewJudge {
                    name,
                    system_prompt,
                    model_name: model,
                    provider,
                })
                .await?;
            println!("Created judge {} ({})", judge.name, judge.id);
        }
        JudgeCommands::Activate { id } => {
            let judge = state.store.set_judge_active(&id, true).await?;
            println!("Judge {} is now active", judge.name);
        }
        JudgeCommands::Deactivate { id } => {
            let judge = state.store.set_judge_active(&id, false).await?;
            println!("Judge {} is now inactive", judge.name);
        }
    }
    Ok(())
}

async fn run(state: Arc<AppState>, queue: &str) -> Result<()> {
    info!("Running evaluations for queue {}", queue);
    let reporter = ProgressReporter::new();
    let cancel = CancellationToken::new();

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let mut rx = reporter.subscribe();
    let printer = tokio::spawn(async move {
        let mut last_processed = None;
        while rx.changed().await.is_ok() {
            let progress = rx.borrow_and_update().progress;
            if let Some(progress) = progress {
                if last_processed != Some(progress.processed()) {
                    last_processed = Some(progress.processed());
                    println!(
                        "[{}/{}] {} completed, {} failed",
                        progress.processed(),
                        progress.total,
                        progress.completed,
                        progress.failed
                    );
                }
            }
        }
    });

    let result = state
        .runner()
        .run_evaluations(queue, &reporter, &cancel)
        .await;
    drop(reporter);
    printer.await?;

    let report = result?;
    println!("{}", report.summary);
    Ok(())
}

async fn results(
    state: &AppState,
    queue: Option<String>,
    format: ResultsFormat,
    output: Option<PathBuf>,
) -> Result<()> {
    let evaluations = state
        .store
        .get_evaluations(&EvaluationFilter {
            queue_id: queue,
            ..Default::default()
        })
        .await?;

    match format {
        ResultsFormat::Text => {
            let stats = EvaluationStats::from_evaluations(&evaluations);
            println!(
                "Total: {}  Passed: {}  Failed: {}  Inconclusive: {}  Pass rate: {}%",
                stats.total,
                stats.passed,
                stats.failed,
                stats.inconclusive,
                stats.pass_rate
            );
            for evaluation in &evaluations {
                println!(
                    "{} {} {} [{}] {}",
                    evaluation.submission_id,
                    evaluation.question_id,
                    evaluation.judge_name,
                    evaluation.verdict,
                    evaluation.reasoning
                );
            }
        }
        ResultsFormat::Csv => {
            let csv_content = export_evaluations_csv(&evaluations)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, csv_content).await.with_context(
                        || format!("Failed to write {}", path.display()),
                    )?;
                    println!(
                        "Exported {} evaluation(s) to {}",
                        evaluations.len(),
                        path.display()
                    );
                }
                None => print!("{}", csv_content),
            }
        }
    }
    Ok(())
}
