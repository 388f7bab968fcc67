//! # Repo Vision CLI (`rv`)
//!
//! ## Usage
//!
//! ```bash
//! rv --config ./config/rv.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rv init` | Create the SQLite database and run schema migrations |
//! | `rv project create <url> --name <name> --user <id>` | Index a repository as a new project |
//! | `rv project list --user <id>` | List a user's projects |
//! | `rv project delete <id>` | Soft-delete a project |
//! | `rv ask <project> "<question>"` | Stream an answer grounded on the repository |
//! | `rv reindex <project>` | Index the repository again, skipping unchanged files |
//! | `rv commits <project>` | Show tracked commits and refresh them |
//! | `rv poll <project>` | Poll upstream commits now |
//! | `rv reconcile <project>` | Attach missing or stale embeddings |
//! | `rv questions <project>` | Show saved questions |
//!
//! Log verbosity follows `RUST_LOG` (default `info`); logs go to stderr so
//! answers on stdout can be piped.

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use repo_vision::config::{self, Config};
use repo_vision::models::RetrievedArtifact;
use repo_vision::service::{CreateProject, RepoVision};
use repo_vision::migrate;

/// Repo Vision: ask questions about a code repository.
#[derive(Parser)]
#[command(name = "rv", version, about = "Ask questions about a code repository")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rv.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Ask a question about a project's repository.
    Ask {
        project: String,
        question: String,

        /// Save the question, answer and references.
        #[arg(long)]
        save: bool,

        /// User recorded with a saved answer.
        #[arg(long, default_value = "local")]
        user: String,
    },

    /// Index a project's repository again, skipping unchanged files.
    Reindex {
        project: String,

        #[arg(long)]
        token: Option<String>,
    },

    /// List tracked commits, newest first, and refresh them in the background.
    Commits { project: String },

    /// Poll upstream commits and wait for the result.
    Poll { project: String },

    /// Re-embed artifacts stored without a vector or with a stale one.
    Reconcile { project: String },

    /// List saved questions, newest first.
    Questions { project: String },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project from a repository URL and index it.
    Create {
        url: String,

        #[arg(long)]
        name: String,

        #[arg(long, default_value = "local")]
        user: String,

        /// Access token for private repositories; overrides the configured one.
        #[arg(long)]
        token: Option<String>,
    },

    /// List projects of a user.
    List {
        #[arg(long, default_value = "local")]
        user: String,
    },

    /// Soft-delete a project.
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("initialized {}", cfg.db.path.display());
        return Ok(());
    }

    let app = RepoVision::open(cfg.clone()).await?;
    let result = run(&app, &cfg, cli.command).await;
    app.shutdown().await;
    result
}

async fn run(app: &RepoVision, cfg: &Config, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {}
        Commands::Project { action } => match action {
            ProjectAction::Create {
                url,
                name,
                user,
                token,
            } => {
                let created = app
                    .create_project(CreateProject {
                        repo_url: url,
                        project_name: name,
                        user_id: user,
                        access_token: token,
                    })
                    .await?;
                let ingest = &created.ingest;
                println!("project {}", created.project.id);
                println!("  name: {}", created.project.name);
                println!("  files loaded: {}", ingest.files_loaded);
                println!("  unchanged: {}", ingest.unchanged);
                println!("  written: {}", ingest.written);
                println!("  staged (no vector): {}", ingest.staged);
                println!("  skipped: {}", ingest.skipped_fetch);
                println!("  failed: {}", ingest.failure_count());
                for failure in &ingest.failed {
                    println!("    {}: {}", failure.item, failure.error);
                }
                match created.commits {
                    Some(report) => println!("  commits recorded: {}", report.inserted),
                    None => println!("  commits recorded: none (poll failed, see log)"),
                }
                if ingest.staged > 0 {
                    println!("  run `rv reconcile {}` to embed staged files", created.project.id);
                }
            }
            ProjectAction::List { user } => {
                let projects = app.list_projects(&user).await?;
                if projects.is_empty() {
                    println!("no projects");
                }
                for project in projects {
                    println!("{}  {}  {}", project.id, project.name, project.repo_url);
                }
            }
            ProjectAction::Delete { id } => {
                app.delete_project(&id).await?;
                println!("deleted {}", id);
            }
        },
        Commands::Ask {
            project,
            question,
            save,
            user,
        } => {
            let response = app.ask_question(&project, &question).await?;
            print_references(&response.ranked, cfg.retrieval.similarity_threshold);

            let mut answer = String::new();
            let mut stream = response.answer;
            let mut stdout = std::io::stdout();
            println!();
            while let Some(fragment) = stream.next().await {
                let fragment = fragment?;
                print!("{}", fragment);
                stdout.flush()?;
                answer.push_str(&fragment);
            }
            println!();

            if save {
                let log = app
                    .save_answer(&project, &user, &question, &answer, &response.ranked)
                    .await?;
                println!("saved {}", log.id);
            }
        }
        Commands::Reindex { project, token } => {
            let report = app.reindex(&project, token).await?;
            println!("reindex {}", project);
            println!("  files loaded: {}", report.files_loaded);
            println!("  unchanged: {}", report.unchanged);
            println!("  written: {}", report.written);
            println!("  staged (no vector): {}", report.staged);
            println!("  pruned: {}", report.pruned);
            println!("  failed: {}", report.failure_count());
            for failure in &report.failed {
                println!("    {}: {}", failure.item, failure.error);
            }
        }
        Commands::Commits { project } => {
            let commits = app.get_commits(&project).await?;
            if commits.is_empty() {
                println!("no commits recorded yet");
            }
            for commit in commits {
                let when = chrono::DateTime::from_timestamp(commit.committed_at, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                let title = commit.message.lines().next().unwrap_or_default();
                let short = commit.hash.get(..7).unwrap_or(&commit.hash);
                println!("{}  {}  {}  {}", short, when, commit.author_name, title);
                for line in commit.summary.lines() {
                    println!("    {}", line);
                }
            }
        }
        Commands::Poll { project } => {
            let report = app.poll_commits(&project).await?;
            println!("poll {}", project);
            println!("  fetched: {}", report.fetched);
            println!("  new: {}", report.new);
            println!("  inserted: {}", report.inserted);
            println!("  duplicates: {}", report.duplicates);
            println!("  summary failures: {}", report.summary_failures);
        }
        Commands::Reconcile { project } => {
            let report = app.reconcile(&project).await?;
            println!("reconcile {}", project);
            println!("  pending: {}", report.pending);
            println!("  repaired: {}", report.repaired);
            println!("  failed: {}", report.failed.len());
            for failure in &report.failed {
                println!("    {}: {}", failure.item, failure.error);
            }
        }
        Commands::Questions { project } => {
            let questions = app.get_questions(&project).await?;
            if questions.is_empty() {
                println!("no saved questions");
            }
            for q in questions {
                println!("[{}] {}", q.id, q.question);
                println!("  answer: {}", q.answer.lines().next().unwrap_or_default());
                println!("  references: {}", q.references.len());
            }
        }
    }
    Ok(())
}

fn print_references(ranked: &[RetrievedArtifact], threshold: f32) {
    if ranked.is_empty() {
        eprintln!(
            "Warning: no file scored above {:.2}; the answer has no repository context",
            threshold
        );
        return;
    }
    println!("references:");
    for hit in ranked {
        println!("  {:.3}  {}", hit.similarity, hit.path);
    }
}
