//! The `RepoVision` service: the operations exposed to callers.
//!
//! Collaborators are injected as trait objects so tests can substitute
//! doubles; [`RepoVision::open`] wires the real clients from config.

use anyhow::Result;
use std::sync::Arc;

use crate::answer::{build_prompt, stream_answer, AnswerStream};
use crate::commits::{self, CommitContext, PollReport};
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{classify, Error};
use crate::github::{GitHubClient, RepoHost, RepoLocator};
use crate::index::{self, ReconcileReport};
use crate::ingest::{ingest_repository, IngestContext, IngestReport};
use crate::llm::{create_generator, Generator};
use crate::migrate;
use crate::models::{CommitRecord, Project, QuestionLog, RetrievedArtifact};
use crate::refresh::{CommitRefresher, RefreshDeps};
use crate::retrieval::retrieve;
use crate::store::Store;
use crate::summarize::Summarizer;

#[derive(Debug, Clone)]
pub struct CreateProject {
    pub repo_url: String,
    pub project_name: String,
    pub user_id: String,
    /// Used for this ingestion only; it is not persisted.
    pub access_token: Option<String>,
}

#[derive(Debug)]
pub struct CreatedProject {
    pub project: Project,
    pub ingest: IngestReport,
    /// `None` when the initial commit poll failed.
    pub commits: Option<PollReport>,
}

pub struct AskResponse {
    pub ranked: Vec<RetrievedArtifact>,
    pub answer: AnswerStream,
}

pub struct RepoVision {
    config: Arc<Config>,
    store: Store,
    host: Arc<dyn RepoHost>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    summarizer: Summarizer,
    refresher: CommitRefresher,
}

impl RepoVision {
    /// Assemble the service from explicit collaborators. Spawns the commit
    /// refresher, so it must run inside a Tokio runtime.
    pub fn new(
        config: Config,
        store: Store,
        host: Arc<dyn RepoHost>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        let config = Arc::new(config);
        let summarizer = Summarizer::new(generator.clone(), &config.ingest);
        let refresher = CommitRefresher::spawn(RefreshDeps {
            host: host.clone(),
            store: store.clone(),
            summarizer: summarizer.clone(),
            config: config.clone(),
        });

        Self {
            config,
            store,
            host,
            embedder,
            generator,
            summarizer,
            refresher,
        }
    }

    /// Connect to the configured database (migrating it) and build the
    /// GitHub, embedding and generation clients.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::apply(&pool).await?;

        let host: Arc<dyn RepoHost> = Arc::new(GitHubClient::new(&config.github)?);
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;

        Ok(Self::new(config, Store::new(pool), host, embedder, generator))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Stop the refresher (finishing queued refreshes) and close the pool.
    pub async fn shutdown(self) {
        self.refresher.shutdown().await;
        self.store.close().await;
    }

    fn ingest_context(&self) -> IngestContext<'_> {
        IngestContext {
            host: self.host.as_ref(),
            store: &self.store,
            embedder: self.embedder.as_ref(),
            summarizer: &self.summarizer,
            config: &self.config,
        }
    }

    fn commit_context(&self) -> CommitContext<'_> {
        CommitContext {
            host: self.host.as_ref(),
            store: &self.store,
            summarizer: &self.summarizer,
            config: &self.config,
        }
    }

    async fn require_project(&self, project_id: &str) -> Result<Project> {
        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("project {}", project_id)))?;
        Ok(project)
    }

    // ============ Projects ============

    /// Create a project, index its repository and record its recent commits.
    ///
    /// The project is kept when individual files fail; it is removed again
    /// when the repository cannot be listed at all. A failed commit poll is
    /// logged and reported as `commits: None`.
    pub async fn create_project(&self, request: CreateProject) -> Result<CreatedProject> {
        let name = request.project_name.trim();
        if name.is_empty() {
            return Err(Error::Input("project name is empty".to_string()).into());
        }
        if request.user_id.trim().is_empty() {
            return Err(Error::Input("user id is empty".to_string()).into());
        }
        let repo_url = request.repo_url.trim();
        let repo = RepoLocator::parse(repo_url)?.with_token(request.access_token);

        let project = self
            .store
            .create_project(name, repo_url, request.user_id.trim())
            .await?;
        tracing::info!(project = %project.id, repo = %repo.full_name(), "project created");

        let ingest = match ingest_repository(&self.ingest_context(), &project.id, &repo).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(project = %project.id, error = %format!("{:#}", e), "ingestion failed");
                if let Err(cleanup) = self.store.soft_delete_project(&project.id).await {
                    tracing::warn!(project = %project.id, error = %cleanup, "could not remove failed project");
                }
                return Err(e);
            }
        };

        let commits = match commits::poll_commits(&self.commit_context(), &project.id).await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(project = %project.id, error = %format!("{:#}", e), "initial commit poll failed");
                None
            }
        };

        Ok(CreatedProject {
            project,
            ingest,
            commits,
        })
    }

    /// Ingest an existing project's repository again. Unchanged files are
    /// skipped, changed files replaced and vanished files pruned.
    pub async fn reindex(&self, project_id: &str, access_token: Option<String>) -> Result<IngestReport> {
        let project = self.require_project(project_id).await?;
        let repo = RepoLocator::parse(&project.repo_url)?.with_token(access_token);
        ingest_repository(&self.ingest_context(), &project.id, &repo).await
    }

    /// Projects `user_id` is a member of, newest first.
    pub async fn list_projects(&self, user_id: &str) -> Result<Vec<Project>> {
        self.store.list_projects(user_id).await
    }

    /// Soft-delete a project.
    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        if !self.store.soft_delete_project(project_id).await? {
            return Err(Error::NotFound(format!("project {}", project_id)).into());
        }
        tracing::info!(project = project_id, "project deleted");
        Ok(())
    }

    // ============ Questions ============

    /// Retrieve the artifacts relevant to `question` and start streaming an
    /// answer grounded on them.
    ///
    /// Input and not-found errors are returned as they are; any other
    /// failure is reported as [`Error::AskFailed`] with the cause attached.
    pub async fn ask_question(&self, project_id: &str, question: &str) -> Result<AskResponse> {
        let question = question.trim();
        if question.is_empty() {
            return Err(Error::Input("question is empty".to_string()).into());
        }
        self.require_project(project_id).await?;

        let result = async {
            let ranked = retrieve(
                &self.store,
                self.embedder.as_ref(),
                &self.config.retrieval,
                project_id,
                question,
            )
            .await?;
            let prompt = build_prompt(question, &ranked);
            let answer = stream_answer(self.generator.as_ref(), &prompt).await?;
            Ok::<_, anyhow::Error>(AskResponse { ranked, answer })
        }
        .await;

        result.map_err(|e| match classify(&e) {
            Some(Error::Input(_)) | Some(Error::NotFound(_)) => e,
            _ => {
                tracing::warn!(project = project_id, error = %format!("{:#}", e), "question failed");
                e.context(Error::AskFailed)
            }
        })
    }

    /// Persist a question, its answer and the artifacts it was based on.
    pub async fn save_answer(
        &self,
        project_id: &str,
        user_id: &str,
        question: &str,
        answer: &str,
        ranked: &[RetrievedArtifact],
    ) -> Result<QuestionLog> {
        if question.trim().is_empty() {
            return Err(Error::Input("question is empty".to_string()).into());
        }
        if user_id.trim().is_empty() {
            return Err(Error::Input("user id is empty".to_string()).into());
        }
        self.require_project(project_id).await?;
        self.store
            .insert_question(project_id, user_id.trim(), question.trim(), answer, ranked)
            .await
    }

    /// Saved questions of a project, newest first.
    pub async fn get_questions(&self, project_id: &str) -> Result<Vec<QuestionLog>> {
        self.require_project(project_id).await?;
        self.store.list_questions(project_id).await
    }

    // ============ Commits ============

    /// Stored commits, newest first. Also queues a background refresh whose
    /// results show up on a later call.
    pub async fn get_commits(&self, project_id: &str) -> Result<Vec<CommitRecord>> {
        self.require_project(project_id).await?;
        let commits = self.store.list_commits(project_id).await?;
        self.refresher.request(project_id);
        Ok(commits)
    }

    /// Poll upstream commits now and wait for the result.
    pub async fn poll_commits(&self, project_id: &str) -> Result<PollReport> {
        commits::poll_commits(&self.commit_context(), project_id).await
    }

    // ============ Maintenance ============

    /// Attach vectors to artifacts that are missing one or carry one from
    /// a different embedding model.
    pub async fn reconcile(&self, project_id: &str) -> Result<ReconcileReport> {
        self.require_project(project_id).await?;
        index::reconcile(&self.store, self.embedder.as_ref(), project_id).await
    }
}
