//! Background commit refresh.
//!
//! [`CommitRefresher`] owns a single worker task fed by a bounded queue of
//! project ids. [`CommitRefresher::request`] never blocks: a project that is
//! already queued is not queued twice, and a full queue drops the request
//! with a warning. Each refresh runs [`poll_commits`] under the
//! `[refresh]` retry policy; failures are logged and never reach callers.
//!
//! With `refresh.interval_secs` set, the worker also queues every active
//! project on that interval, starting one full interval after spawn.
//!
//! Shutdown cancels the worker's token. The worker finishes the refresh in
//! progress, then drains the explicitly requested refreshes still queued;
//! projects queued only by the interval sweep are dropped. Dropping the
//! refresher cancels it the same way without waiting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;

use crate::commits::{poll_commits, CommitContext};
use crate::config::Config;
use crate::github::RepoHost;
use crate::retry::with_retry;
use crate::store::Store;
use crate::summarize::Summarizer;

/// Owned collaborators the worker polls with.
#[derive(Clone)]
pub struct RefreshDeps {
    pub host: Arc<dyn RepoHost>,
    pub store: Store,
    pub summarizer: Summarizer,
    pub config: Arc<Config>,
}

/// Who queued a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Requested,
    Sweep,
}

#[derive(Clone)]
struct Intake {
    tx: mpsc::Sender<String>,
    pending: Arc<Mutex<HashMap<String, Origin>>>,
}

impl Intake {
    fn request(&self, project_id: &str, origin: Origin) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(queued) = pending.get_mut(project_id) {
            if origin == Origin::Requested {
                *queued = Origin::Requested;
            }
            return true;
        }
        match self.tx.try_send(project_id.to_string()) {
            Ok(()) => {
                pending.insert(project_id.to_string(), origin);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(project = project_id, "refresh queue full; request dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Called when the worker takes `project_id` off the queue, so requests
    /// arriving during the poll queue a fresh one.
    fn release(&self, project_id: &str) -> Origin {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(project_id)
            .unwrap_or(Origin::Requested)
    }
}

pub struct CommitRefresher {
    intake: Intake,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl CommitRefresher {
    /// Start the worker on the current Tokio runtime.
    pub fn spawn(deps: RefreshDeps) -> Self {
        let (tx, rx) = mpsc::channel(deps.config.refresh.queue_capacity.max(1));
        let intake = Intake {
            tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
        };
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run(deps, rx, intake.clone(), cancel.clone()));

        Self {
            intake,
            cancel,
            worker: Some(worker),
        }
    }

    /// Queue a refresh of `project_id`. Returns false only when the request
    /// was dropped.
    pub fn request(&self, project_id: &str) -> bool {
        self.intake.request(project_id, Origin::Requested)
    }

    /// Stop the worker after it drains the requested refreshes.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "refresh worker ended abnormally");
            }
        }
    }
}

impl Drop for CommitRefresher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    deps: RefreshDeps,
    mut rx: mpsc::Receiver<String>,
    intake: Intake,
    cancel: CancellationToken,
) {
    let mut sweep = deps.config.refresh.interval_secs.and_then(|secs| {
        let period = Duration::from_secs(secs.max(1));
        let start = Instant::now().checked_add(period)?;
        Some(tokio::time::interval_at(start, period))
    });

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(project_id) = rx.recv() => {
                intake.release(&project_id);
                refresh_one(&deps, &project_id).await;
            }
            () = tick(&mut sweep) => queue_active_projects(&deps, &intake).await,
        }
    }

    rx.close();
    while let Ok(project_id) = rx.try_recv() {
        match intake.release(&project_id) {
            Origin::Requested => refresh_one(&deps, &project_id).await,
            Origin::Sweep => tracing::debug!(project = %project_id, "dropping swept refresh"),
        }
    }
    tracing::debug!("refresh worker stopped");
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn queue_active_projects(deps: &RefreshDeps, intake: &Intake) {
    match deps.store.list_active_projects().await {
        Ok(projects) => {
            for project in projects {
                intake.request(&project.id, Origin::Sweep);
            }
        }
        Err(e) => tracing::warn!(error = %format!("{:#}", e), "refresh sweep failed"),
    }
}

async fn refresh_one(deps: &RefreshDeps, project_id: &str) {
    let ctx = CommitContext {
        host: deps.host.as_ref(),
        store: &deps.store,
        summarizer: &deps.summarizer,
        config: &deps.config,
    };

    let result = with_retry(deps.config.refresh.retry_policy(), "commit refresh", || {
        poll_commits(&ctx, project_id)
    })
    .await;

    match result {
        Ok(report) => tracing::debug!(
            project = project_id,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "commit refresh finished"
        ),
        Err(e) => tracing::warn!(
            project = project_id,
            error = %format!("{:#}", e),
            "commit refresh failed"
        ),
    }
}
