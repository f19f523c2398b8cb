//! Bounded-parallel execution of independent mutating tasks.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use thiserror::Error;
use tracing::{info, warn};

use crate::actions;
use crate::error::ApiError;
use crate::session::Session;
use crate::upload::{ChunkedUpload, UploadError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Edit { text: String, summary: String },
    Delete { reason: String },
    Undelete { reason: String },
    Upload {
        path: PathBuf,
        description: String,
        summary: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub title: String,
    pub kind: TaskKind,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl Task {
    pub fn edit(title: &str, text: &str, summary: &str) -> Self {
        Self {
            title: title.to_string(),
            kind: TaskKind::Edit {
                text: text.to_string(),
                summary: summary.to_string(),
            },
        }
    }

    pub fn delete(title: &str, reason: &str) -> Self {
        Self {
            title: title.to_string(),
            kind: TaskKind::Delete {
                reason: reason.to_string(),
            },
        }
    }

    pub fn undelete(title: &str, reason: &str) -> Self {
        Self {
            title: title.to_string(),
            kind: TaskKind::Undelete {
                reason: reason.to_string(),
            },
        }
    }

    pub fn upload(title: &str, path: PathBuf, description: &str, summary: &str) -> Self {
        Self {
            title: title.to_string(),
            kind: TaskKind::Upload {
                path,
                description: description.to_string(),
                summary: summary.to_string(),
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self.kind {
            TaskKind::Edit { .. } => "edit",
            TaskKind::Delete { .. } => "delete",
            TaskKind::Undelete { .. } => "undelete",
            TaskKind::Upload { .. } => "upload",
        }
    }

    pub fn execute(&self, session: &Session) -> Result<(), TaskError> {
        match &self.kind {
            TaskKind::Edit { text, summary } => {
                actions::edit(session, &self.title, text, summary)?;
            }
            TaskKind::Delete { reason } => {
                actions::delete(session, &self.title, reason)?;
            }
            TaskKind::Undelete { reason } => {
                actions::undelete(session, &self.title, reason)?;
            }
            TaskKind::Upload {
                path,
                description,
                summary,
            } => {
                ChunkedUpload::new(session, &self.title, description, summary)
                    .run_from_path(path)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FailedTask {
    pub task: Task,
    pub error: TaskError,
}

/// Shared stop signal. Tasks already running finish; tasks not yet started
/// are returned unexecuted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub failed: Vec<FailedTask>,
    pub cancelled: Vec<Task>,
    pub succeeded: usize,
    pub completed: usize,
}

enum Outcome {
    Succeeded,
    Failed(FailedTask),
    Cancelled(Task),
}

pub struct TaskRunner {
    pool: Arc<ThreadPool>,
}

impl TaskRunner {
    /// Runner with its own pool of `max_parallel` workers.
    pub fn new(max_parallel: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(max_parallel.max(1))
            .thread_name(|index| format!("wikibatch-task-{index}"))
            .build()?;
        Ok(Self::with_pool(Arc::new(pool)))
    }

    pub fn with_pool(pool: Arc<ThreadPool>) -> Self {
        Self { pool }
    }

    pub fn max_parallel(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Execute every task and return the ones that failed, in input order.
    pub fn run(&self, session: &Session, tasks: Vec<Task>) -> Vec<FailedTask> {
        self.run_with_cancel(session, tasks, &CancelFlag::new()).failed
    }

    pub fn run_with_cancel(&self, session: &Session, tasks: Vec<Task>, cancel: &CancelFlag) -> RunReport {
        let total = tasks.len();
        let completed = AtomicUsize::new(0);
        info!(total, workers = self.max_parallel(), "running tasks");

        let outcomes: Vec<Outcome> = self.pool.install(|| {
            tasks
                .into_par_iter()
                .map(|task| {
                    if cancel.is_cancelled() {
                        return Outcome::Cancelled(task);
                    }
                    let result = task.execute(session);
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    match result {
                        Ok(()) => {
                            info!(completed = done, total, title = %task.title, action = task.label(), "task done");
                            Outcome::Succeeded
                        }
                        Err(error) => {
                            warn!(
                                completed = done,
                                total,
                                title = %task.title,
                                action = task.label(),
                                error = %error,
                                "task failed"
                            );
                            Outcome::Failed(FailedTask { task, error })
                        }
                    }
                })
                .collect()
        });

        let mut report = RunReport {
            completed: completed.load(Ordering::SeqCst),
            ..RunReport::default()
        };
        for outcome in outcomes {
            match outcome {
                Outcome::Succeeded => report.succeeded += 1,
                Outcome::Failed(failed) => report.failed.push(failed),
                Outcome::Cancelled(task) => report.cancelled.push(task),
            }
        }
        info!(
            succeeded = report.succeeded,
            failed = report.failed.len(),
            cancelled = report.cancelled.len(),
            "task run finished"
        );
        report
    }
}
