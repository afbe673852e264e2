//! Bounded fan-out of extraction work over many files.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::extractor::{ExtractionOptions, ExtractionResult, Extractor};
use crate::files::allowed_file;
use crate::llm::LlmStep;

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub file: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// In completion order.
    pub successes: Vec<ExtractionResult>,
    pub failures: Vec<BatchFailure>,
    /// Inputs refused before dispatch; counted in neither list above.
    pub rejected: Vec<BatchFailure>,
    /// Set when fail-fast stopped the batch early.
    pub halted: bool,
    /// Accepted files never dispatched because of a halt.
    pub skipped: usize,
}

impl BatchOutcome {
    pub fn processed(&self) -> usize {
        self.successes.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Split inputs into those with a supported extension and rejections.
pub fn partition_supported(files: Vec<PathBuf>) -> (Vec<PathBuf>, Vec<BatchFailure>) {
    let mut accepted = Vec::with_capacity(files.len());
    let mut rejected = Vec::new();
    for path in files {
        let name = file_label(&path);
        if allowed_file(&name) {
            accepted.push(path);
        } else {
            rejected.push(BatchFailure {
                file: name,
                error: "File type not allowed".to_string(),
            });
        }
    }
    (accepted, rejected)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Run `work` over `files` with at most `workers` units in flight.
///
/// A unit fails when its result carries an error or its task panics. With
/// `continue_on_error == false` the first failure stops dispatch; tasks still
/// running are detached and their results dropped.
pub async fn run<F, Fut>(
    files: Vec<PathBuf>,
    workers: usize,
    continue_on_error: bool,
    work: F,
) -> BatchOutcome
where
    F: Fn(PathBuf) -> Fut,
    Fut: Future<Output = ExtractionResult> + Send + 'static,
{
    let workers = workers.max(1);
    let total = files.len();
    let mut pending = files.into_iter();
    let mut tasks = JoinSet::new();
    let mut in_flight: HashMap<tokio::task::Id, PathBuf> = HashMap::new();
    let mut outcome = BatchOutcome::default();

    info!(
        "Batch of {} files on {} workers (continue_on_error={})",
        total, workers, continue_on_error
    );

    loop {
        while tasks.len() < workers {
            let Some(path) = pending.next() else { break };
            let handle = tasks.spawn(work(path.clone()));
            in_flight.insert(handle.id(), path);
        }

        let Some(joined) = tasks.join_next_with_id().await else {
            break;
        };

        let failure = match joined {
            Ok((id, result)) => {
                let path = in_flight.remove(&id).unwrap_or_default();
                match &result.error {
                    None => {
                        outcome.successes.push(result);
                        None
                    }
                    Some(error) => Some(BatchFailure {
                        file: file_label(&path),
                        error: error.clone(),
                    }),
                }
            }
            Err(join_error) => {
                let path = in_flight.remove(&join_error.id()).unwrap_or_default();
                warn!("Batch worker for {:?} died: {}", path, join_error);
                Some(BatchFailure {
                    file: file_label(&path),
                    error: format!("Worker failed: {}", join_error),
                })
            }
        };

        if let Some(failure) = failure {
            warn!("Batch item {} failed: {}", failure.file, failure.error);
            outcome.failures.push(failure);
            if !continue_on_error {
                outcome.halted = true;
                outcome.skipped = pending.len();
                tasks.detach_all();
                break;
            }
        }
    }

    info!(
        "Batch done: {} ok, {} failed, halted={}, skipped={}",
        outcome.successes.len(),
        outcome.failures.len(),
        outcome.halted,
        outcome.skipped
    );
    outcome
}

/// Extraction-specific front end to [`run`].
#[derive(Clone)]
pub struct BatchDispatcher {
    extractor: Extractor,
    workers: usize,
}

impl BatchDispatcher {
    pub fn new(extractor: Extractor, workers: usize) -> Self {
        Self {
            extractor,
            workers: workers.max(1),
        }
    }

    pub async fn process(
        &self,
        files: Vec<PathBuf>,
        options: &ExtractionOptions,
        llm: Option<&LlmStep>,
        continue_on_error: bool,
    ) -> BatchOutcome {
        let (accepted, rejected) = partition_supported(files);
        let options = Arc::new(options.clone());
        let llm = llm.cloned().map(Arc::new);
        let extractor = self.extractor.clone();

        let mut outcome = run(accepted, self.workers, continue_on_error, move |path| {
            let extractor = extractor.clone();
            let options = Arc::clone(&options);
            let llm = llm.clone();
            async move {
                let mut result = extractor
                    .process_file(&path, &options, llm.as_deref())
                    .await;
                result.filename = Some(file_label(&path));
                result
            }
        })
        .await;

        outcome.rejected = rejected;
        outcome
    }
}
