//! Multi-run compositions on top of [`Executor`]: bounded parallel fan-out,
//! sequential chains with output substitution, and backend comparison.
//!
//! Every composed run is ephemeral. Request-shape and validation failures are
//! detected for all items before the first subprocess starts.

use crate::errors::{AppError, AppResult};
use crate::models::{
    ChainRequest, ChainResult, CompareEntry, CompareRequest, CompareResult, ParallelRequest,
    ParallelResult, PromptRequest, PromptResult,
};
use crate::runner::{ExecutionMode, Executor, PreparedRun};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Replaced with the previous chain step's output.
pub const PREVIOUS_PLACEHOLDER: &str = "{{previous}}";
/// Session references have no meaning in an ephemeral chain.
pub const SESSION_PLACEHOLDER: &str = "{{session}}";

/// Index-addressed results plus the counters updated alongside them.
struct Slots {
    results: Vec<Option<PromptResult>>,
    completed: usize,
    failed: usize,
}

impl Slots {
    fn new(len: usize) -> Self {
        Self {
            results: vec![None; len],
            completed: 0,
            failed: 0,
        }
    }

    fn fill(&mut self, index: usize, result: PromptResult) {
        if result.is_success() {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.results[index] = Some(result);
    }
}

impl Executor {
    /// Runs independent requests with at most `max_concurrency` subprocesses
    /// alive at once. Results keep the order of `request.tasks`.
    pub async fn run_parallel(
        &self,
        request: &ParallelRequest,
        cancel: &CancellationToken,
    ) -> AppResult<ParallelResult> {
        if request.tasks.is_empty() {
            return Err(AppError::Request("parallel request has no tasks".to_string()));
        }
        let started = Instant::now();

        let mut prepared = Vec::with_capacity(request.tasks.len());
        for (index, task) in request.tasks.iter().enumerate() {
            let task = ephemeral(task, request.dry_run);
            let run = self
                .prepare(&task, ExecutionMode::Capture)
                .await
                .map_err(|error| with_item_context("task", index, error))?;
            prepared.push(run);
        }

        let limit = match request.max_concurrency {
            0 => self.config().max_parallel_workers,
            limit => limit,
        }
        .max(1);
        let labels = prepared
            .iter()
            .map(|run| (run.backend.as_str(), run.model.clone()))
            .collect::<Vec<_>>();
        let semaphore = Arc::new(Semaphore::new(limit));
        let batch_cancel = cancel.child_token();
        let slots = Arc::new(Mutex::new(Slots::new(prepared.len())));
        tracing::info!(tasks = prepared.len(), limit, fail_fast = request.fail_fast, "starting parallel batch");

        let mut tasks = JoinSet::new();
        for (index, run) in prepared.into_iter().enumerate() {
            let executor = self.clone();
            let semaphore = semaphore.clone();
            let batch_cancel = batch_cancel.clone();
            let slots = slots.clone();
            let fail_fast = request.fail_fast;
            tasks.spawn(async move {
                let backend = run.backend.as_str();
                let model = run.model.clone();
                let permit = tokio::select! {
                    biased;
                    _ = batch_cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                // The permit is held until fail-fast has had its say.
                let (result, _permit) = match permit {
                    Some(permit) => (executor.run_prepared(run, &batch_cancel).await, Some(permit)),
                    None => (PromptResult::canceled(backend, &model), None),
                };
                if fail_fast && result.exit_code != 0 && !batch_cancel.is_cancelled() {
                    tracing::info!(index, backend, exit_code = result.exit_code, "fail-fast: canceling remaining tasks");
                    batch_cancel.cancel();
                }
                slots
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .fill(index, result);
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                tracing::error!(error = %error, "parallel task aborted");
            }
        }

        let mut slots = slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (index, (backend, model)) in labels.iter().enumerate() {
            if slots.results[index].is_none() {
                slots.fill(index, PromptResult::failed(backend, model, "task did not complete"));
            }
        }
        let result = ParallelResult {
            results: slots.results.iter_mut().filter_map(Option::take).collect(),
            completed: slots.completed,
            failed: slots.failed,
            total_duration_ms: elapsed_ms(started),
        };
        tracing::info!(
            completed = result.completed,
            failed = result.failed,
            duration_ms = result.total_duration_ms,
            "parallel batch finished"
        );
        Ok(result)
    }

    /// Runs steps in order, feeding each step's output into the next
    /// step's `{{previous}}` placeholders.
    pub async fn run_chain(
        &self,
        request: &ChainRequest,
        cancel: &CancellationToken,
    ) -> AppResult<ChainResult> {
        if request.steps.is_empty() {
            return Err(AppError::Request("chain request has no steps".to_string()));
        }
        if request.pass_session_id {
            return Err(AppError::Request(
                "chains are ephemeral and cannot pass session ids".to_string(),
            ));
        }
        for (index, step) in request.steps.iter().enumerate() {
            if step.prompt.contains(SESSION_PLACEHOLDER) {
                return Err(AppError::Request(format!(
                    "chain step {} references {}, but chains never persist sessions",
                    index, SESSION_PLACEHOLDER
                )));
            }
            if step.session_id.is_some() {
                return Err(AppError::Request(format!(
                    "chain step {} cannot resume a session",
                    index
                )));
            }
        }

        let started = Instant::now();
        let steps = chain_steps(request);
        for (index, step) in steps.iter().enumerate() {
            self.prepare(step, ExecutionMode::Capture)
                .await
                .map_err(|error| with_item_context("chain step", index, error))?;
        }

        let mut result = ChainResult::default();
        let mut previous_output = String::new();
        for (index, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                result.steps.push(PromptResult::canceled(&step.backend, step.model.as_deref().unwrap_or_default()));
                result.failed_step.get_or_insert(index);
                result.stopped_early = index + 1 < steps.len();
                break;
            }

            let mut step = step.clone();
            if index > 0 {
                step.prompt = step.prompt.replace(PREVIOUS_PLACEHOLDER, &previous_output);
            }
            let outcome = match self.prepare(&step, ExecutionMode::Capture).await {
                Ok(run) => self.run_prepared(run, cancel).await,
                Err(error) => PromptResult::failed(
                    &step.backend,
                    step.model.as_deref().unwrap_or_default(),
                    error.to_string(),
                ),
            };
            tracing::debug!(step = index, backend = %outcome.backend, exit_code = outcome.exit_code, "chain step finished");

            let succeeded = outcome.is_success();
            previous_output = outcome.output.clone();
            result.steps.push(outcome);
            if succeeded {
                result.completed += 1;
                continue;
            }
            result.failed_step.get_or_insert(index);
            if request.stop_on_failure {
                result.stopped_early = index + 1 < steps.len();
                break;
            }
        }
        result.total_duration_ms = elapsed_ms(started);
        tracing::info!(
            completed = result.completed,
            failed_step = ?result.failed_step,
            duration_ms = result.total_duration_ms,
            "chain finished"
        );
        Ok(result)
    }

    /// Sends one prompt to several backends. Entries follow the order of
    /// `request.backends` whether the runs were sequential or concurrent.
    pub async fn run_compare(
        &self,
        request: &CompareRequest,
        cancel: &CancellationToken,
    ) -> AppResult<CompareResult> {
        if request.backends.is_empty() {
            return Err(AppError::Request("compare request names no backends".to_string()));
        }
        let started = Instant::now();

        let mut prepared = Vec::with_capacity(request.backends.len());
        for backend in &request.backends {
            let task = PromptRequest {
                backend: backend.clone(),
                prompt: request.prompt.clone(),
                model: request.model.clone(),
                work_dir: request.work_dir.clone(),
                dry_run: request.dry_run,
                ephemeral: true,
                ..Default::default()
            };
            prepared.push(self.prepare(&task, ExecutionMode::Capture).await?);
        }

        let results = if request.sequential {
            let mut results = Vec::with_capacity(prepared.len());
            for run in prepared {
                results.push(self.run_prepared(run, cancel).await);
            }
            results
        } else {
            self.run_concurrently(prepared, cancel).await
        };

        let result = CompareResult {
            prompt: request.prompt.clone(),
            results: results
                .into_iter()
                .map(|result| CompareEntry {
                    backend: result.backend.clone(),
                    model: result.model.clone(),
                    duration_ms: result.duration_ms,
                    result,
                })
                .collect(),
            total_duration_ms: elapsed_ms(started),
        };
        tracing::info!(
            backends = result.results.len(),
            sequential = request.sequential,
            duration_ms = result.total_duration_ms,
            "compare finished"
        );
        Ok(result)
    }

    async fn run_concurrently(
        &self,
        prepared: Vec<PreparedRun>,
        cancel: &CancellationToken,
    ) -> Vec<PromptResult> {
        let labels = prepared
            .iter()
            .map(|run| (run.backend.as_str(), run.model.clone()))
            .collect::<Vec<_>>();
        let slots = Arc::new(Mutex::new(Slots::new(prepared.len())));
        let mut tasks = JoinSet::new();
        for (index, run) in prepared.into_iter().enumerate() {
            let executor = self.clone();
            let cancel = cancel.clone();
            let slots = slots.clone();
            tasks.spawn(async move {
                let result = executor.run_prepared(run, &cancel).await;
                slots
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .fill(index, result);
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                tracing::error!(error = %error, "compare task aborted");
            }
        }

        let mut slots = slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        labels
            .iter()
            .enumerate()
            .map(|(index, (backend, model))| {
                slots.results[index]
                    .take()
                    .unwrap_or_else(|| PromptResult::failed(backend, model, "task did not complete"))
            })
            .collect()
    }
}

fn ephemeral(task: &PromptRequest, dry_run: bool) -> PromptRequest {
    PromptRequest {
        ephemeral: true,
        session_id: None,
        dry_run: task.dry_run || dry_run,
        ..task.clone()
    }
}

/// Steps as they will run: ephemeral, dry-run propagated, and with the
/// working directory carried forward when enabled.
fn chain_steps(request: &ChainRequest) -> Vec<PromptRequest> {
    let mut inherited = String::new();
    request
        .steps
        .iter()
        .map(|step| {
            let mut step = ephemeral(step, request.dry_run);
            if step.work_dir.trim().is_empty() && request.pass_working_dir {
                step.work_dir = inherited.clone();
            }
            inherited = step.work_dir.clone();
            step
        })
        .collect()
}

fn with_item_context(kind: &str, index: usize, error: AppError) -> AppError {
    match error {
        AppError::Request(message) => AppError::Request(format!("{} {}: {}", kind, index, message)),
        AppError::Policy(message) => AppError::Policy(format!("{} {}: {}", kind, index, message)),
        other => other,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
