//! Retry/Skip/Abort protocol
//!
//! Every step that talks to the control plane or to a driver runs through
//! [`Provision::step`]. A recoverable failure is handed to an [`Operator`],
//! which answers with a [`Decision`]. Non-recoverable failures propagate
//! untouched.

use crate::error::{ProvisionError, Result};
use crate::provision::Provision;
use async_trait::async_trait;
use colored::Colorize;
use futures_util::future::BoxFuture;
use provflow_config::{FailMode, Settings};
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines, Stdin, Stdout,
};
use tokio::sync::Mutex;
use tracing::{error, warn};

/// Operator answer to a failed step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry,
    Skip,
    SkipAll,
    Abort,
}

/// A failed attempt of one step
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub label: String,

    /// Underlying error message, verbatim
    pub message: String,

    /// 1-based attempt number
    pub attempt: u32,
}

/// Source of decisions for failed steps
#[async_trait]
pub trait Operator: Send + Sync {
    async fn decide(&self, failure: &StepFailure) -> Decision;

    /// Interactive operators are never subject to the automatic retry limit
    fn is_interactive(&self) -> bool {
        false
    }
}

/// Answers every failure with the same decision
#[derive(Debug, Clone, Copy)]
pub struct PolicyOperator {
    decision: Decision,
}

impl PolicyOperator {
    pub fn new(decision: Decision) -> Self {
        Self { decision }
    }
}

#[async_trait]
impl Operator for PolicyOperator {
    async fn decide(&self, _failure: &StepFailure) -> Decision {
        self.decision
    }
}

/// Prompts on the terminal.
///
/// One line reader is kept for the operator's lifetime, so answers typed
/// ahead of a prompt are not lost between decisions.
pub struct InteractiveOperator<R = BufReader<Stdin>, W = Stdout> {
    terminal: Mutex<Terminal<R, W>>,
}

struct Terminal<R, W> {
    answers: Lines<R>,
    prompt: W,
}

impl InteractiveOperator {
    pub fn new() -> Self {
        Self::with_terminal(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl Default for InteractiveOperator {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> InteractiveOperator<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn with_terminal(input: R, output: W) -> Self {
        Self {
            terminal: Mutex::new(Terminal {
                answers: input.lines(),
                prompt: output,
            }),
        }
    }
}

fn parse_answer(answer: &str) -> Option<Decision> {
    match answer.trim().to_lowercase().as_str() {
        "r" | "retry" => Some(Decision::Retry),
        "s" | "skip" => Some(Decision::Skip),
        "a" | "skip-all" | "all" => Some(Decision::SkipAll),
        "q" | "quit" | "abort" | "c" | "cleanup" => Some(Decision::Abort),
        _ => None,
    }
}

#[async_trait]
impl<R, W> Operator for InteractiveOperator<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn decide(&self, failure: &StepFailure) -> Decision {
        let mut terminal = self.terminal.lock().await;
        let Terminal { answers, prompt: out } = &mut *terminal;

        let header = format!("ERROR: {}", failure.label).red().bold();
        let prompt = format!(
            "{}\n{}\n{} ",
            header,
            failure.message,
            "[R]etry, [S]kip, skip [A]ll, [Q]uit and clean up?".yellow()
        );

        loop {
            if out.write_all(prompt.as_bytes()).await.is_err() || out.flush().await.is_err() {
                return Decision::Abort;
            }

            match answers.next_line().await {
                Ok(Some(answer)) => {
                    if let Some(decision) = parse_answer(&answer) {
                        return decision;
                    }
                }
                // closed terminal
                _ => return Decision::Abort,
            }
        }
    }

    fn is_interactive(&self) -> bool {
        true
    }
}

/// Operator configured by `fail_mode`
pub fn operator_from_settings(settings: &Settings) -> Arc<dyn Operator> {
    match settings.fail_mode {
        FailMode::Ask => Arc::new(InteractiveOperator::new()),
        FailMode::Retry => Arc::new(PolicyOperator::new(Decision::Retry)),
        FailMode::Skip => Arc::new(PolicyOperator::new(Decision::Skip)),
        FailMode::Cleanup => Arc::new(PolicyOperator::new(Decision::Abort)),
    }
}

/// How a step ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    SkipStep,
    SkipAll,

    /// The operator aborted; carries the failure that triggered it
    Abort(String),
}

impl StepOutcome {
    /// Turns an abort into the cleanup signal caught by the creation pipeline
    pub fn or_cleanup(self) -> Result<StepOutcome> {
        match self {
            StepOutcome::Abort(reason) => Err(ProvisionError::CleanupRequested(reason)),
            outcome => Ok(outcome),
        }
    }

    pub fn completed(&self) -> bool {
        matches!(self, StepOutcome::Continue)
    }
}

/// Unit of work of a step. It receives the provision mutably and must only
/// capture owned data; it may run several times.
pub type StepWork<'a> = BoxFuture<'a, Result<()>>;

impl Provision {
    /// Starts a public operation. A skip-all answer only holds for the
    /// operation that received it.
    pub(crate) fn begin_operation(&mut self) {
        self.skip_all = false;
    }

    /// Runs one step under the Retry/Skip/Abort protocol
    pub(crate) async fn step<F>(&mut self, label: &str, mut work: F) -> Result<StepOutcome>
    where
        F: for<'a> FnMut(&'a mut Provision) -> StepWork<'a> + Send,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let err = match work(self).await {
                Ok(()) => return Ok(StepOutcome::Continue),
                Err(e) if e.is_recoverable() => e,
                Err(e) => return Err(e),
            };

            let failure = StepFailure {
                label: label.to_string(),
                message: err.to_string(),
                attempt,
            };

            if self.skip_all {
                warn!(provision_id = self.id(), "{}: {} (skipped)", label, failure.message);
                return Ok(StepOutcome::SkipStep);
            }

            error!(provision_id = self.id(), attempt, "{}: {}", label, failure.message);

            let operator = Arc::clone(&self.backends.operator);
            let decision = operator.decide(&failure).await;

            match decision {
                Decision::Retry => {
                    if !operator.is_interactive() && attempt > self.settings.max_retries {
                        return Err(ProvisionError::RetriesExhausted {
                            label: failure.label,
                            attempts: attempt,
                            message: failure.message,
                        });
                    }
                    tokio::time::sleep(self.settings.retry_wait()).await;
                }
                Decision::Skip => {
                    warn!(provision_id = self.id(), "Skipping: {}", label);
                    return Ok(StepOutcome::SkipStep);
                }
                Decision::SkipAll => {
                    warn!(provision_id = self.id(), "Skipping: {} and every later failure", label);
                    self.skip_all = true;
                    return Ok(StepOutcome::SkipAll);
                }
                Decision::Abort => return Ok(StepOutcome::Abort(failure.message)),
            }
        }
    }
}
