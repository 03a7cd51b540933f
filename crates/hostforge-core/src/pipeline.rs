//! Ordered, fail-fast execution of side-effecting steps.
//!
//! A [`Step`] is a named action guarded by a precondition ("is there still
//! work to do?") and checked by a postcondition ("did the host reach the
//! expected state?"). [`Pipeline::run`] records one [`StepResult`] per
//! executed step and stops at the first failure, leaving completed side
//! effects in place.

use crate::context::RunContext;
use crate::error::{HostforgeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lines of run-log output kept in each [`StepResult`].
const EXCERPT_LINES: usize = 12;

// ---------------------------------------------------------------------------
// StepStatus / StepResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Skipped,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Success => "success",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub idempotency_key: String,
    pub log_excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// PipelineRun
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Vec<StepResult>,
    /// The error that halted the run, if any.
    #[serde(skip)]
    pub fatal: Option<HostforgeError>,
}

impl PipelineRun {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            results: Vec::new(),
            fatal: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn result(&self, name: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn status_of(&self, name: &str) -> Option<StepStatus> {
        self.result(name).map(|r| r.status)
    }

    /// Names of steps that actually did work.
    pub fn performed(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.status == StepStatus::Success)
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Take the halting error, leaving the recorded results in place.
    pub fn into_result(mut self) -> std::result::Result<Self, (Self, HostforgeError)> {
        match self.fatal.take() {
            Some(e) => Err((self, e)),
            None => Ok(self),
        }
    }
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

type Check<'a> = Box<dyn Fn(&RunContext) -> bool + 'a>;
type Action<'a> = Box<dyn Fn(&RunContext) -> Result<()> + 'a>;

pub struct Step<'a> {
    pub name: String,
    pub idempotency_key: String,
    precondition: Check<'a>,
    action: Action<'a>,
    postcondition: Check<'a>,
}

impl<'a> Step<'a> {
    /// A step that always runs and is always considered verified. Narrow it
    /// with [`Step::when`] and [`Step::verify`].
    pub fn new(name: &str, action: impl Fn(&RunContext) -> Result<()> + 'a) -> Self {
        Self {
            name: name.to_string(),
            idempotency_key: name.to_string(),
            precondition: Box::new(|_| true),
            action: Box::new(action),
            postcondition: Box::new(|_| true),
        }
    }

    /// Run only while `pending` reports outstanding work.
    pub fn when(mut self, pending: impl Fn(&RunContext) -> bool + 'a) -> Self {
        self.precondition = Box::new(pending);
        self
    }

    pub fn verify(mut self, done: impl Fn(&RunContext) -> bool + 'a) -> Self {
        self.postcondition = Box::new(done);
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }
}

/// A step and whether its precondition currently reports work to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub name: String,
    pub pending: bool,
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Observer for per-step progress (console output in the CLI).
pub trait Progress {
    fn started(&self, _name: &str) {}
    fn finished(&self, _result: &StepResult) {}
}

pub struct NoProgress;

impl Progress for NoProgress {}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Pipeline<'a> {
    steps: Vec<Step<'a>>,
}

impl<'a> Pipeline<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn push(&mut self, step: Step<'a>) -> &mut Self {
        self.steps.push(step);
        self
    }

    /// Evaluate preconditions only. Nothing is executed.
    pub fn plan(&self, ctx: &RunContext) -> Vec<PlannedStep> {
        self.steps
            .iter()
            .map(|s| PlannedStep {
                name: s.name.clone(),
                pending: (s.precondition)(ctx),
            })
            .collect()
    }

    pub fn run(&self, ctx: &RunContext) -> PipelineRun {
        self.run_into(ctx, &NoProgress, PipelineRun::new())
    }

    /// Execute every step into `run`, appending to any results it already
    /// holds. Stops at the first failed step.
    pub fn run_into(
        &self,
        ctx: &RunContext,
        progress: &dyn Progress,
        mut run: PipelineRun,
    ) -> PipelineRun {
        for step in &self.steps {
            if run.fatal.is_some() {
                break;
            }
            progress.started(&step.name);
            let started_at = Utc::now();
            let mark = ctx.log.position();

            let (status, error) = if !(step.precondition)(ctx) {
                ctx.log.info(&step.name, "already satisfied; skipping");
                (StepStatus::Skipped, None)
            } else {
                ctx.log.info(&step.name, "starting");
                match (step.action)(ctx) {
                    Err(e) => (StepStatus::Failed, Some(e)),
                    Ok(()) if !(step.postcondition)(ctx) => (
                        StepStatus::Failed,
                        Some(HostforgeError::Postcondition(step.name.clone())),
                    ),
                    Ok(()) => (StepStatus::Success, None),
                }
            };

            if let Some(e) = &error {
                ctx.log.error(&step.name, format!("failed: {e}"));
            } else if status == StepStatus::Success {
                ctx.log.info(&step.name, "done");
            }

            let result = StepResult {
                name: step.name.clone(),
                status,
                started_at,
                finished_at: Utc::now(),
                idempotency_key: step.idempotency_key.clone(),
                log_excerpt: excerpt(&ctx.log.since(mark)),
                error: error.as_ref().map(|e| e.to_string()),
            };
            progress.finished(&result);
            run.results.push(result);
            run.fatal = error;
        }
        run.finished_at = Some(Utc::now());
        run
    }
}

fn excerpt(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(EXCERPT_LINES);
    lines[start..].join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
