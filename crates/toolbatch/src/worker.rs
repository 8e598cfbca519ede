//! The heavy lane: CPU-bound tool groups run in separate worker processes.
//!
//! A [`ProcessPool`] launches one child per heavy group, bounded by a
//! semaphore. The child is an executable that understands the worker
//! protocol, normally the current binary re-run with [`WORKER_FLAG`]:
//!
//! ```text
//! parent ── WorkerJob (JSON, stdin) ──▶ child: serve(registry)
//!        ◀── [Outcome] (JSON, stdout) ──
//! ```
//!
//! The child resolves the handler by slug in its own registry, so heavy
//! tools must be registered the same way in both processes. A child that
//! crashes, exits non-zero, or prints something that is not one outcome per
//! action fails its group as a whole; the scheduler keeps running.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::batch::Outcome;
use crate::lanes::{ActionInput, PoolStats, run_blocking};
use crate::registry::{HandlerRegistry, ToolHandler};

/// Command-line flag that puts a binary into worker mode.
pub const WORKER_FLAG: &str = "--worker";

/// One heavy group, as sent to a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJob {
    pub slug: String,
    pub trace_id: String,
    pub actions: Vec<ActionInput>,
}

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The running executable in worker mode, if its path is known.
    pub fn current_exe() -> Option<Self> {
        match std::env::current_exe() {
            Ok(path) => Some(Self::new(path).with_arg(WORKER_FLAG)),
            Err(e) => {
                error!("Cannot locate the current executable for worker processes: {e}");
                None
            }
        }
    }
}

// ── Parent side ───────────────────────────────────────────────────

/// A bounded pool of worker processes.
#[derive(Debug)]
pub struct ProcessPool {
    permits: Arc<Semaphore>,
    size: usize,
    command: Option<WorkerCommand>,
}

impl ProcessPool {
    /// At most `size` workers run at once. Without a `command` every heavy
    /// group fails as a whole.
    pub fn new(size: usize, command: Option<WorkerCommand>) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            command,
        }
    }

    pub fn command(&self) -> Option<&WorkerCommand> {
        self.command.as_ref()
    }

    /// Run `job` in a worker process once a slot is free.
    pub fn run(&self, job: WorkerJob) -> JoinHandle<Result<Vec<Outcome>, String>> {
        let permits = Arc::clone(&self.permits);
        let command = self.command.clone();
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| "process pool is shut down".to_string())?;
            let command =
                command.ok_or_else(|| "no worker executable configured for heavy tools".to_string())?;
            run_worker(&command, &job).await
        })
    }

    pub fn close(&self) {
        self.permits.close();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: "process",
            size: self.size,
            available: self.permits.available_permits(),
            closed: self.permits.is_closed(),
        }
    }
}

async fn run_worker(command: &WorkerCommand, job: &WorkerJob) -> Result<Vec<Outcome>, String> {
    let payload =
        serde_json::to_vec(job).map_err(|e| format!("failed to encode worker job: {e}"))?;

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to start worker process: {e}"))?;
    debug!(
        "[{}] Worker {:?} started for {} ({} actions)",
        job.trace_id,
        child.id(),
        job.slug,
        job.actions.len()
    );

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| format!("failed to send job to worker process: {e}"))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("worker process failed: {e}"))?;
    if !output.status.success() {
        return Err(format!("worker process exited with {}", output.status));
    }

    let outcomes: Vec<Outcome> = serde_json::from_slice(&output.stdout)
        .map_err(|e| format!("invalid worker output: {e}"))?;
    if outcomes.len() != job.actions.len() {
        return Err(format!(
            "worker returned {} outcomes for {} actions",
            outcomes.len(),
            job.actions.len()
        ));
    }
    Ok(outcomes)
}

// ── Child side ────────────────────────────────────────────────────

/// Worker mode: read one job from stdin, write its outcomes to stdout.
pub fn serve(handlers: &dyn HandlerRegistry) -> Result<(), String> {
    serve_io(handlers, std::io::stdin().lock(), std::io::stdout().lock())
}

/// [`serve`] over arbitrary streams.
pub fn serve_io<R: Read, W: Write>(
    handlers: &dyn HandlerRegistry,
    input: R,
    mut output: W,
) -> Result<(), String> {
    let job: WorkerJob =
        serde_json::from_reader(input).map_err(|e| format!("invalid worker job: {e}"))?;
    let outcomes = execute_job(handlers, job);
    serde_json::to_writer(&mut output, &outcomes)
        .map_err(|e| format!("failed to write worker output: {e}"))?;
    output
        .flush()
        .map_err(|e| format!("failed to write worker output: {e}"))
}

fn execute_job(handlers: &dyn HandlerRegistry, job: WorkerJob) -> Vec<Outcome> {
    let WorkerJob {
        slug,
        trace_id,
        actions,
    } = job;
    match handlers.get(&slug) {
        Some(ToolHandler::Blocking { call, .. }) => actions
            .into_iter()
            .map(|input| run_blocking(&call, input, &slug, &trace_id))
            .collect(),
        Some(ToolHandler::Cooperative(_)) => {
            let failure = Outcome::error(
                format!("tool {slug} is cooperative and cannot run in a worker process"),
                &trace_id,
            );
            vec![failure; actions.len()]
        }
        None => {
            error!("[{trace_id}] Tool '{slug}' not found in worker");
            vec![Outcome::error(format!("tool not found: {slug}"), &trace_id); actions.len()]
        }
    }
}
