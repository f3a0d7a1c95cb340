//! Run supervision.
//!
//! Every run, whether a child process or an HTTP session, is driven by one
//! loop that selects over transport events, the stop token, the idle deadline
//! and the hard deadline. The loop owns the run; when it returns, the run is
//! finalized exactly once: output flushed, terminal line written, prompt file
//! removed, registry entry dropped, completion hook called.

mod kill;
mod process;

pub use kill::{
    interrupt_process_tree, kill_process_tree, terminate_process_tree, Escalation, KILL_DEADLINE,
    TERMINATE_GRACE,
};
pub use process::ProcessSpec;
pub(crate) use process::spawn_process;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use agentrun_core::{
    EngineEvent, OutputStream, Provider, RunState, StopMode, TaskId, TimeoutKind,
};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::EngineContext;
use crate::error::{EngineError, FailureKind};
use crate::extractor::{SubtaskExtractor, SubtaskRecorder};
use crate::output::OutputPipeline;

const CHANNEL_CAPACITY: usize = 256;

/// Something a transport reports to its supervisor.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    Output(OutputStream, String),
    Finished(TransportExit),
}

/// How a transport closed.
#[derive(Debug)]
pub(crate) enum TransportExit {
    /// Child process exit code; `None` when killed by a signal.
    Process { code: Option<i32> },
    /// HTTP session result.
    Session(Result<(), EngineError>),
}

/// Sending half handed to transports.
#[derive(Debug, Clone)]
pub(crate) struct TransportSink {
    tx: mpsc::Sender<TransportEvent>,
}

impl TransportSink {
    pub(crate) fn new(tx: mpsc::Sender<TransportEvent>) -> Self {
        Self { tx }
    }

    /// Returns false once the supervisor has gone away.
    pub(crate) async fn output(&self, stream: OutputStream, text: String) -> bool {
        self.tx
            .send(TransportEvent::Output(stream, text))
            .await
            .is_ok()
    }

    pub(crate) async fn send(&self, event: TransportEvent) {
        let _ = self.tx.send(event).await;
    }
}

pub(crate) type SessionFuture = BoxFuture<'static, Result<(), EngineError>>;

/// An HTTP session: given an abort token and a sink, stream output until done.
pub(crate) type Session = Box<dyn FnOnce(CancellationToken, TransportSink) -> SessionFuture + Send>;

pub(crate) enum Transport {
    Process(ProcessSpec),
    Session(Session),
}

/// What a run was launched for.
pub(crate) struct RunSetup {
    pub task_id: TaskId,
    pub provider: Provider,
    pub prompt: String,
    pub log_path: Option<PathBuf>,
    /// Identifier shown for HTTP runs, which have no OS process.
    pub pseudo_pid: Option<u32>,
    /// Cancelling this token stops the run like [`StopMode::Cancel`].
    pub cancel: CancellationToken,
}

/// Final report of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub task_id: TaskId,
    /// Provider name as displayed (`claude`, `copilot`, `api:<id>`).
    pub provider: String,
    pub state: RunState,
    /// Zero only for completed runs.
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutKind>,
    #[serde(skip)]
    pub failure: Option<FailureKind>,
    /// Error message for failed runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }
}

/// Shared control block of one run.
#[derive(Debug)]
pub(crate) struct RunControl {
    token: CancellationToken,
    mode: OnceLock<StopMode>,
    pid: AtomicU32,
    finished: AtomicBool,
}

impl RunControl {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            mode: OnceLock::new(),
            pid: AtomicU32::new(0),
            finished: AtomicBool::new(false),
        }
    }

    /// Request a stop. Only the first request counts.
    pub(crate) fn stop(&self, mode: StopMode) -> bool {
        if self.finished.load(Ordering::SeqCst) || self.mode.set(mode).is_err() {
            return false;
        }
        self.token.cancel();
        true
    }

    fn stop_mode(&self) -> StopMode {
        self.mode.get().copied().unwrap_or(StopMode::Cancel)
    }

    fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// True for the first caller only.
    fn mark_finished(&self) -> bool {
        !self.finished.swap(true, Ordering::SeqCst)
    }
}

/// Handle to a launched run.
#[derive(Debug)]
pub struct RunHandle {
    task_id: TaskId,
    provider: String,
    control: Arc<RunControl>,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// OS pid of the child, or the pseudo pid of an HTTP run.
    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    /// Stop the run. Safe at any time; repeated calls are no-ops.
    /// Returns whether this call initiated the stop.
    pub fn stop(&self, mode: StopMode) -> bool {
        self.control.stop(mode)
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> RunOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task_id = %self.task_id, error = %e, "Supervisor task failed");
                RunOutcome {
                    task_id: self.task_id,
                    provider: self.provider,
                    state: RunState::Errored,
                    exit_code: 1,
                    timeout: None,
                    failure: None,
                    message: Some(format!("supervisor task failed: {e}")),
                }
            }
        }
    }
}

/// Public view of an active run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunInfo {
    pub task_id: TaskId,
    pub provider: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

struct ActiveRun {
    provider: String,
    started_at: DateTime<Utc>,
    control: Arc<RunControl>,
}

/// Runs currently supervised, keyed by task.
#[derive(Default)]
pub(crate) struct RunRegistry {
    runs: RwLock<HashMap<TaskId, ActiveRun>>,
}

impl RunRegistry {
    async fn register(
        &self,
        task_id: TaskId,
        provider: String,
        control: Arc<RunControl>,
    ) -> Result<(), EngineError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&task_id) {
            return Err(EngineError::AlreadyRunning(task_id));
        }
        runs.insert(
            task_id,
            ActiveRun {
                provider,
                started_at: Utc::now(),
                control,
            },
        );
        Ok(())
    }

    async fn remove(&self, task_id: &TaskId, control: &Arc<RunControl>) {
        let mut runs = self.runs.write().await;
        if runs
            .get(task_id)
            .is_some_and(|run| Arc::ptr_eq(&run.control, control))
        {
            runs.remove(task_id);
        }
    }

    pub(crate) async fn stop(&self, task_id: &TaskId, mode: StopMode) -> bool {
        match self.runs.read().await.get(task_id) {
            Some(run) => run.control.stop(mode),
            None => false,
        }
    }

    pub(crate) async fn list(&self) -> Vec<RunInfo> {
        let mut runs: Vec<RunInfo> = self
            .runs
            .read()
            .await
            .iter()
            .map(|(task_id, run)| RunInfo {
                task_id: task_id.clone(),
                provider: run.provider.clone(),
                pid: run.control.pid(),
                started_at: run.started_at,
            })
            .collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }
}

/// Register a run and start supervising it in the background.
pub(crate) async fn launch(
    ctx: &Arc<EngineContext>,
    setup: RunSetup,
    transport: Transport,
) -> Result<RunHandle, EngineError> {
    let control = Arc::new(RunControl::new(setup.cancel.clone()));
    if let Some(pid) = setup.pseudo_pid {
        control.set_pid(pid);
    }

    let provider = setup.provider.to_string();
    let task_id = setup.task_id.clone();
    ctx.state
        .runs
        .register(task_id.clone(), provider.clone(), control.clone())
        .await?;
    info!(task_id = %task_id, provider = %provider, "Run registered");

    let join = tokio::spawn(supervise(ctx.clone(), setup, transport, control.clone()));

    Ok(RunHandle {
        task_id,
        provider,
        control,
        join,
    })
}

/// Why the supervisor ended the run itself.
#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Stopped,
    TimedOut(TimeoutKind),
}

/// How the transport side ended.
#[derive(Debug)]
enum RunEnd {
    NotStarted,
    StartFailed(EngineError),
    Exited(TransportExit),
    Lost,
}

enum Terminator {
    Process(u32),
    Session(CancellationToken),
}

impl Terminator {
    /// The process ladder runs detached until the whole group is gone.
    fn terminate(&self, escalation: Escalation) {
        match self {
            Self::Process(pid) => {
                terminate_process_tree(*pid, escalation);
            }
            Self::Session(abort) => abort.cancel(),
        }
    }
}

fn deadline(from: Instant, after: Duration) -> Option<Instant> {
    (!after.is_zero()).then(|| from + after)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn supervise(
    ctx: Arc<EngineContext>,
    setup: RunSetup,
    transport: Transport,
    control: Arc<RunControl>,
) -> RunOutcome {
    let RunSetup {
        task_id,
        provider,
        prompt,
        log_path,
        ..
    } = setup;

    let ports = &ctx.ports;
    let recorder = SubtaskRecorder::new(
        ports.subtasks.clone(),
        ports.router.clone(),
        ports.broadcast.clone(),
    );
    let mut pipeline = OutputPipeline::open(
        task_id.clone(),
        log_path.as_deref(),
        ctx.state.dedup.clone(),
        SubtaskExtractor::for_provider(task_id.clone(), &provider),
        recorder,
        ports.broadcast.clone(),
    )
    .await;
    let prompt_file = write_prompt_file(&ctx.config.prompt_dir, &task_id, &prompt).await;

    let (interrupt, end) = drive(&ctx, &control, &task_id, transport, &mut pipeline).await;
    let outcome = conclude(&task_id, &provider, interrupt, end);

    finalize(&ctx, &control, &provider, pipeline, prompt_file, outcome).await
}

async fn drive(
    ctx: &EngineContext,
    control: &RunControl,
    task_id: &TaskId,
    transport: Transport,
    pipeline: &mut OutputPipeline,
) -> (Option<Interrupt>, RunEnd) {
    if control.token.is_cancelled() {
        info!(task_id = %task_id, "Run stopped before start");
        return (Some(Interrupt::Stopped), RunEnd::NotStarted);
    }

    let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
    let sink = TransportSink::new(tx);

    let terminator = match transport {
        Transport::Process(spec) => match spawn_process(spec, sink) {
            Ok(pid) => {
                control.set_pid(pid);
                Terminator::Process(pid)
            }
            Err(e) => return (None, RunEnd::StartFailed(e)),
        },
        Transport::Session(session) => {
            let abort = CancellationToken::new();
            let future = session(abort.clone(), sink.clone());
            let session_abort = abort.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    result = future => result,
                    _ = session_abort.cancelled() => Err(EngineError::Cancelled),
                };
                sink.send(TransportEvent::Finished(TransportExit::Session(result)))
                    .await;
            });
            Terminator::Session(abort)
        }
    };

    let config = &ctx.config;
    let started = Instant::now();
    let hard_deadline = deadline(started, config.hard_timeout);
    let mut idle_deadline = deadline(started, config.idle_timeout);
    let mut interrupt: Option<Interrupt> = None;

    let end = loop {
        tokio::select! {
            biased;

            _ = control.token.cancelled(), if interrupt.is_none() => {
                info!(task_id = %task_id, mode = ?control.stop_mode(), "Stopping run");
                interrupt = Some(Interrupt::Stopped);
                terminator.terminate(Escalation::Graceful);
            }

            _ = sleep_until_opt(hard_deadline), if interrupt.is_none() && hard_deadline.is_some() => {
                warn!(task_id = %task_id, timeout_ms = config.hard_timeout.as_millis() as u64, "Hard timeout, terminating run");
                interrupt = Some(Interrupt::TimedOut(TimeoutKind::Hard));
                terminator.terminate(Escalation::Forced);
            }

            event = rx.recv() => match event {
                Some(TransportEvent::Output(stream, text)) => {
                    if interrupt.is_none() {
                        idle_deadline = deadline(Instant::now(), config.idle_timeout);
                    }
                    pipeline.handle(stream, &text).await;
                }
                Some(TransportEvent::Finished(exit)) => break RunEnd::Exited(exit),
                None => break RunEnd::Lost,
            },

            _ = sleep_until_opt(idle_deadline), if interrupt.is_none() && idle_deadline.is_some() => {
                warn!(task_id = %task_id, timeout_ms = config.idle_timeout.as_millis() as u64, "Idle timeout, terminating run");
                interrupt = Some(Interrupt::TimedOut(TimeoutKind::Idle));
                terminator.terminate(Escalation::Forced);
            }
        }
    };

    (interrupt, end)
}

fn conclude(
    task_id: &TaskId,
    provider: &Provider,
    interrupt: Option<Interrupt>,
    end: RunEnd,
) -> RunOutcome {
    let process_code = match &end {
        RunEnd::Exited(TransportExit::Process { code }) => *code,
        _ => None,
    };
    let failure_code = process_code.filter(|c| *c != 0).unwrap_or(1);

    let (state, exit_code, timeout, failure, message) = match (interrupt, end) {
        (Some(Interrupt::Stopped), _) => (
            RunState::Aborted,
            failure_code,
            None,
            Some(FailureKind::Cancelled),
            None,
        ),
        (Some(Interrupt::TimedOut(kind)), _) => (
            RunState::TimedOut,
            failure_code,
            Some(kind),
            Some(FailureKind::Timeout),
            Some(EngineError::Timeout(kind).to_string()),
        ),
        (None, RunEnd::Exited(TransportExit::Process { code: Some(0) }))
        | (None, RunEnd::Exited(TransportExit::Session(Ok(())))) => {
            (RunState::Completed, 0, None, None, None)
        }
        (None, RunEnd::Exited(TransportExit::Process { code })) => {
            let err = match code {
                Some(code) => EngineError::ExitStatus(code),
                None => EngineError::Signaled,
            };
            (
                RunState::Errored,
                failure_code,
                None,
                Some(err.kind()),
                Some(err.to_string()),
            )
        }
        (None, RunEnd::Exited(TransportExit::Session(Err(e)))) | (None, RunEnd::StartFailed(e)) => {
            (RunState::Errored, 1, None, Some(e.kind()), Some(e.to_string()))
        }
        (None, RunEnd::NotStarted) | (None, RunEnd::Lost) => (
            RunState::Errored,
            1,
            None,
            None,
            Some("transport closed without reporting an exit".to_string()),
        ),
    };

    RunOutcome {
        task_id: task_id.clone(),
        provider: provider.to_string(),
        state,
        exit_code,
        timeout,
        failure,
        message,
    }
}

async fn finalize(
    ctx: &EngineContext,
    control: &Arc<RunControl>,
    provider: &Provider,
    mut pipeline: OutputPipeline,
    prompt_file: Option<PathBuf>,
    outcome: RunOutcome,
) -> RunOutcome {
    if !control.mark_finished() {
        return outcome;
    }
    let task_id = &outcome.task_id;

    pipeline.finish().await;

    if let Some((kind, line)) = terminal_line(provider.label(), &outcome, control.stop_mode()) {
        pipeline.append_line(&line).await;
        if let Err(e) = ctx.ports.task_log.append_log(task_id, kind, &line).await {
            warn!(task_id = %task_id, error = %e, "Failed to append task log");
        }
        pipeline.publish(EngineEvent::CliOutput {
            task_id: task_id.clone(),
            stream: OutputStream::Stderr,
            data: format!("{line}\n"),
        });
    }
    drop(pipeline);

    if let Some(path) = prompt_file {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(path = %path.display(), error = %e, "Prompt file already gone");
        }
    }
    ctx.state.dedup.clear(task_id).await;
    ctx.state.runs.remove(task_id, control).await;

    let event = EngineEvent::RunFinished {
        task_id: task_id.clone(),
        provider: outcome.provider.clone(),
        state: outcome.state,
        exit_code: outcome.exit_code,
    };
    ctx.ports.broadcast.publish(event.event_type(), event.payload());

    match outcome.state {
        RunState::Completed => {
            info!(task_id = %task_id, provider = %outcome.provider, "Run completed")
        }
        state => warn!(
            task_id = %task_id,
            provider = %outcome.provider,
            state = %state,
            exit_code = outcome.exit_code,
            message = outcome.message.as_deref().unwrap_or(""),
            "Run ended unsuccessfully"
        ),
    }

    ctx.ports.completion.on_complete(&outcome).await;
    outcome
}

/// Task-log kind and text of the line written when a run does not complete.
fn terminal_line(
    label: &str,
    outcome: &RunOutcome,
    mode: StopMode,
) -> Option<(&'static str, String)> {
    match outcome.state {
        RunState::Completed | RunState::Running => None,
        RunState::Aborted => Some((
            "system",
            match mode {
                StopMode::Pause => format!("[{label}] Paused by user"),
                StopMode::Cancel => format!("[{label}] Aborted by user"),
            },
        )),
        RunState::TimedOut | RunState::Errored => Some((
            "error",
            format!(
                "[{label}] Error: {}",
                outcome.message.as_deref().unwrap_or("unknown error")
            ),
        )),
    }
}

/// File name of a task's prompt file; path separators never reach the filesystem.
pub(crate) fn prompt_file_path(dir: &Path, task_id: &TaskId) -> PathBuf {
    let safe: String = task_id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{safe}.prompt.txt"))
}

async fn write_prompt_file(dir: &Path, task_id: &TaskId, prompt: &str) -> Option<PathBuf> {
    let path = prompt_file_path(dir, task_id);
    let written = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, prompt).await
    }
    .await;

    match written {
        Ok(()) => Some(path),
        Err(e) => {
            warn!(task_id = %task_id, path = %path.display(), error = %e, "Failed to write prompt file");
            None
        }
    }
}
