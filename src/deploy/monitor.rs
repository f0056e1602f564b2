//! Output capture and progress tracking for one unit of work.
//!
//! Each command run through [`ProcessMonitor::listen`] gets one reader task
//! per output stream. Readers forward complete lines into a shared unbounded
//! channel, drained by a single consumer task that lives as long as the
//! monitor. The consumer logs every line and keeps a bounded tail.

use std::collections::VecDeque;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::models::{Outcome, ProgressStep, PullRequestRecord};
use super::progress::ProgressPublisher;
use crate::errors::{CommandError, DeployError};

/// Lines retained by [`ProcessMonitor::tail`].
pub const TAIL_CAPACITY: usize = 200;

/// How long readers may keep draining pipes after the child exits.
const READER_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
    Monitor,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Monitor => "monitor",
        })
    }
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub stream: Stream,
    pub line: String,
}

enum LogMessage {
    Line(LogLine),
    Flush(oneshot::Sender<()>),
}

enum Exit {
    Status(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ProcessMonitor {
    pr_id: i64,
    publisher: ProgressPublisher,
    cancel: CancellationToken,
    timeout: Duration,
    log_tx: mpsc::UnboundedSender<LogMessage>,
    tail: Arc<Mutex<Tail>>,
    state: Mutex<(ProgressStep, Outcome)>,
}

/// The most recent lines, plus a count of every line ever consumed.
#[derive(Default)]
struct Tail {
    lines: VecDeque<String>,
    total: u64,
}

impl ProcessMonitor {
    /// Create a monitor and start its log consumer. Must be called inside a
    /// tokio runtime.
    pub fn new(
        pr_id: i64,
        publisher: ProgressPublisher,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Self {
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let tail = Arc::new(Mutex::new(Tail::default()));
        tokio::spawn(consume_logs(pr_id, log_rx, tail.clone()));
        Self {
            pr_id,
            publisher,
            cancel,
            timeout,
            log_tx,
            tail,
            state: Mutex::new((ProgressStep::Started, Outcome::NotYet)),
        }
    }

    pub fn pr_id(&self) -> i64 {
        self.pr_id
    }

    pub fn current(&self) -> (ProgressStep, Outcome) {
        *lock(&self.state)
    }

    /// Record the new step/outcome and publish it. The publish is awaited, so
    /// updates reach the comment in call order.
    pub async fn update_progress(
        &self,
        record: &mut PullRequestRecord,
        step: ProgressStep,
        outcome: Outcome,
    ) -> Result<(), DeployError> {
        *lock(&self.state) = (step, outcome);
        info!(pr_id = self.pr_id, %step, %outcome, "progress");
        self.publisher.publish(record, step, outcome).await
    }

    /// Like [`update_progress`](Self::update_progress), but a failed comment
    /// call is logged instead of returned. Persistence errors are returned.
    pub async fn report(
        &self,
        record: &mut PullRequestRecord,
        step: ProgressStep,
        outcome: Outcome,
    ) -> Result<(), DeployError> {
        match self.update_progress(record, step, outcome).await {
            Err(DeployError::Publish(e)) => {
                warn!(pr_id = self.pr_id, %step, %outcome, error = %e, "failed to publish progress");
                Ok(())
            }
            other => other,
        }
    }

    /// Report `step` as failed on a path that already returns the stage's
    /// own error. Any error from the report is logged.
    pub async fn report_failure(&self, record: &mut PullRequestRecord, step: ProgressStep) {
        if let Err(e) = self.report(record, step, Outcome::Failed).await {
            error!(pr_id = self.pr_id, %step, error = %e, "failed to record stage failure");
        }
    }

    pub fn add_log(&self, line: impl Into<String>) {
        let _ = self.log_tx.send(LogMessage::Line(LogLine {
            stream: Stream::Monitor,
            line: line.into(),
        }));
    }

    /// Snapshot of the most recent captured lines, oldest first.
    pub fn tail(&self) -> Vec<String> {
        lock(&self.tail).lines.iter().cloned().collect()
    }

    /// Number of lines consumed so far. Call [`flush`](Self::flush) first to
    /// include everything already queued.
    pub fn line_count(&self) -> u64 {
        lock(&self.tail).total
    }

    /// Retained lines consumed after `mark` (a previous [`line_count`](Self::line_count)).
    pub fn output_since(&self, mark: u64) -> Vec<String> {
        let tail = lock(&self.tail);
        let added = usize::try_from(tail.total.saturating_sub(mark)).unwrap_or(usize::MAX);
        let skip = tail.lines.len().saturating_sub(added);
        tail.lines.iter().skip(skip).cloned().collect()
    }

    /// Wait until every line queued so far has been consumed.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.log_tx.send(LogMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Run `cmd` to completion, capturing both output streams.
    ///
    /// The child is killed when the deadline passes or the monitor's
    /// cancellation token fires. Every captured line has been consumed by the
    /// time this returns.
    pub async fn listen(&self, mut cmd: Command) -> Result<ExitStatus, CommandError> {
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| CommandError::SpawnFailed {
            program: program.clone(),
            source,
        })?;

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(stdout, Stream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(stderr, Stream::Stderr));
        }

        let exit = tokio::select! {
            status = child.wait() => Exit::Status(status),
            _ = tokio::time::sleep(self.timeout) => Exit::TimedOut,
            _ = self.cancel.cancelled() => Exit::Cancelled,
        };

        let result = match exit {
            Exit::Status(status) => status.map_err(|source| CommandError::WaitFailed {
                program: program.clone(),
                source,
            }),
            Exit::TimedOut => {
                warn!(pr_id = self.pr_id, program = %program, "command timed out, killing");
                let _ = child.kill().await;
                Err(CommandError::TimedOut {
                    program: program.clone(),
                    secs: self.timeout.as_secs(),
                })
            }
            Exit::Cancelled => {
                warn!(pr_id = self.pr_id, program = %program, "command cancelled, killing");
                let _ = child.kill().await;
                Err(CommandError::Cancelled {
                    program: program.clone(),
                })
            }
        };

        let drained = tokio::time::timeout(READER_GRACE, async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(pr_id = self.pr_id, program = %program, "output still open after exit, detaching readers");
            for reader in &readers {
                reader.abort();
            }
        }

        self.flush().await;
        result
    }

    /// [`listen`](Self::listen), treating a non-zero exit as an error.
    pub async fn run(&self, cmd: Command) -> Result<(), CommandError> {
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();
        let status = self.listen(cmd).await?;
        if status.success() {
            Ok(())
        } else {
            Err(CommandError::NonZeroExit {
                program,
                code: status.code(),
            })
        }
    }

    fn spawn_reader<R>(&self, pipe: R, stream: Stream) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tx = self.log_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(LogMessage::Line(LogLine { stream, line })).is_err() {
                    break;
                }
            }
        })
    }
}

async fn consume_logs(
    pr_id: i64,
    mut rx: mpsc::UnboundedReceiver<LogMessage>,
    tail: Arc<Mutex<Tail>>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            LogMessage::Line(LogLine { stream, line }) => {
                info!(pr_id, %stream, "{}", line);
                let mut tail = lock(&tail);
                if tail.lines.len() == TAIL_CAPACITY {
                    tail.lines.pop_front();
                }
                tail.lines.push_back(line);
                tail.total += 1;
            }
            LogMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
