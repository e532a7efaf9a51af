use crate::{
    error::{SyncError, SyncResult, TaskFailure},
    reconcile::{ReuseAction, SearchAction},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum TaskMessage<P, R> {
    Progress { data: P, fraction: f32 },
    Resolve(R),
    Reject(TaskFailure),
}

impl<P, R> TaskMessage<P, R> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskMessage::Progress { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "params", rename_all = "snake_case")]
pub enum Command {
    Terminate,
    ModReuse {
        mod_name: String,
        action: ReuseAction,
        location: PathBuf,
    },
    ModSearch {
        action: SearchAction,
        #[serde(default)]
        location: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            Err(SyncError::Terminated)
        } else {
            Ok(())
        }
    }
}

pub struct TaskContext<P, R> {
    outbound: Sender<TaskMessage<P, R>>,
    commands: Receiver<Command>,
    pending: VecDeque<Command>,
    cancel: CancelToken,
}

impl<P, R> TaskContext<P, R> {
    pub fn progress(&self, data: P, fraction: f32) {
        let _ = self.outbound.send(TaskMessage::Progress {
            data,
            fraction: fraction.clamp(0.0, 1.0),
        });
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn checkpoint(&mut self) -> SyncResult<()> {
        self.cancel.check()?;
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.accept(command)?,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return self.caller_gone(),
            }
        }
    }

    pub fn next_command(&mut self, wait: Duration) -> SyncResult<Option<Command>> {
        self.checkpoint()?;
        if let Some(command) = self.pending.pop_front() {
            return Ok(Some(command));
        }
        match self.commands.recv_timeout(wait) {
            Ok(command) => {
                self.accept(command)?;
                Ok(self.pending.pop_front())
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => self.caller_gone().map(|_| None),
        }
    }

    fn accept(&mut self, command: Command) -> SyncResult<()> {
        if command == Command::Terminate {
            tracing::info!("terminate requested");
            self.cancel.cancel();
            return Err(SyncError::Terminated);
        }
        self.pending.push_back(command);
        Ok(())
    }

    fn caller_gone(&mut self) -> SyncResult<()> {
        self.cancel.cancel();
        Err(SyncError::Terminated)
    }
}

pub struct TaskHandle<P, R> {
    name: String,
    outbound: Receiver<TaskMessage<P, R>>,
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
    finished: bool,
}

impl<P, R> TaskHandle<P, R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn commander(&self) -> Commander {
        Commander(self.commands.clone())
    }

    pub fn send(&self, command: Command) -> bool {
        !self.finished && self.commands.send(command).is_ok()
    }

    pub fn terminate(&self) -> bool {
        self.send(Command::Terminate)
    }

    pub fn poll(&mut self) -> Vec<TaskMessage<P, R>> {
        let mut out = Vec::new();
        while !self.finished {
            match self.outbound.try_recv() {
                Ok(message) => self.push(message, &mut out),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.push(self.lost_worker(), &mut out),
            }
        }
        out
    }

    pub fn wait_next(&mut self, tick: Duration) -> Option<TaskMessage<P, R>> {
        if self.finished {
            return None;
        }
        let message = match self.outbound.recv_timeout(tick) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => self.lost_worker(),
        };
        if message.is_terminal() {
            self.finish();
        }
        Some(message)
    }

    fn push(&mut self, message: TaskMessage<P, R>, out: &mut Vec<TaskMessage<P, R>>) {
        let terminal = message.is_terminal();
        out.push(message);
        if terminal {
            self.finish();
        }
    }

    fn lost_worker(&self) -> TaskMessage<P, R> {
        tracing::error!(task = %self.name, "worker exited without a result");
        TaskMessage::Reject(TaskFailure::internal(format!(
            "{} stopped unexpectedly",
            self.name
        )))
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(task = %self.name, "worker panicked");
            }
        }
    }
}

impl<P, R> Drop for TaskHandle<P, R> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.commands.send(Command::Terminate);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Commander(Sender<Command>);

impl Commander {
    pub fn send(&self, command: Command) -> bool {
        self.0.send(command).is_ok()
    }
}

/// Runs `work` on a dedicated OS thread that owns all of its state. The
/// caller reaches it only through the message and command channels; the
/// `CancelToken` is created inside the worker and never handed out.
pub fn spawn_task<P, R, F>(name: &str, work: F) -> std::io::Result<TaskHandle<P, R>>
where
    P: Send + 'static,
    R: Send + 'static,
    F: FnOnce(&mut TaskContext<P, R>) -> SyncResult<R> + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel();
    let (command_tx, command_rx) = mpsc::channel();
    let task_name = name.to_string();

    let thread = thread::Builder::new()
        .name(format!("modsync-{name}"))
        .spawn(move || {
            let mut ctx = TaskContext {
                outbound: outbound_tx,
                commands: command_rx,
                pending: VecDeque::new(),
                cancel: CancelToken::new(),
            };
            let message = match work(&mut ctx) {
                Ok(result) => TaskMessage::Resolve(result),
                Err(err) => {
                    if err.is_terminated() {
                        tracing::info!(task = %task_name, "task terminated");
                    } else {
                        tracing::warn!(task = %task_name, error = %err, "task failed");
                    }
                    TaskMessage::Reject(err.failure())
                }
            };
            let _ = ctx.outbound.send(message);
        })?;

    Ok(TaskHandle {
        name: name.to_string(),
        outbound: outbound_rx,
        commands: command_tx,
        thread: Some(thread),
        finished: false,
    })
}

pub fn drive<P, R>(
    mut handle: TaskHandle<P, R>,
    tick: Duration,
    mut on_progress: impl FnMut(P, f32),
) -> Result<R, TaskFailure> {
    loop {
        match handle.wait_next(tick) {
            Some(TaskMessage::Progress { data, fraction }) => on_progress(data, fraction),
            Some(TaskMessage::Resolve(result)) => return Ok(result),
            Some(TaskMessage::Reject(failure)) => return Err(failure),
            None if handle.is_finished() => {
                return Err(TaskFailure::internal("task already finished"))
            }
            None => {}
        }
    }
}
