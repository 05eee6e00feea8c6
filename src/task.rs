//! The unit of scheduled work: one package operation.

use std::fmt;

use tracing::trace;

use crate::executor::Phase;
use crate::package::Package;

/// Lifecycle of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Waiting for its dependencies or a job slot.
    Queued,
    /// Phases are executing.
    Running,
    /// Every phase exited with 0.
    Succeeded,
    /// A phase failed, errored or timed out.
    Failed,
    /// Pruned or interrupted before completing.
    Cancelled,
}

impl TaskState {
    /// Whether the task will not change state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Callback run once when a task reaches a terminal state.
pub type ExitListener = Box<dyn FnOnce(&Task) + Send>;

/// One package merge or unmerge tracked by the scheduler.
pub struct Task {
    package: Package,
    state: TaskState,
    returncode: Option<i32>,
    failed_phase: Option<Phase>,
    reason: Option<String>,
    listeners: Vec<ExitListener>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("package", &self.package.to_string())
            .field("state", &self.state)
            .field("returncode", &self.returncode)
            .field("failed_phase", &self.failed_phase)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Task {
    /// A queued task for a package.
    pub fn new(package: Package) -> Self {
        Self {
            package,
            state: TaskState::Queued,
            returncode: None,
            failed_phase: None,
            reason: None,
            listeners: Vec::new(),
        }
    }

    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Exit status: unset until the task has run to completion.
    pub fn returncode(&self) -> Option<i32> {
        self.returncode
    }

    /// The phase that failed, if any.
    pub fn failed_phase(&self) -> Option<Phase> {
        self.failed_phase
    }

    /// Why the task failed or was cancelled.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.state.is_terminal()
    }

    /// Register a listener. On a finished task it runs right away.
    pub fn add_exit_listener(&mut self, listener: impl FnOnce(&Task) + Send + 'static) {
        if self.is_done() {
            listener(&*self);
        } else {
            self.listeners.push(Box::new(listener));
        }
    }

    /// `Queued -> Running`. Returns `false` for any other state.
    pub fn start(&mut self) -> bool {
        if self.state != TaskState::Queued {
            return false;
        }
        self.state = TaskState::Running;
        true
    }

    /// `Running -> Succeeded`.
    pub fn succeed(&mut self) -> bool {
        self.finish(TaskState::Succeeded, Some(0), None, None)
    }

    /// `Running -> Failed`.
    pub fn fail(&mut self, returncode: i32, phase: Option<Phase>, reason: impl Into<String>) -> bool {
        self.finish(TaskState::Failed, Some(returncode), phase, Some(reason.into()))
    }

    /// `Queued | Running -> Cancelled`.
    pub fn cancel(&mut self, reason: impl Into<String>) -> bool {
        self.finish(TaskState::Cancelled, None, None, Some(reason.into()))
    }

    fn finish(&mut self, state: TaskState, returncode: Option<i32>, phase: Option<Phase>, reason: Option<String>) -> bool {
        let allowed = match state {
            TaskState::Cancelled => !self.is_done(),
            _ => self.state == TaskState::Running,
        };
        if !allowed {
            trace!(package = %self.package, from = %self.state, to = %state, "ignoring task transition");
            return false;
        }
        self.state = state;
        self.returncode = returncode;
        self.failed_phase = phase;
        self.reason = reason;
        for listener in std::mem::take(&mut self.listeners) {
            listener(&*self);
        }
        true
    }
}
