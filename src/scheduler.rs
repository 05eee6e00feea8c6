//! Parallel execution of a [`MergeList`].
//!
//! The scheduler is a single control loop. Each admitted step runs its
//! phases in a spawned tokio task that talks to the [`BuildExecutor`]; the
//! loop only reacts to task completions, the load-average timer and the
//! cancellation signal. A step is admitted once every step it depends on has
//! succeeded, fewer than `max_jobs` steps are running and, unless nothing
//! is running at all, the last sampled load is below `max_load`.
//!
//! On failure the default is to admit nothing more and let running steps
//! finish. With `keep_going` only the steps depending on the failed one are
//! pruned. Cancellation drops every queued step and asks running ones to
//! terminate, aborting them after a grace period.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::Options;
use crate::executor::{BuildExecutor, LoadSampler, Phase, ProcLoadAvg};
use crate::merge_order::MergeList;
use crate::package::{ChangeKind, Package};
use crate::task::{Task, TaskState};

/// Exit code reported for a step that ran out of time.
pub const TIMEOUT_EXIT: i32 = 124;
/// Exit code reported when a phase could not be run at all.
pub const EXECUTOR_ERROR_EXIT: i32 = 1;

/// Admission and timing limits.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Concurrent steps; `None` for unbounded.
    pub max_jobs: Option<usize>,
    /// No new step starts while the load average is at or above this,
    /// unless nothing is running.
    pub max_load: Option<f64>,
    /// Keep running steps that do not depend on a failed one.
    pub keep_going: bool,
    /// How often the load average is sampled.
    pub load_check_interval: Duration,
    /// Time a terminated step gets to finish on its own.
    pub termination_grace: Duration,
    /// Wall-clock limit per step.
    pub task_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&Options::default())
    }
}

impl From<&Options> for SchedulerConfig {
    fn from(options: &Options) -> Self {
        Self {
            max_jobs: options.max_jobs(),
            max_load: options.load_average,
            keep_going: options.keep_going,
            load_check_interval: options.load_check_interval(),
            termination_grace: options.termination_grace(),
            task_timeout: options.task_timeout(),
        }
    }
}

/// Requests cancellation of a running [`Scheduler::run`].
///
/// A request made while no run is active stops the next one. The run that
/// is stopped clears the request, so later runs start normally.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// A step that failed.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    /// The package whose step failed.
    pub package: Package,
    /// The failing phase; `None` if the task itself broke down.
    pub phase: Option<Phase>,
    /// Exit code of the failing phase, [`TIMEOUT_EXIT`] on timeout.
    pub returncode: Option<i32>,
    /// Human-readable cause.
    pub reason: String,
}

/// Successful operations per kind of change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeCounts {
    /// Slots that had nothing installed.
    pub new: usize,
    /// Replaced by a higher version.
    pub upgraded: usize,
    /// Replaced by a lower version.
    pub downgraded: usize,
    /// Same version built again.
    pub reinstalled: usize,
    /// Removed.
    pub uninstalled: usize,
}

impl ChangeCounts {
    fn record(&mut self, change: ChangeKind) {
        match change {
            ChangeKind::New => self.new += 1,
            ChangeKind::Upgrade => self.upgraded += 1,
            ChangeKind::Downgrade => self.downgraded += 1,
            ChangeKind::Reinstall => self.reinstalled += 1,
            ChangeKind::Uninstall => self.uninstalled += 1,
        }
    }
}

/// Outcome of a scheduling run.
#[derive(Debug, Clone, Default)]
pub struct SchedulerReport {
    /// Final state of every step, in plan order.
    pub states: Vec<(Package, TaskState)>,
    /// Steps that completed, in plan order.
    pub succeeded: Vec<Package>,
    pub failed: Vec<TaskFailure>,
    /// Steps never started because a step they needed failed.
    pub skipped: Vec<Package>,
    /// Steps stopped or dropped by cancellation.
    pub cancelled: Vec<Package>,
    /// Successful steps by kind of change.
    pub counts: ChangeCounts,
    /// Bytes fetched for the successful merges.
    pub download_size: u64,
    /// The run was stopped through a [`CancelHandle`].
    pub interrupted: bool,
}

impl SchedulerReport {
    /// Every step succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && self.cancelled.is_empty() && !self.interrupted
    }

    /// State of a package's step.
    pub fn state_of(&self, pkg: &Package) -> Option<TaskState> {
        self.states.iter().find(|(p, _)| p == pkg).map(|(_, s)| *s)
    }
}

impl fmt::Display for SchedulerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counts;
        writeln!(
            f,
            "{} new, {} upgraded, {} downgraded, {} reinstalled, {} uninstalled; {} bytes downloaded",
            c.new, c.upgraded, c.downgraded, c.reinstalled, c.uninstalled, self.download_size
        )?;
        for failure in &self.failed {
            match (failure.phase, failure.returncode) {
                (Some(phase), Some(code)) => {
                    writeln!(f, "failed: {} ({phase}, exit status {code}): {}", failure.package, failure.reason)?
                }
                _ => writeln!(f, "failed: {}: {}", failure.package, failure.reason)?,
            }
        }
        if !self.skipped.is_empty() {
            writeln!(f, "skipped: {}", join(&self.skipped))?;
        }
        if !self.cancelled.is_empty() {
            writeln!(f, "cancelled: {}", join(&self.cancelled))?;
        }
        if self.interrupted {
            writeln!(f, "interrupted")?;
        }
        Ok(())
    }
}

fn join(pkgs: &[Package]) -> String {
    pkgs.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
}

/// Callback invoked whenever a step reaches a terminal state.
pub type TaskListener = Arc<dyn Fn(&Task) + Send + Sync>;

#[derive(Debug)]
enum TaskResult {
    Succeeded,
    Failed {
        returncode: i32,
        phase: Option<Phase>,
        reason: String,
    },
    Cancelled,
}

/// Runs merge lists against a [`BuildExecutor`].
pub struct Scheduler {
    config: SchedulerConfig,
    executor: Arc<dyn BuildExecutor>,
    sampler: Arc<dyn LoadSampler>,
    cancel: Arc<watch::Sender<bool>>,
    listeners: Vec<TaskListener>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, executor: Arc<dyn BuildExecutor>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            config,
            executor,
            sampler: Arc::new(ProcLoadAvg::default()),
            cancel: Arc::new(cancel),
            listeners: Vec::new(),
        }
    }

    /// Replace the `/proc/loadavg` sampler.
    pub fn with_load_sampler(mut self, sampler: Arc<dyn LoadSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// A handle that cancels the current (or next) run; see [`CancelHandle`].
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Get notified of every step that finishes, as it happens.
    pub fn on_task_exit(&mut self, listener: impl Fn(&Task) + Send + Sync + 'static) {
        self.listeners.push(Arc::new(listener));
    }

    fn sample_load(&self) -> Option<f64> {
        self.config.max_load?;
        match self.sampler.current_load() {
            Ok(load) => Some(load),
            Err(error) => {
                warn!(%error, "cannot sample load average");
                None
            }
        }
    }

    fn admits(&self, running: usize, load: Option<f64>) -> bool {
        if self.config.max_jobs.is_some_and(|max| running >= max) {
            return false;
        }
        running == 0
            || match (self.config.max_load, load) {
                (Some(max), Some(load)) => load < max,
                _ => true,
            }
    }

    /// Execute a plan and report what happened to every step.
    pub async fn run(&self, plan: &MergeList) -> SchedulerReport {
        let n = plan.steps.len();
        let mut tasks: Vec<Task> = plan.steps.iter().map(|s| Task::new(s.package.clone())).collect();
        for task in &mut tasks {
            for listener in &self.listeners {
                let listener = listener.clone();
                task.add_exit_listener(move |t| listener(t));
            }
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut waiting: Vec<usize> = vec![0; n];
        for (i, step) in plan.steps.iter().enumerate() {
            for &dep in step.deps.iter().filter(|&&d| d < n) {
                dependents[dep].push(i);
                waiting[i] += 1;
            }
        }
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| waiting[i] == 0).collect();
        let mut pruned: HashSet<usize> = HashSet::new();

        let mut running: JoinSet<(usize, TaskResult)> = JoinSet::new();
        let mut running_ids: HashMap<tokio::task::Id, usize> = HashMap::new();
        let merge_lock = Arc::new(Mutex::new(()));
        let mut cancel_rx = self.cancel.subscribe();
        let mut interrupted = *cancel_rx.borrow_and_update();
        let mut stopping = false;

        let period = self.config.load_check_interval;
        let mut load_timer = tokio::time::interval_at(Instant::now() + period, period);
        load_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut load = self.sample_load();

        info!(steps = n, max_jobs = ?self.config.max_jobs, max_load = ?self.config.max_load, "starting merge");

        loop {
            if interrupted {
                ready.clear();
                for task in tasks.iter_mut().filter(|t| t.state() == TaskState::Queued) {
                    task.cancel("interrupted");
                }
            } else if !stopping {
                while let Some(&i) = ready.first() {
                    if !self.admits(running.len(), load) {
                        trace!(running = running.len(), ?load, "admission deferred");
                        break;
                    }
                    ready.remove(&i);
                    tasks[i].start();
                    debug!(package = %tasks[i].package(), running = running.len() + 1, "starting");
                    let handle = running.spawn(execute(
                        i,
                        self.executor.clone(),
                        tasks[i].package().clone(),
                        merge_lock.clone(),
                        self.config.task_timeout,
                        self.config.termination_grace,
                        self.cancel.subscribe(),
                    ));
                    running_ids.insert(handle.id(), i);
                }
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                Some(joined) = running.join_next_with_id() => {
                    let (i, result) = match joined {
                        Ok((id, (i, result))) => {
                            running_ids.remove(&id);
                            (i, result)
                        }
                        Err(error) => {
                            let Some(i) = running_ids.remove(&error.id()) else {
                                continue;
                            };
                            let result = TaskResult::Failed {
                                returncode: EXECUTOR_ERROR_EXIT,
                                phase: None,
                                reason: format!("task aborted: {error}"),
                            };
                            (i, result)
                        }
                    };
                    match result {
                        TaskResult::Succeeded => {
                            info!(package = %tasks[i].package(), "merged");
                            tasks[i].succeed();
                            for &d in &dependents[i] {
                                waiting[d] -= 1;
                                if waiting[d] == 0 && tasks[d].state() == TaskState::Queued {
                                    ready.insert(d);
                                }
                            }
                        }
                        TaskResult::Failed { returncode, phase, reason } => {
                            warn!(package = %tasks[i].package(), ?phase, returncode, %reason, "failed");
                            tasks[i].fail(returncode, phase, reason);
                            if self.config.keep_going {
                                let failed = tasks[i].package().to_string();
                                let mut queue: VecDeque<usize> = dependents[i].iter().copied().collect();
                                while let Some(d) = queue.pop_front() {
                                    if tasks[d].cancel(format!("dependency {failed} failed")) {
                                        debug!(package = %tasks[d].package(), "pruned");
                                        ready.remove(&d);
                                        pruned.insert(d);
                                        queue.extend(dependents[d].iter().copied());
                                    }
                                }
                            } else if !stopping {
                                stopping = true;
                                for (j, task) in tasks.iter_mut().enumerate() {
                                    if task.state() == TaskState::Queued && task.cancel("not started after an earlier failure") {
                                        pruned.insert(j);
                                    }
                                }
                                ready.clear();
                            }
                        }
                        TaskResult::Cancelled => {
                            debug!(package = %tasks[i].package(), "cancelled");
                            tasks[i].cancel("interrupted");
                        }
                    }
                }
                _ = load_timer.tick(), if self.config.max_load.is_some() => {
                    load = self.sample_load();
                    trace!(?load, "sampled load average");
                }
                changed = cancel_rx.changed(), if !interrupted => {
                    if changed.is_ok() && *cancel_rx.borrow_and_update() {
                        warn!(running = running.len(), "cancelling merge");
                        interrupted = true;
                    }
                }
            }
        }

        if interrupted {
            self.cancel.send_replace(false);
        }

        let mut report = SchedulerReport {
            interrupted,
            ..SchedulerReport::default()
        };
        for (i, (task, step)) in tasks.iter().zip(&plan.steps).enumerate() {
            report.states.push((step.package.clone(), task.state()));
            match task.state() {
                TaskState::Succeeded => {
                    report.succeeded.push(step.package.clone());
                    report.counts.record(step.change);
                    if step.package.is_merge() {
                        report.download_size += step.package.metadata().download_size;
                    }
                }
                TaskState::Failed => report.failed.push(TaskFailure {
                    package: step.package.clone(),
                    phase: task.failed_phase(),
                    returncode: task.returncode(),
                    reason: task.reason().unwrap_or_default().to_string(),
                }),
                TaskState::Cancelled if pruned.contains(&i) => report.skipped.push(step.package.clone()),
                TaskState::Cancelled | TaskState::Queued | TaskState::Running => {
                    report.cancelled.push(step.package.clone())
                }
            }
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled.len(),
            "merge finished"
        );
        report
    }
}

/// Run every phase of one step, honoring the timeout and cancellation.
async fn execute(
    index: usize,
    executor: Arc<dyn BuildExecutor>,
    pkg: Package,
    merge_lock: Arc<Mutex<()>>,
    timeout: Option<Duration>,
    grace: Duration,
    mut cancel: watch::Receiver<bool>,
) -> (usize, TaskResult) {
    let work = async {
        let phases = run_phases(executor.as_ref(), &pkg, &merge_lock);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, phases).await.unwrap_or_else(|_| TaskResult::Failed {
                returncode: TIMEOUT_EXIT,
                phase: None,
                reason: format!("timed out after {}s", limit.as_secs()),
            }),
            None => phases.await,
        }
    };
    tokio::pin!(work);

    let result = tokio::select! {
        result = &mut work => result,
        _ = cancelled(&mut cancel) => {
            executor.terminate(&pkg).await;
            match tokio::time::timeout(grace, &mut work).await {
                Ok(TaskResult::Succeeded) => TaskResult::Succeeded,
                Ok(_) => TaskResult::Cancelled,
                Err(_) => {
                    warn!(package = %pkg, "did not stop within the grace period, aborting");
                    TaskResult::Cancelled
                }
            }
        }
    };
    (index, result)
}

async fn run_phases(executor: &dyn BuildExecutor, pkg: &Package, merge_lock: &Mutex<()>) -> TaskResult {
    for &phase in Phase::sequence(pkg) {
        let _guard = if phase.is_serialized() {
            Some(merge_lock.lock().await)
        } else {
            None
        };
        trace!(package = %pkg, %phase, "running phase");
        match executor.execute_phase(pkg, phase).await {
            Ok(0) => {}
            Ok(code) => {
                return TaskResult::Failed {
                    returncode: code,
                    phase: Some(phase),
                    reason: format!("{phase} exited with status {code}"),
                };
            }
            Err(error) => {
                return TaskResult::Failed {
                    returncode: EXECUTOR_ERROR_EXIT,
                    phase: Some(phase),
                    reason: error.to_string(),
                };
            }
        }
    }
    TaskResult::Succeeded
}

/// Resolves once cancellation is requested; never if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
