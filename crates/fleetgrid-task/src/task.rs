//! Listenable task — an explicit state machine over a parked value slot.
//!
//! The terminal state is published with a compare-and-swap while the
//! listener queue lock is held, and the queue is drained exactly once at
//! that transition. A listener registered afterwards takes the same lock,
//! observes the terminal outcome and is replayed on the spot, so it can
//! never be lost between the state check and the enqueue.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::error::{TaskError, TaskFailure, TaskResult};

const PENDING: u8 = 0;
const DONE: u8 = 1;
const CANCELLED: u8 = 2;

/// Lifecycle state of a task. `Done` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Done,
    Cancelled,
}

/// An outcome delivered to task listeners.
#[derive(Debug, Clone)]
pub enum TaskEvent<V> {
    Completed(V),
    Cancelled,
    Failed(TaskFailure),
}

impl<V> TaskEvent<V> {
    fn kind(&self) -> Interest {
        match self {
            TaskEvent::Completed(_) => Interest::COMPLETED,
            TaskEvent::Cancelled => Interest::CANCELLED,
            TaskEvent::Failed(_) => Interest::FAILED,
        }
    }
}

/// Set of events a listener wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Interest(u8);

impl Interest {
    const COMPLETED: Interest = Interest(0b001);
    const CANCELLED: Interest = Interest(0b010);
    const FAILED: Interest = Interest(0b100);
    const ALL: Interest = Interest(0b111);

    fn wants(self, event: Interest) -> bool {
        self.0 & event.0 != 0
    }
}

type Callback<V> = Box<dyn FnOnce(&TaskEvent<V>) + Send>;

struct Listener<V> {
    interest: Interest,
    callback: Callback<V>,
}

struct Slot<V> {
    /// Terminal outcome, written once.
    outcome: Option<TaskEvent<V>>,
    /// Last reported failure. Failing does not end the task.
    failure: Option<TaskFailure>,
    listeners: Vec<Listener<V>>,
}

struct Shared<V> {
    state: AtomicU8,
    slot: Mutex<Slot<V>>,
    parked: Condvar,
}

/// Shareable handle to a value that becomes available later.
///
/// Cloning the handle is cheap; every clone observes the same outcome.
pub struct Task<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for Task<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> fmt::Debug for Task<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.state.load(Ordering::Acquire) {
            DONE => TaskState::Done,
            CANCELLED => TaskState::Cancelled,
            _ => TaskState::Pending,
        };
        f.debug_struct("Task").field("state", &state).finish()
    }
}

impl<V: Clone + Send + 'static> Default for Task<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + 'static> Task<V> {
    /// Create a pending task.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(PENDING),
                slot: Mutex::new(Slot {
                    outcome: None,
                    failure: None,
                    listeners: Vec::new(),
                }),
                parked: Condvar::new(),
            }),
        }
    }

    /// Create a task that is already completed with `value`.
    pub fn completed(value: V) -> Self {
        let task = Self::new();
        task.complete(value);
        task
    }

    /// Create a task that is already cancelled.
    pub fn cancelled() -> Self {
        let task = Self::new();
        task.cancel();
        task
    }

    pub fn state(&self) -> TaskState {
        match self.shared.state.load(Ordering::Acquire) {
            DONE => TaskState::Done,
            CANCELLED => TaskState::Cancelled,
            _ => TaskState::Pending,
        }
    }

    /// Whether the task reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.state() != TaskState::Pending
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// The last failure reported through [`Task::fail`], if any.
    pub fn failure(&self) -> Option<TaskFailure> {
        self.shared.slot.lock().failure.clone()
    }

    /// Complete the task with `value`.
    ///
    /// Completion listeners run in registration order on the calling
    /// thread, then parked callers are released. Returns `false` if the
    /// task was already terminal.
    pub fn complete(&self, value: V) -> bool {
        self.finish(DONE, TaskEvent::Completed(value))
    }

    /// Cancel the task. Returns `false` if the task was already terminal.
    pub fn cancel(&self) -> bool {
        self.finish(CANCELLED, TaskEvent::Cancelled)
    }

    /// Report a failure.
    ///
    /// Only failure listeners are notified. No value is set and the task
    /// stays pending: blocked getters keep waiting and a later
    /// [`Task::complete`] or [`Task::cancel`] still applies.
    pub fn fail(&self, error: impl Into<anyhow::Error>) -> bool {
        self.fail_shared(Arc::new(error.into()))
    }

    /// Report an already shared failure, see [`Task::fail`].
    pub fn fail_shared(&self, failure: TaskFailure) -> bool {
        let listeners = {
            let mut slot = self.shared.slot.lock();
            if slot.outcome.is_some() {
                return false;
            }
            slot.failure = Some(Arc::clone(&failure));
            let (fire, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut slot.listeners)
                .into_iter()
                .partition(|listener| listener.interest.wants(Interest::FAILED));
            slot.listeners = keep;
            fire
        };
        self.shared.parked.notify_all();
        dispatch(listeners, &TaskEvent::Failed(failure));
        true
    }

    fn finish(&self, terminal: u8, event: TaskEvent<V>) -> bool {
        let listeners = {
            let mut slot = self.shared.slot.lock();
            if self
                .shared
                .state
                .compare_exchange(PENDING, terminal, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            slot.outcome = Some(event.clone());
            std::mem::take(&mut slot.listeners)
        };
        dispatch(listeners, &event);
        self.shared.parked.notify_all();
        true
    }

    // ── Listeners ──────────────────────────────────────────────────

    /// Run `listener` with the value once the task completes.
    pub fn on_complete<F>(&self, listener: F) -> &Self
    where
        F: FnOnce(V) + Send + 'static,
    {
        self.register(
            Interest::COMPLETED,
            Box::new(move |event| {
                if let TaskEvent::Completed(value) = event {
                    listener(value.clone());
                }
            }),
        );
        self
    }

    /// Run `listener` once the task is cancelled.
    pub fn on_cancelled<F>(&self, listener: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(
            Interest::CANCELLED,
            Box::new(move |event| {
                if let TaskEvent::Cancelled = event {
                    listener();
                }
            }),
        );
        self
    }

    /// Run `listener` with the failure once one is reported.
    pub fn on_failure<F>(&self, listener: F) -> &Self
    where
        F: FnOnce(TaskFailure) + Send + 'static,
    {
        self.register(
            Interest::FAILED,
            Box::new(move |event| {
                if let TaskEvent::Failed(failure) = event {
                    listener(Arc::clone(failure));
                }
            }),
        );
        self
    }

    /// Run `listener` with the first event of any kind.
    pub fn when_done<F>(&self, listener: F) -> &Self
    where
        F: FnOnce(&TaskEvent<V>) + Send + 'static,
    {
        self.register(Interest::ALL, Box::new(listener));
        self
    }

    fn register(&self, interest: Interest, callback: Callback<V>) {
        let mut slot = self.shared.slot.lock();
        let replay = match &slot.outcome {
            Some(outcome) => Some(outcome.clone()),
            None if interest.wants(Interest::FAILED) => {
                slot.failure.clone().map(TaskEvent::Failed)
            }
            None => None,
        };
        let Some(event) = replay else {
            slot.listeners.push(Listener { interest, callback });
            return;
        };
        drop(slot);

        if interest.wants(event.kind()) {
            invoke(callback, &event);
        }
    }

    // ── Blocking retrieval ─────────────────────────────────────────

    /// Park the calling thread until the task is terminal.
    pub fn get(&self) -> TaskResult<V> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(outcome) = &slot.outcome {
                return outcome_result(outcome);
            }
            self.shared.parked.wait(&mut slot);
        }
    }

    /// Park the calling thread until the task is terminal or `timeout`
    /// elapses.
    pub fn get_timeout(&self, timeout: Duration) -> TaskResult<V> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(outcome) = &slot.outcome {
                return outcome_result(outcome);
            }
            if self.shared.parked.wait_until(&mut slot, deadline).timed_out() {
                return match &slot.outcome {
                    Some(outcome) => outcome_result(outcome),
                    None => Err(TaskError::Timeout(timeout)),
                };
            }
        }
    }

    /// Like [`Task::get`], returning `default` on cancellation or once a
    /// failure is recorded.
    pub fn get_or_default(&self, default: V) -> V {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(outcome) = &slot.outcome {
                return outcome_result(outcome).unwrap_or(default);
            }
            if slot.failure.is_some() {
                return default;
            }
            self.shared.parked.wait(&mut slot);
        }
    }

    /// Like [`Task::get_timeout`], returning `default` on any error or
    /// recorded failure.
    pub fn get_or_default_timeout(&self, default: V, timeout: Duration) -> V {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(outcome) = &slot.outcome {
                return outcome_result(outcome).unwrap_or(default);
            }
            if slot.failure.is_some() {
                return default;
            }
            if self.shared.parked.wait_until(&mut slot, deadline).timed_out() {
                return match &slot.outcome {
                    Some(outcome) => outcome_result(outcome).unwrap_or(default),
                    None => default,
                };
            }
        }
    }

    /// Derive a task completing with `mapper(value)`.
    ///
    /// Cancellation and failures of this task are forwarded.
    pub fn map<U, F>(&self, mapper: F) -> Task<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(V) -> U + Send + 'static,
    {
        let mapped = Task::new();
        let target = mapped.clone();
        self.when_done(move |event| match event {
            TaskEvent::Completed(value) => {
                target.complete(mapper(value.clone()));
            }
            TaskEvent::Cancelled => {
                target.cancel();
            }
            TaskEvent::Failed(failure) => {
                target.fail_shared(Arc::clone(failure));
            }
        });
        mapped
    }
}

fn outcome_result<V: Clone>(outcome: &TaskEvent<V>) -> TaskResult<V> {
    match outcome {
        TaskEvent::Completed(value) => Ok(value.clone()),
        TaskEvent::Cancelled => Err(TaskError::Cancelled),
        TaskEvent::Failed(failure) => Err(TaskError::Failed(Arc::clone(failure))),
    }
}

fn dispatch<V>(listeners: Vec<Listener<V>>, event: &TaskEvent<V>) {
    let kind = event.kind();
    for listener in listeners {
        if listener.interest.wants(kind) {
            invoke(listener.callback, event);
        }
    }
}

/// Run a listener, containing any panic it raises.
fn invoke<V>(callback: Callback<V>, event: &TaskEvent<V>) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || callback(event))) {
        error!(panic = panic_message(payload.as_ref()), "task listener panicked");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}
