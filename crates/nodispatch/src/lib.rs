//! # nodispatch
//!
//! A small Rust crate for dispatching units of work to a shared worker on Tokio,
//! with a fixed concurrency ceiling, a strict FIFO backlog and a drain notification.
//!
//! ## Overview
//!
//! `nodispatch` provides a [`Dispatcher`] that:
//!
//! * **Bounds concurrency** - at most `concurrency` tasks are in flight at any time
//! * **Starts work in order** - waiting tasks are started in submission order
//! * **Reports draining** - an optional notifier runs once each time all work is done
//! * **Never recurses** - dispatching is always deferred to the runtime, so a worker that
//!   completes synchronously cannot grow the call stack
//!
//! ## Quick Start
//!
//! ```rust
//! use nodispatch::{Completion, Dispatcher, DispatcherConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = DispatcherConfig::default();
//!     config
//!         .with_limit(3)
//!         .with_notifier(|| println!("all work finished"));
//!
//!     // The worker receives each payload plus a completion handle.
//!     let dispatcher = Dispatcher::new(
//!         |n: u64, done: Completion<u64>| {
//!             tokio::spawn(async move {
//!                 tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//!                 done.complete(n * 2);
//!             });
//!         },
//!         config,
//!     )?;
//!
//!     for i in 0..10 {
//!         dispatcher.submit(i, move |doubled| println!("{i} -> {doubled}"));
//!     }
//!
//!     dispatcher.wait_idle().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Workers
//!
//! A [`Worker`] is shared by every task of a dispatcher and may be invoked concurrently,
//! up to the ceiling. It receives the payload and a [`Completion`], and must eventually
//! call [`Completion::complete`] with the result. The dispatcher never waits on the worker;
//! whether it spawns, performs I/O or completes on the spot is up to the worker.
//!
//! A worker that holds on to its completion forever occupies one slot forever. There is
//! no timeout. Dropping a completion without a result releases the slot, but the task's
//! callback is never invoked.
//!
//! Async code can use [`worker_fn_async`] instead of handling completions directly.
//!
//! ### Draining
//!
//! The notifier runs once per transition from "work outstanding" to "fully idle" (empty
//! backlog, nothing in flight). [`Dispatcher::wait_idle`] is the async equivalent.
//!
//! ### Errors
//!
//! The dispatcher has no notion of task failure: a fallible worker reports failure inside
//! its result type, for example `R = anyhow::Result<T>`, and the dispatcher forwards it
//! untouched. [`DispatchError`] only covers misconfiguration and abandoned results.
//!
//! Panics raised by the completion callback or the notifier are caught and logged, so a
//! misbehaving callback cannot corrupt the in-flight accounting.
//!
//! ### Lifetime
//!
//! [`Dispatcher`] is a cheap handle and can be cloned. Once every handle is dropped, tasks
//! still in the backlog are never started. Tasks already in flight still deliver their
//! results to their callbacks.

use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    future::Future,
    num::NonZeroUsize,
    panic::{AssertUnwindSafe, catch_unwind},
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tokio::{runtime::Handle, sync::Notify};

/// Extension traits for [`DispatcherConfig`].
pub mod extensions {
    use std::num::NonZeroUsize;

    use crate::DispatcherConfig;

    /// Sizes the concurrency ceiling after the host.
    pub trait WithSysLimitCpus {
        /// Sets the ceiling to the number of available CPUs, or 1 if it cannot be determined.
        fn with_limit_to_system_cpus(&mut self) -> &mut Self;
    }

    impl WithSysLimitCpus for DispatcherConfig {
        fn with_limit_to_system_cpus(&mut self) -> &mut Self {
            let cpus = std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN);
            self.with_limit(cpus.get())
        }
    }
}

/// Environment variable read by [`DispatcherConfig::from_env`].
pub const CONCURRENCY_ENV: &str = "NODISPATCH_CONCURRENCY";

/// Errors reported by the dispatcher.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    /// A construction argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// No Tokio runtime was available to schedule dispatch passes on.
    #[error("dispatcher must be created within a tokio runtime")]
    NoRuntime,
    /// The worker dropped the task's completion without producing a result.
    #[error("task completion was dropped without a result")]
    Abandoned,
}

/// The concurrency ceiling of a dispatcher. Always strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Concurrency(NonZeroUsize);

impl Concurrency {
    /// Rejects a ceiling of zero.
    pub fn new(limit: usize) -> Result<Self, DispatchError> {
        NonZeroUsize::new(limit).map(Self).ok_or_else(|| {
            DispatchError::InvalidArgument("`concurrency` must be a number greater than 0".into())
        })
    }

    /// The ceiling as a plain count.
    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl TryFrom<i64> for Concurrency {
    type Error = DispatchError;

    fn try_from(limit: i64) -> Result<Self, Self::Error> {
        let limit = usize::try_from(limit).map_err(|_| {
            DispatchError::InvalidArgument(format!(
                "`concurrency` must be a number greater than 0, got {limit}"
            ))
        })?;
        Self::new(limit)
    }
}

impl FromStr for Concurrency {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let limit: i64 = s.trim().parse().map_err(|_| {
            DispatchError::InvalidArgument(format!(
                "`concurrency` must be a number greater than 0, got {s:?}"
            ))
        })?;
        Self::try_from(limit)
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

type Notifier = Arc<dyn Fn() + Send + Sync + 'static>;

/// Construction options for a [`Dispatcher`].
///
/// The ceiling has no default: a config without one is rejected by [`Dispatcher::new`].
#[derive(Clone, Default)]
pub struct DispatcherConfig {
    limit: usize,
    notifier: Option<Notifier>,
}

impl DispatcherConfig {
    /// Reads the ceiling from `NODISPATCH_CONCURRENCY`.
    pub fn from_env() -> Result<Self, DispatchError> {
        Self::from_var(std::env::var(CONCURRENCY_ENV))
    }

    fn from_var(raw: Result<String, std::env::VarError>) -> Result<Self, DispatchError> {
        let raw = raw.map_err(|e| {
            DispatchError::InvalidArgument(format!("{CONCURRENCY_ENV} is unusable: {e}"))
        })?;
        let concurrency: Concurrency = raw.parse()?;

        let mut config = Self::default();
        config.with_concurrency(concurrency);
        Ok(config)
    }

    /// Sets how many tasks may be in flight at once.
    ///
    /// The value is validated by [`Dispatcher::new`]; a limit of 0 is rejected there.
    ///
    /// # Example
    ///
    /// ```rust
    /// use nodispatch::DispatcherConfig;
    ///
    /// let mut config = DispatcherConfig::default();
    /// config.with_limit(8);
    /// assert_eq!(config.limit(), 8);
    /// ```
    pub fn with_limit(&mut self, limit: usize) -> &mut Self {
        self.limit = limit;
        self
    }

    /// Sets the ceiling from an already validated [`Concurrency`].
    pub fn with_concurrency(&mut self, concurrency: Concurrency) -> &mut Self {
        self.with_limit(concurrency.get())
    }

    /// Called once every time the dispatcher drains.
    pub fn with_notifier<F>(&mut self, notifier: F) -> &mut Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    /// The configured ceiling, 0 if none was set.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl fmt::Debug for DispatcherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherConfig")
            .field("limit", &self.limit)
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

/// Identifies a submitted task within its dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// The raw id. Ids count up from 0 in submission order.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Performs the work of a task.
///
/// `run` may be called concurrently, up to the dispatcher's ceiling. It must not block:
/// long-running work should be spawned, with `done` moved into it.
pub trait Worker<P, R>: Send + Sync + 'static {
    fn run(&self, payload: P, done: Completion<R>);
}

impl<P, R, F> Worker<P, R> for F
where
    F: Fn(P, Completion<R>) + Send + Sync + 'static,
{
    fn run(&self, payload: P, done: Completion<R>) {
        self(payload, done)
    }
}

/// Builds a worker from an async function. Each payload's future is spawned on the
/// current runtime and its output becomes the task's result.
pub fn worker_fn_async<P, R, F, TFut>(f: F) -> impl Worker<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(P) -> TFut + Send + Sync + 'static,
    TFut: Future<Output = R> + Send + 'static,
{
    move |payload: P, done: Completion<R>| {
        let fut = f(payload);
        tokio::spawn(async move {
            done.complete(fut.await);
        });
    }
}

type OnComplete<R> = Box<dyn FnOnce(R) + Send + 'static>;

/// The dispatcher side of a [`Completion`].
trait Settle: Send + Sync {
    /// Frees the task's slot. `deliver` runs the task's callback, or nothing for an
    /// abandoned task.
    fn settle(&self, task: TaskId, deliver: &mut dyn FnMut());
}

/// Handle through which a worker reports that a task has finished.
///
/// [`complete`](Completion::complete) consumes the handle, so a task completes at most
/// once. Dropping the handle without completing frees the task's slot without invoking
/// its callback.
#[must_use = "a task only finishes once its completion is invoked"]
pub struct Completion<R> {
    task: TaskId,
    pending: Option<Pending<R>>,
}

struct Pending<R> {
    on_complete: OnComplete<R>,
    dispatcher: Weak<dyn Settle>,
}

impl<R> Completion<R> {
    /// The id `submit` returned for this task.
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// Finishes the task, forwarding `result` to its callback.
    pub fn complete(mut self, result: R) {
        let Some(Pending {
            on_complete,
            dispatcher,
        }) = self.pending.take()
        else {
            return;
        };

        let mut call = Some((on_complete, result));
        let mut deliver = || {
            if let Some((on_complete, result)) = call.take() {
                on_complete(result);
            }
        };

        match dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.settle(self.task, &mut deliver),
            // the dispatcher is gone; there is no accounting left to do
            None => contain(self.task, "completion callback", deliver),
        }
    }
}

impl<R> Drop for Completion<R> {
    fn drop(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        tracing::warn!(task = %self.task, "task completion dropped without a result");
        if let Some(dispatcher) = pending.dispatcher.upgrade() {
            dispatcher.settle(self.task, &mut || {});
        }
    }
}

impl<R> fmt::Debug for Completion<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("task", &self.task)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

struct Task<P, R> {
    id: TaskId,
    payload: P,
    on_complete: OnComplete<R>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Pass {
    #[default]
    Idle,
    Dispatching,
}

struct State<P, R> {
    backlog: VecDeque<Task<P, R>>,
    in_flight: usize,
    pass: Pass,
    // set by every submission, cleared by the drain notification
    outstanding: bool,
    // drain notifications claimed but not yet delivered
    notifying: usize,
    next_id: u64,
}

impl<P, R> State<P, R> {
    /// Takes the head of the backlog if there is a free slot, accounting it as in flight.
    fn take_next(&mut self, limit: usize) -> Option<Task<P, R>> {
        if self.in_flight >= limit {
            return None;
        }

        let task = self.backlog.pop_front()?;
        self.in_flight += 1;
        Some(task)
    }

    /// Releases the slot of a task that finished. Every started task finishes once.
    fn finish_one(&mut self) {
        debug_assert!(self.in_flight > 0, "task finished with nothing in flight");
        self.in_flight -= 1;
    }

    fn is_idle(&self) -> bool {
        self.backlog.is_empty() && self.in_flight == 0
    }

    /// Claims the pending drain notification, if the dispatcher just became idle.
    fn take_drain(&mut self) -> bool {
        if self.outstanding && self.is_idle() {
            self.outstanding = false;
            self.notifying += 1;
            return true;
        }

        false
    }

    /// Idle, with every drain notification delivered.
    fn is_settled(&self) -> bool {
        self.is_idle() && !self.outstanding && self.notifying == 0
    }
}

struct Inner<P, R> {
    this: Weak<Self>,
    worker: Box<dyn Worker<P, R>>,
    concurrency: Concurrency,
    notifier: Option<Notifier>,
    runtime: Handle,
    state: Mutex<State<P, R>>,
    drained: Notify,
}

impl<P, R> Inner<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    fn lock(&self) -> MutexGuard<'_, State<P, R>> {
        // user code never runs under the lock, so a poisoned state is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a dispatch pass once the current call stack has unwound.
    fn schedule(&self) {
        let this = self.this.clone();
        self.runtime.spawn(async move {
            if let Some(inner) = this.upgrade() {
                inner.dispatch();
            }
        });
    }

    fn dispatch(&self) {
        {
            let mut state = self.lock();
            if state.pass == Pass::Dispatching {
                tracing::trace!("dispatch pass already running");
                return;
            }
            state.pass = Pass::Dispatching;
        }

        loop {
            let task = {
                let mut state = self.lock();
                match state.take_next(self.concurrency.get()) {
                    Some(task) => task,
                    None => {
                        state.pass = Pass::Idle;
                        break;
                    }
                }
            };

            let Task {
                id,
                payload,
                on_complete,
            } = task;
            let dispatcher: Weak<dyn Settle> = self.this.clone();
            let done = Completion {
                task: id,
                pending: Some(Pending {
                    on_complete,
                    dispatcher,
                }),
            };

            tracing::trace!(task = %id, "dispatching task");
            // a panicking worker drops `done` while unwinding, which frees the slot
            contain(id, "worker", || self.worker.run(payload, done));
        }
    }

    fn notify_drained(&self) {
        tracing::debug!("dispatcher drained");
        if let Some(notifier) = &self.notifier {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| notifier())) {
                tracing::error!(panic = panic_message(&*panic), "drain notifier panicked");
            }
        }

        self.lock().notifying -= 1;
        self.drained.notify_waiters();
    }
}

impl<P, R> Settle for Inner<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    fn settle(&self, task: TaskId, deliver: &mut dyn FnMut()) {
        self.lock().finish_one();

        contain(task, "completion callback", deliver);

        // checked after the callback so that work it submits postpones the drain
        if self.lock().take_drain() {
            self.notify_drained();
        }

        self.schedule();
    }
}

/// Runs user code, logging instead of propagating a panic.
fn contain(task: TaskId, what: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!(task = %task, panic = panic_message(&*panic), "{what} panicked");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

/// A bounded-concurrency dispatcher feeding payloads of type `P` to a shared worker that
/// produces results of type `R`.
pub struct Dispatcher<P, R> {
    inner: Arc<Inner<P, R>>,
}

impl<P, R> Clone for Dispatcher<P, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P, R> Dispatcher<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Creates a dispatcher that schedules its dispatch passes on the current Tokio runtime.
    pub fn new<W>(worker: W, config: DispatcherConfig) -> Result<Self, DispatchError>
    where
        W: Worker<P, R>,
    {
        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        Self::with_runtime(worker, config, runtime)
    }

    /// Creates a dispatcher that schedules its dispatch passes on `runtime`.
    ///
    /// Unlike [`new`](Dispatcher::new), this can be called outside of a runtime context.
    ///
    /// # Example
    ///
    /// ```rust
    /// use nodispatch::{Completion, Dispatcher, DispatcherConfig};
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let runtime = tokio::runtime::Runtime::new()?;
    ///
    /// let mut config = DispatcherConfig::default();
    /// config.with_limit(2);
    ///
    /// let dispatcher = Dispatcher::with_runtime(
    ///     |n: u32, done: Completion<u32>| done.complete(n + 1),
    ///     config,
    ///     runtime.handle().clone(),
    /// )?;
    ///
    /// assert_eq!(runtime.block_on(dispatcher.submit_async(1))?, 2);
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_runtime<W>(
        worker: W,
        config: DispatcherConfig,
        runtime: Handle,
    ) -> Result<Self, DispatchError>
    where
        W: Worker<P, R>,
    {
        let concurrency = Concurrency::new(config.limit)?;

        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            worker: Box::new(worker),
            concurrency,
            notifier: config.notifier,
            runtime,
            state: Mutex::new(State {
                backlog: VecDeque::new(),
                in_flight: 0,
                pass: Pass::default(),
                outstanding: false,
                notifying: 0,
                next_id: 0,
            }),
            drained: Notify::new(),
        });

        Ok(Self { inner })
    }

    /// The ceiling this dispatcher was created with. Fixed for its lifetime.
    pub fn concurrency(&self) -> usize {
        self.inner.concurrency.get()
    }

    /// Number of tasks waiting to be started.
    pub fn depth(&self) -> usize {
        self.inner.lock().backlog.len()
    }

    /// Number of tasks handed to the worker and not completed yet.
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Whether nothing is queued and nothing is in flight.
    pub fn is_idle(&self) -> bool {
        self.inner.lock().is_idle()
    }

    /// Queues `payload` for the worker. `on_complete` receives the worker's result.
    ///
    /// Never blocks and never runs the worker on the caller's stack: the task is started by
    /// a dispatch pass spawned on the runtime.
    pub fn submit<F>(&self, payload: P, on_complete: F) -> TaskId
    where
        F: FnOnce(R) + Send + 'static,
    {
        let id = {
            let mut state = self.inner.lock();
            // ids follow backlog order
            let id = TaskId(state.next_id);
            state.next_id += 1;
            state.backlog.push_back(Task {
                id,
                payload,
                on_complete: Box::new(on_complete),
            });
            state.outstanding = true;
            id
        };

        tracing::trace!(task = %id, "task submitted");
        self.inner.schedule();
        id
    }

    /// Queues `payload` and resolves to the worker's result.
    ///
    /// The task is queued immediately, not when the returned future is first polled.
    pub fn submit_async(
        &self,
        payload: P,
    ) -> impl Future<Output = Result<R, DispatchError>> + use<P, R> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit(payload, move |result| {
            // the caller may have stopped waiting
            let _ = tx.send(result);
        });

        async move { rx.await.map_err(|_| DispatchError::Abandoned) }
    }

    /// Resolves once nothing is queued or in flight and any pending drain notification has
    /// run. Resolves immediately on a dispatcher that never received work.
    pub async fn wait_idle(&self) {
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.inner.lock().is_settled() {
                return;
            }

            drained.await;
        }
    }
}

impl<P, R> fmt::Debug for Dispatcher<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Dispatcher")
            .field("concurrency", &self.inner.concurrency)
            .field("depth", &state.backlog.len())
            .field("in_flight", &state.in_flight)
            .field("pass", &state.pass)
            .finish()
    }
}
