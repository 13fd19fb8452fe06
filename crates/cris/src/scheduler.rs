//! Delayed command scheduler.
//!
//! Commands destined for a future point in time wait in a min-heap ordered by
//! execution date (ties broken by sequence id). A single timer task sleeps
//! until the earliest date; when it fires, every due entry is handed to the
//! dispatcher and the timer is re-armed for the next one.
//!
//! ```text
//! store() ──► lock ──► push ──► earlier than armed? ──► re-arm timer
//!
//! timer fires ──► lock ──► pop due* ──► dispatcher.submit_with(deferred)
//!                               │            └─► on_command_executing
//!                               │            └─► started resolved
//!                               └─► re-arm for next date (or disarm)
//! ```
//!
//! The heap lives in memory only. Past-due dates are not rejected here; they
//! are handed off on the next timer fire.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::command::{AnyExecuted, Command, DeferredInfo};
use crate::config::SchedulerConfig;
use crate::dispatch::{Dispatcher, SubmitOptions};
use crate::error::{panic_message, CrisError, Result};
use crate::once::{OnceSlot, OnceWaiter};
use crate::token::CorrelationToken;

/// A delayed command at the moment it is handed off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedCommand {
    pub info: DeferredInfo,
    pub command_name: &'static str,
}

/// Called for every due command, synchronously, while the scheduler lock is
/// held.
///
/// Implementations must return quickly and must not block or await. A panic
/// is caught and logged for that entry; the remaining due entries are still
/// processed.
pub trait CommandStartingHook: Send + Sync + 'static {
    fn on_command_executing(&self, command: &DelayedCommand);
}

impl<F> CommandStartingHook for F
where
    F: Fn(&DelayedCommand) + Send + Sync + 'static,
{
    fn on_command_executing(&self, command: &DelayedCommand) {
        self(command)
    }
}

/// Called on the runner after a deferred command has finished.
///
/// `services` is `None` exactly when the [`ContextRestorer`] failed.
#[async_trait]
pub trait DeferredExecutedHook<D>: Send + Sync + 'static {
    async fn on_executed(
        &self,
        correlation: CorrelationToken,
        executed: Arc<dyn AnyExecuted>,
        services: Option<Arc<D>>,
    );
}

/// Re-establishes the services a deferred command's completion runs against.
#[async_trait]
pub trait ContextRestorer<D>: Send + Sync + 'static {
    async fn restore(&self, info: &DeferredInfo) -> anyhow::Result<Arc<D>>;
}

struct NoopHook;

impl CommandStartingHook for NoopHook {
    fn on_command_executing(&self, _command: &DelayedCommand) {}
}

#[async_trait]
impl<D: Send + Sync + 'static> DeferredExecutedHook<D> for NoopHook {
    async fn on_executed(
        &self,
        _correlation: CorrelationToken,
        _executed: Arc<dyn AnyExecuted>,
        _services: Option<Arc<D>>,
    ) {
    }
}

/// Hands the dispatcher's own dependencies back.
struct SharedServices<D>(Arc<D>);

#[async_trait]
impl<D: Send + Sync + 'static> ContextRestorer<D> for SharedServices<D> {
    async fn restore(&self, _info: &DeferredInfo) -> anyhow::Result<Arc<D>> {
        Ok(self.0.clone())
    }
}

type DeferredDone = Box<dyn FnOnce(Arc<dyn AnyExecuted>) -> BoxFuture<'static, ()> + Send>;

/// A stored command with its type erased.
trait DeferredJob<D>: Send {
    fn hand_off(
        self: Box<Self>,
        dispatcher: &Dispatcher<D>,
        info: DeferredInfo,
        done: DeferredDone,
    ) -> Result<()>;
}

struct TypedJob<C>(C);

impl<C: Command, D: Send + Sync + 'static> DeferredJob<D> for TypedJob<C> {
    fn hand_off(
        self: Box<Self>,
        dispatcher: &Dispatcher<D>,
        info: DeferredInfo,
        done: DeferredDone,
    ) -> Result<()> {
        let options = SubmitOptions::<C>::default()
            .correlation(info.issuer.clone())
            .deferred(info)
            .on_executed(move |executed| {
                let executed: Arc<dyn AnyExecuted> = executed;
                done(executed)
            });
        dispatcher.submit_with(self.0, options).map(|_| ())
    }
}

struct Pending<D> {
    execution_date: DateTime<Utc>,
    sequence_id: u64,
    issuer: CorrelationToken,
    command_name: &'static str,
    job: Box<dyn DeferredJob<D>>,
    started: OnceSlot<()>,
}

impl<D> Pending<D> {
    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.execution_date, self.sequence_id)
    }
}

impl<D> PartialEq for Pending<D> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<D> Eq for Pending<D> {}

impl<D> PartialOrd for Pending<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<D> Ord for Pending<D> {
    // Reversed: BinaryHeap is a max-heap, we want the earliest date on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

struct SchedulerState<D> {
    heap: BinaryHeap<Pending<D>>,
    last_sequence_id: u64,
    /// Date the timer is currently armed for.
    armed: Option<DateTime<Utc>>,
}

struct SchedulerInner<D: Send + Sync + 'static> {
    dispatcher: Dispatcher<D>,
    state: Mutex<SchedulerState<D>>,
    timer: watch::Sender<Option<Instant>>,
    max_delay: Duration,
    on_starting: Arc<dyn CommandStartingHook>,
    on_executed: Arc<dyn DeferredExecutedHook<D>>,
    restorer: Arc<dyn ContextRestorer<D>>,
}

impl<D: Send + Sync + 'static> SchedulerInner<D> {
    fn delay_until(&self, at: DateTime<Utc>) -> Duration {
        (at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(self.max_delay)
    }

    /// Point the single timer at `at`, clamped to the longest delay it can
    /// represent. `None` disarms it.
    fn arm(&self, at: Option<DateTime<Utc>>) {
        let deadline = at.map(|at| Instant::now() + self.delay_until(at));
        self.timer.send_replace(deadline);
    }

    fn on_timer_fire(&self) {
        let mut state = self.state.lock();
        let now = Utc::now();
        while state.heap.peek().is_some_and(|p| p.execution_date <= now) {
            if let Some(pending) = state.heap.pop() {
                self.hand_off(pending);
            }
        }
        let next = state.heap.peek().map(|p| p.execution_date);
        state.armed = next;
        self.arm(next);
    }

    fn hand_off(&self, pending: Pending<D>) {
        let Pending {
            execution_date,
            sequence_id,
            issuer,
            command_name,
            job,
            started,
        } = pending;
        let info = DeferredInfo {
            sequence_id,
            issuer,
            execution_date,
        };

        let done = self.completion_callback(info.clone());
        if let Err(err) = job.hand_off(&self.dispatcher, info.clone(), done) {
            error!(
                sequence_id,
                command = command_name,
                error = %err,
                "deferred command could not be handed off"
            );
            return;
        }
        debug!(sequence_id, command = command_name, "deferred command handed off");

        let command = DelayedCommand { info, command_name };
        let hook = AssertUnwindSafe(|| self.on_starting.on_command_executing(&command));
        if let Err(panic) = std::panic::catch_unwind(hook) {
            error!(
                sequence_id,
                command = command_name,
                panic = %panic_message(&*panic),
                "command starting hook panicked"
            );
        }
        // Receipts resolve after the hook has seen the command.
        let _ = started.set(());
    }

    fn completion_callback(&self, info: DeferredInfo) -> DeferredDone {
        let hook = self.on_executed.clone();
        let restorer = self.restorer.clone();
        Box::new(move |executed| {
            async move {
                let services = match restorer.restore(&info).await {
                    Ok(services) => Some(services),
                    Err(err) => {
                        warn!(
                            sequence_id = info.sequence_id,
                            error = %err,
                            "execution context could not be restored"
                        );
                        None
                    }
                };
                hook.on_executed(info.issuer.clone(), executed, services).await;
            }
            .boxed()
        })
    }
}

async fn run_timer<D: Send + Sync + 'static>(
    inner: Weak<SchedulerInner<D>>,
    mut rx: watch::Receiver<Option<Instant>>,
) {
    loop {
        let deadline = *rx.borrow_and_update();
        match deadline {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {
                        let Some(scheduler) = inner.upgrade() else { break };
                        scheduler.on_timer_fire();
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            None => {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("scheduler timer stopped");
}

/// Returned by [`DelayedScheduler::store`].
pub struct DelayedReceipt {
    pub sequence_id: u64,
    pub issuer: CorrelationToken,
    pub execution_date: DateTime<Utc>,
    started: OnceWaiter<()>,
}

impl DelayedReceipt {
    /// Resolves once the command has been handed to the execution host.
    pub async fn started(self) -> Result<()> {
        self.started.wait().await.map(|_| ())
    }
}

impl std::fmt::Debug for DelayedReceipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedReceipt")
            .field("sequence_id", &self.sequence_id)
            .field("issuer", &self.issuer)
            .field("execution_date", &self.execution_date)
            .finish()
    }
}

/// In-memory scheduler backed by one reusable timer.
pub struct DelayedScheduler<D: Send + Sync + 'static> {
    inner: Arc<SchedulerInner<D>>,
}

impl<D: Send + Sync + 'static> Clone for DelayedScheduler<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Send + Sync + 'static> DelayedScheduler<D> {
    pub fn builder(dispatcher: Dispatcher<D>) -> DelayedSchedulerBuilder<D> {
        DelayedSchedulerBuilder::new(dispatcher)
    }

    /// Store `command` for execution at or after `execution_date`.
    ///
    /// Never blocks on execution. The returned sequence ids are strictly
    /// increasing, starting at 1.
    pub fn store<C: Command>(
        &self,
        command: C,
        execution_date: DateTime<Utc>,
        correlation: Option<CorrelationToken>,
    ) -> Result<DelayedReceipt> {
        if !self.inner.dispatcher.is_registered::<C>() {
            return Err(CrisError::UnknownCommand {
                command: std::any::type_name::<C>(),
            });
        }

        let issuer = correlation.unwrap_or_default();
        let command_name = command.name();
        let started = OnceSlot::new("deferred start");
        let waiter = started.waiter();

        let sequence_id = {
            let mut state = self.inner.state.lock();
            state.last_sequence_id += 1;
            let sequence_id = state.last_sequence_id;
            state.heap.push(Pending {
                execution_date,
                sequence_id,
                issuer: issuer.clone(),
                command_name,
                job: Box::new(TypedJob(command)),
                started,
            });
            if state.armed.map_or(true, |armed| execution_date < armed) {
                state.armed = Some(execution_date);
                self.inner.arm(Some(execution_date));
            }
            sequence_id
        };

        debug!(
            sequence_id,
            command = command_name,
            correlation = %issuer,
            execution_date = %execution_date,
            "deferred command stored"
        );
        Ok(DelayedReceipt {
            sequence_id,
            issuer,
            execution_date,
            started: waiter,
        })
    }

    /// Commands still waiting for their date.
    pub fn len(&self) -> usize {
        self.inner.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Execution date of the earliest waiting command.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().heap.peek().map(|p| p.execution_date)
    }

    pub fn dispatcher(&self) -> &Dispatcher<D> {
        &self.inner.dispatcher
    }
}

/// Builder for [`DelayedScheduler`].
pub struct DelayedSchedulerBuilder<D: Send + Sync + 'static> {
    dispatcher: Dispatcher<D>,
    config: SchedulerConfig,
    on_starting: Option<Arc<dyn CommandStartingHook>>,
    on_executed: Option<Arc<dyn DeferredExecutedHook<D>>>,
    restorer: Option<Arc<dyn ContextRestorer<D>>>,
}

impl<D: Send + Sync + 'static> DelayedSchedulerBuilder<D> {
    pub fn new(dispatcher: Dispatcher<D>) -> Self {
        Self {
            dispatcher,
            config: SchedulerConfig::default(),
            on_starting: None,
            on_executed: None,
            restorer: None,
        }
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn on_command_executing(mut self, hook: impl CommandStartingHook) -> Self {
        self.on_starting = Some(Arc::new(hook));
        self
    }

    pub fn on_executed(mut self, hook: impl DeferredExecutedHook<D>) -> Self {
        self.on_executed = Some(Arc::new(hook));
        self
    }

    pub fn context_restorer(mut self, restorer: impl ContextRestorer<D>) -> Self {
        self.restorer = Some(Arc::new(restorer));
        self
    }

    /// Build the scheduler and start its timer on the current Tokio runtime.
    pub fn build(self) -> Result<DelayedScheduler<D>> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| CrisError::NoRuntime)?;

        let restorer = self
            .restorer
            .unwrap_or_else(|| Arc::new(SharedServices(self.dispatcher.deps().clone())));
        let (timer, rx) = watch::channel(None);
        let inner = Arc::new(SchedulerInner {
            dispatcher: self.dispatcher,
            state: Mutex::new(SchedulerState {
                heap: BinaryHeap::new(),
                last_sequence_id: 0,
                armed: None,
            }),
            timer,
            max_delay: self.config.max_timer_delay(),
            on_starting: self.on_starting.unwrap_or_else(|| Arc::new(NoopHook)),
            on_executed: self.on_executed.unwrap_or_else(|| Arc::new(NoopHook)),
            restorer,
        });

        runtime.spawn(run_timer(Arc::downgrade(&inner), rx));
        Ok(DelayedScheduler { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ExecutionContext, Handler, Pipeline};
    use std::time::Duration as StdDuration;
    use tokio::time::timeout;

    struct Remind(u32);
    crate::cris_command!(Remind => u32);

    struct Echo;

    #[async_trait]
    impl Handler<Remind, ()> for Echo {
        async fn handle(
            &self,
            command: &Remind,
            _ctx: &mut ExecutionContext<'_, Remind, ()>,
        ) -> anyhow::Result<u32> {
            Ok(command.0)
        }
    }

    fn scheduler(hook: impl CommandStartingHook) -> DelayedScheduler<()> {
        let dispatcher = Dispatcher::builder(())
            .runners(2)
            .pipeline(Pipeline::builder().handler(Echo).build().unwrap())
            .build()
            .unwrap();
        DelayedScheduler::builder(dispatcher)
            .on_command_executing(hook)
            .build()
            .unwrap()
    }

    fn in_ms(ms: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(ms)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handoff_follows_execution_date() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let scheduler = scheduler(move |command: &DelayedCommand| {
            seen.lock().push(command.info.sequence_id)
        });

        let late = scheduler.store(Remind(50), in_ms(50), None).unwrap();
        let late_id = late.sequence_id;
        let early = scheduler.store(Remind(10), in_ms(10), None).unwrap();
        let middle = scheduler.store(Remind(30), in_ms(30), None).unwrap();
        assert_eq!(scheduler.len(), 3);

        timeout(StdDuration::from_secs(2), late.started())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            *order.lock(),
            [early.sequence_id, middle.sequence_id, late_id]
        );
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.next_due(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_past_due_command_fires_on_next_tick() {
        let scheduler = scheduler(|_: &DelayedCommand| {});
        let receipt = scheduler.store(Remind(1), in_ms(-1_000), None).unwrap();

        timeout(StdDuration::from_millis(50), receipt.started())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_hook_does_not_stop_the_batch() {
        let scheduler = scheduler(|command: &DelayedCommand| {
            if command.info.sequence_id == 1 {
                panic!("hook bug");
            }
        });
        let past = in_ms(-10);
        let first = scheduler.store(Remind(1), past, None).unwrap();
        let second = scheduler.store(Remind(2), past, None).unwrap();

        timeout(StdDuration::from_secs(1), first.started())
            .await
            .unwrap()
            .unwrap();
        timeout(StdDuration::from_secs(1), second.started())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_store_rejects_unregistered_command() {
        struct Other;
        crate::cris_command!(Other => ());

        let scheduler = scheduler(|_: &DelayedCommand| {});
        let err = scheduler.store(Other, in_ms(10), None).unwrap_err();
        assert!(matches!(err, CrisError::UnknownCommand { .. }));
        assert!(scheduler.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_long_delays_are_clamped_and_re_evaluated() {
        let dispatcher = Dispatcher::builder(())
            .pipeline(Pipeline::builder().handler(Echo).build().unwrap())
            .build()
            .unwrap();
        let scheduler = DelayedScheduler::builder(dispatcher)
            .config(SchedulerConfig {
                max_timer_delay_ms: 10,
            })
            .build()
            .unwrap();

        let receipt = scheduler.store(Remind(1), in_ms(80), None).unwrap();
        tokio::time::sleep(StdDuration::from_millis(40)).await;
        // Timer has fired early at least once but the entry is not due yet.
        assert_eq!(scheduler.len(), 1);

        timeout(StdDuration::from_secs(1), receipt.started())
            .await
            .unwrap()
            .unwrap();
    }
}
