//! Dynamic worker pool ("execution host").
//!
//! N runners drain one shared, unbounded queue. The queue carries two kinds of
//! messages:
//!
//! - a job, picked up by whichever runner is idle first;
//! - a shrink-signal, which stops the runner that dequeues it.
//!
//! Growing spawns new runners. Shrinking only enqueues shrink-signals, so a
//! runner never stops while it holds a job: it stops between jobs, after it
//! dequeued a signal. Nothing is ever cancelled from outside and no job is
//! ever dropped.
//!
//! ```text
//!   enqueue(job) ──┐
//!                  ▼
//!          ┌──────────────┐   acquire permit + pop
//!          │ SegQueue     │ ◄───────────── runner 1 ──► job.await
//!          │ Job | Shrink │ ◄───────────── runner 2 ──► exit on Shrink
//!          └──────────────┘ ◄───────────── runner N
//! ```
//!
//! Any runner may consume any shrink-signal; there is no preference for the
//! longest-idle runner.
//!
//! Dropping the last [`ExecutionHost`] handle closes the queue. Runners then
//! run whatever is still queued and stop.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info};

use crate::config::HostConfig;
use crate::error::{panic_message, CrisError, Result};

/// A unit of work run by one runner.
pub(crate) type Job = BoxFuture<'static, ()>;

enum HostMessage {
    Job(Job),
    Shrink,
}

struct HostInner {
    queue: SegQueue<HostMessage>,
    /// One permit per queued message.
    ready: Semaphore,
    /// Runner count the host is converging to.
    desired: Mutex<usize>,
    /// Live runner count; every change notifies subscribers.
    runners: watch::Sender<usize>,
    max_runners: usize,
    next_runner_id: AtomicUsize,
    runtime: Handle,
}

impl HostInner {
    fn push(&self, message: HostMessage) {
        self.queue.push(message);
        self.ready.add_permits(1);
    }

    async fn next_message(&self) -> HostMessage {
        loop {
            match self.ready.acquire().await {
                Ok(permit) => permit.forget(),
                // Closed: every handle is gone, drain what is left.
                Err(_) => return self.queue.pop().unwrap_or(HostMessage::Shrink),
            }
            if let Some(message) = self.queue.pop() {
                return message;
            }
        }
    }

    fn spawn_runners(self: &Arc<Self>, count: usize) {
        // Count first, so an exiting runner can never observe a lower total.
        self.runners.send_modify(|n| *n += count);
        for _ in 0..count {
            let runner_id = self.next_runner_id.fetch_add(1, Ordering::Relaxed);
            self.runtime.spawn(run_runner(self.clone(), runner_id));
        }
    }
}

async fn run_runner(inner: Arc<HostInner>, runner_id: usize) {
    debug!(runner_id, "runner started");
    loop {
        match inner.next_message().await {
            HostMessage::Job(job) => {
                if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
                    error!(
                        runner_id,
                        panic = %panic_message(&*panic),
                        "job panicked outside the pipeline boundary, runner continues"
                    );
                }
            }
            HostMessage::Shrink => break,
        }
    }
    inner.runners.send_modify(|n| *n = n.saturating_sub(1));
    debug!(runner_id, "runner stopped");
}

/// Shared by every clone of one [`ExecutionHost`]; runners never hold it.
struct HostOwner(Arc<HostInner>);

impl Drop for HostOwner {
    fn drop(&mut self) {
        self.0.ready.close();
        debug!(queued = self.0.queue.len(), "last host handle dropped, queue closed");
    }
}

/// Pool of parallel runners with a runtime-adjustable size.
#[derive(Clone)]
pub struct ExecutionHost {
    inner: Arc<HostInner>,
    _owner: Arc<HostOwner>,
}

impl ExecutionHost {
    /// Start a host on the current Tokio runtime.
    pub fn new(config: &HostConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| CrisError::NoRuntime)?;
        Self::with_runtime(config, runtime)
    }

    pub fn with_runtime(config: &HostConfig, runtime: Handle) -> Result<Self> {
        config.validate()?;
        let (runners, _rx) = watch::channel(0);
        let inner = Arc::new(HostInner {
            queue: SegQueue::new(),
            ready: Semaphore::new(0),
            desired: Mutex::new(config.initial_runners),
            runners,
            max_runners: config.max_runners,
            next_runner_id: AtomicUsize::new(1),
            runtime,
        });
        inner.spawn_runners(config.initial_runners);
        info!(
            runners = config.initial_runners,
            max_runners = config.max_runners,
            "execution host started"
        );
        Ok(Self {
            _owner: Arc::new(HostOwner(inner.clone())),
            inner,
        })
    }

    /// Queue a job. Never blocks.
    pub fn enqueue<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.push(HostMessage::Job(job.boxed()));
    }

    /// Live runner count. Eventually consistent with the last request.
    pub fn parallel_runner_count(&self) -> usize {
        *self.inner.runners.borrow()
    }

    /// Runner count the host is converging to.
    pub fn desired_runner_count(&self) -> usize {
        *self.inner.desired.lock()
    }

    pub fn max_runner_count(&self) -> usize {
        self.inner.max_runners
    }

    /// Messages waiting in the queue, jobs and shrink-signals alike.
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Resize the pool.
    ///
    /// Growth is immediate. Shrinking enqueues one shrink-signal per runner
    /// to remove; runners exit as they dequeue them, after any jobs queued
    /// ahead. Counts outside `1..=max` are rejected and change nothing.
    pub fn set_parallel_runner_count(&self, count: usize) -> Result<()> {
        if count == 0 || count > self.inner.max_runners {
            return Err(CrisError::InvalidRunnerCount {
                requested: count,
                max: self.inner.max_runners,
            });
        }

        let mut desired = self.inner.desired.lock();
        let current = *desired;
        if count > current {
            self.inner.spawn_runners(count - current);
        } else {
            for _ in count..current {
                self.inner.push(HostMessage::Shrink);
            }
        }
        *desired = count;

        if count != current {
            info!(from = current, to = count, "execution host resized");
        }
        Ok(())
    }

    /// Subscribe to runner count changes.
    pub fn subscribe_runner_count(&self) -> watch::Receiver<usize> {
        self.inner.runners.subscribe()
    }

    /// Wait until the live runner count equals `count`.
    pub async fn wait_for_runner_count(&self, count: usize) {
        let mut rx = self.inner.runners.subscribe();
        // The sender lives in `self.inner`, so the channel stays open.
        let _ = rx.wait_for(|n| *n == count).await;
    }

    /// Stop every runner once the jobs queued so far have been picked up.
    ///
    /// The host can be grown again afterwards.
    pub async fn shutdown(&self) {
        {
            let mut desired = self.inner.desired.lock();
            for _ in 0..*desired {
                self.inner.push(HostMessage::Shrink);
            }
            *desired = 0;
        }
        self.wait_for_runner_count(0).await;
        info!("execution host stopped");
    }
}

impl std::fmt::Debug for ExecutionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHost")
            .field("runners", &self.parallel_runner_count())
            .field("desired", &self.desired_runner_count())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::{oneshot, Notify};
    use tokio::time::timeout;

    fn host(runners: usize) -> ExecutionHost {
        ExecutionHost::new(&HostConfig::with_runners(runners)).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_jobs_run() {
        let host = host(2);
        let (tx, rx) = oneshot::channel();
        host.enqueue(async move {
            let _ = tx.send(42);
        });
        assert_eq!(timeout(Duration::from_secs(2), rx).await.unwrap().unwrap(), 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_out_of_range_counts_are_rejected() {
        let host = host(1);
        host.wait_for_runner_count(1).await;

        assert_eq!(
            host.set_parallel_runner_count(0),
            Err(CrisError::InvalidRunnerCount {
                requested: 0,
                max: 1000
            })
        );
        assert!(host.set_parallel_runner_count(1001).is_err());
        assert_eq!(host.desired_runner_count(), 1);
        assert_eq!(host.parallel_runner_count(), 1);

        host.set_parallel_runner_count(1000).unwrap();
        timeout(Duration::from_secs(5), host.wait_for_runner_count(1000))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_grow_and_shrink_notify_subscribers() {
        let host = host(1);
        let mut rx = host.subscribe_runner_count();

        host.set_parallel_runner_count(4).unwrap();
        timeout(Duration::from_secs(2), rx.wait_for(|n| *n == 4))
            .await
            .unwrap()
            .unwrap();

        host.set_parallel_runner_count(2).unwrap();
        timeout(Duration::from_secs(2), rx.wait_for(|n| *n == 2))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shrink_never_interrupts_a_claimed_job() {
        let host = host(2);
        let release = Arc::new(Notify::new());
        let started = Arc::new(AtomicU32::new(0));
        let finished = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let release = release.clone();
            let started = started.clone();
            let finished = finished.clone();
            host.enqueue(async move {
                started.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
        while started.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        host.set_parallel_runner_count(1).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Both runners are busy; nobody has dequeued the signal yet.
        assert_eq!(host.parallel_runner_count(), 2);

        release.notify_waiters();
        timeout(Duration::from_secs(2), host.wait_for_runner_count(1))
            .await
            .unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_job_does_not_kill_runner() {
        let host = host(1);
        host.enqueue(async { panic!("defect in dispatch machinery") });

        let (tx, rx) = oneshot::channel();
        host.enqueue(async move {
            let _ = tx.send(());
        });

        timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(host.parallel_runner_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_drains_queued_jobs_first() {
        let host = host(3);
        let done = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let done = done.clone();
            host.enqueue(async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        timeout(Duration::from_secs(5), host.shutdown()).await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(host.parallel_runner_count(), 0);

        // The host can come back.
        host.set_parallel_runner_count(1).unwrap();
        host.wait_for_runner_count(1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropping_last_handle_stops_runners_after_queued_jobs() {
        let host = host(2);
        let mut runners = host.subscribe_runner_count();
        let (tx, rx) = oneshot::channel();
        host.enqueue(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = tx.send(());
        });

        let clone = host.clone();
        drop(host);
        // A surviving clone keeps the runners alive.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(clone.parallel_runner_count(), 2);

        drop(clone);
        timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        timeout(Duration::from_secs(2), runners.wait_for(|n| *n == 0))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        assert_eq!(
            ExecutionHost::new(&HostConfig::default()).unwrap_err(),
            CrisError::NoRuntime
        );
    }
}
