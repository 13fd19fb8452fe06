//! Testing utilities for the Cris command runtime.
//!
//! Recording hooks and sinks that capture what the runtime did, so tests can
//! assert on order and content without wiring channels by hand.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cris_core::{
    AnyExecuted, CommandStartingHook, ContextRestorer, CorrelationToken, DeferredExecutedHook,
    DeferredInfo, DelayedCommand, ImmediateConsumer,
};
use parking_lot::Mutex;
use tokio::sync::Notify;

// ============================================================================
// Tracing
// ============================================================================

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Polling
// ============================================================================

/// Poll `condition` every few milliseconds until it holds or `limit` passes.
///
/// Returns whether the condition was observed.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    };
    tokio::time::timeout(limit, poll).await.is_ok()
}

/// Await `future`, failing the test if it takes longer than `limit`.
pub async fn within<F: Future>(limit: Duration, future: F) -> F::Output {
    match tokio::time::timeout(limit, future).await {
        Ok(output) => output,
        Err(_) => panic!("operation did not finish within {limit:?}"),
    }
}

// ============================================================================
// Immediate events
// ============================================================================

/// Records every immediate event handed to the pipeline's consumer.
pub struct ImmediateSink<E> {
    seen: Arc<Mutex<Vec<(CorrelationToken, Arc<E>)>>>,
}

impl<E> Clone for ImmediateSink<E> {
    fn clone(&self) -> Self {
        Self {
            seen: self.seen.clone(),
        }
    }
}

impl<E> Default for ImmediateSink<E> {
    fn default() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E: Send + Sync + 'static> ImmediateSink<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A consumer suitable for `PipelineBuilder::on_immediate`.
    pub fn consumer(&self) -> impl Fn(&CorrelationToken, &Arc<E>) + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |token: &CorrelationToken, event: &Arc<E>| {
            seen.lock().push((token.clone(), event.clone()));
        }
    }

    /// The same consumer as a shareable [`ImmediateConsumer`].
    pub fn shared_consumer(&self) -> ImmediateConsumer<E> {
        Arc::new(self.consumer())
    }

    pub fn events(&self) -> Vec<Arc<E>> {
        self.seen.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn tokens(&self) -> Vec<CorrelationToken> {
        self.seen.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Scheduler hooks
// ============================================================================

/// Records every delayed command at hand-off, in hand-off order.
#[derive(Clone, Default)]
pub struct RecordingStartingHook {
    seen: Arc<Mutex<Vec<DelayedCommand>>>,
}

impl RecordingStartingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<DelayedCommand> {
        self.seen.lock().clone()
    }

    pub fn sequence_ids(&self) -> Vec<u64> {
        self.seen.lock().iter().map(|c| c.info.sequence_id).collect()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CommandStartingHook for RecordingStartingHook {
    fn on_command_executing(&self, command: &DelayedCommand) {
        self.seen.lock().push(command.clone());
    }
}

/// What a [`RecordingExecutedHook`] saw for one deferred command.
#[derive(Debug, Clone)]
pub struct ExecutedRecord {
    pub correlation: CorrelationToken,
    pub command_name: &'static str,
    pub success: bool,
    pub deferred: Option<DeferredInfo>,
    pub had_services: bool,
}

/// Records every deferred completion.
#[derive(Clone, Default)]
pub struct RecordingExecutedHook {
    seen: Arc<Mutex<Vec<ExecutedRecord>>>,
    notify: Arc<Notify>,
}

impl RecordingExecutedHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutedRecord> {
        self.seen.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` completions were recorded.
    pub async fn wait_for(&self, count: usize) -> Vec<ExecutedRecord> {
        loop {
            let notified = self.notify.notified();
            if self.len() >= count {
                return self.records();
            }
            notified.await;
        }
    }
}

#[async_trait]
impl<D: Send + Sync + 'static> DeferredExecutedHook<D> for RecordingExecutedHook {
    async fn on_executed(
        &self,
        correlation: CorrelationToken,
        executed: Arc<dyn AnyExecuted>,
        services: Option<Arc<D>>,
    ) {
        self.seen.lock().push(ExecutedRecord {
            correlation,
            command_name: executed.command_name(),
            success: executed.is_success(),
            deferred: executed.deferred().cloned(),
            had_services: services.is_some(),
        });
        self.notify.notify_waiters();
    }
}

/// A context restorer that always fails.
#[derive(Debug, Clone, Default)]
pub struct FailingRestorer;

#[async_trait]
impl<D: Send + Sync + 'static> ContextRestorer<D> for FailingRestorer {
    async fn restore(&self, info: &DeferredInfo) -> anyhow::Result<Arc<D>> {
        anyhow::bail!(
            "no execution context for deferred command {}",
            info.sequence_id
        )
    }
}
