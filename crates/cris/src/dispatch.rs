//! Command submission.
//!
//! The [`Dispatcher`] owns the shared dependencies, one [`Pipeline`] per
//! command type and the [`ExecutionHost`] that runs background submissions.
//!
//! - [`Dispatcher::submit`] returns an [`ExecutingCommand`] immediately and
//!   lets a runner execute the pipeline.
//! - [`Dispatcher::execute`] runs the pipeline on the caller's task and
//!   returns the terminal result.

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::command::{Command, DeferredInfo, ExecutedCommand, ExecutingCommand};
use crate::config::CrisConfig;
use crate::error::{CrisError, Result};
use crate::host::ExecutionHost;
use crate::pipeline::Pipeline;
use crate::token::CorrelationToken;

/// Callback run on the runner after a background command completes.
pub type OnExecuted<C> =
    Box<dyn FnOnce(Arc<ExecutedCommand<C>>) -> BoxFuture<'static, ()> + Send + 'static>;

/// Optional parts of a submission.
pub struct SubmitOptions<C: Command> {
    pub correlation: Option<CorrelationToken>,
    pub deferred: Option<DeferredInfo>,
    pub on_executed: Option<OnExecuted<C>>,
}

impl<C: Command> Default for SubmitOptions<C> {
    fn default() -> Self {
        Self {
            correlation: None,
            deferred: None,
            on_executed: None,
        }
    }
}

impl<C: Command> SubmitOptions<C> {
    pub fn correlation(mut self, token: CorrelationToken) -> Self {
        self.correlation = Some(token);
        self
    }

    pub fn deferred(mut self, info: DeferredInfo) -> Self {
        self.deferred = Some(info);
        self
    }

    pub fn on_executed<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Arc<ExecutedCommand<C>>) -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.on_executed = Some(Box::new(f));
        self
    }
}

struct DispatcherInner<D> {
    deps: Arc<D>,
    host: ExecutionHost,
    pipelines: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

/// Routes commands to their pipelines.
pub struct Dispatcher<D> {
    inner: Arc<DispatcherInner<D>>,
}

impl<D> Clone for Dispatcher<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Send + Sync + 'static> Dispatcher<D> {
    pub fn new(deps: D, host: ExecutionHost) -> Self {
        Self::from_shared(Arc::new(deps), host)
    }

    pub fn from_shared(deps: Arc<D>, host: ExecutionHost) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                deps,
                host,
                pipelines: DashMap::new(),
            }),
        }
    }

    pub fn builder(deps: D) -> DispatcherBuilder<D> {
        DispatcherBuilder::new(deps)
    }

    pub fn deps(&self) -> &Arc<D> {
        &self.inner.deps
    }

    pub fn host(&self) -> &ExecutionHost {
        &self.inner.host
    }

    /// Register the pipeline for `C`, replacing any previous one.
    pub fn register<C: Command>(&self, pipeline: Pipeline<C, D>) {
        let replaced = self
            .inner
            .pipelines
            .insert(TypeId::of::<C>(), Arc::new(pipeline))
            .is_some();
        if replaced {
            warn!(command = std::any::type_name::<C>(), "pipeline replaced");
        }
    }

    pub fn is_registered<C: Command>(&self) -> bool {
        self.inner.pipelines.contains_key(&TypeId::of::<C>())
    }

    fn pipeline<C: Command>(&self) -> Result<Arc<Pipeline<C, D>>> {
        let command = std::any::type_name::<C>();
        let entry = self
            .inner
            .pipelines
            .get(&TypeId::of::<C>())
            .map(|p| p.value().clone())
            .ok_or(CrisError::UnknownCommand { command })?;
        entry
            .downcast::<Pipeline<C, D>>()
            .map_err(|_| CrisError::UnknownCommand { command })
    }

    /// Submit for background execution with a given correlation token.
    pub fn submit<C: Command>(
        &self,
        command: C,
        correlation: CorrelationToken,
    ) -> Result<Arc<ExecutingCommand<C>>> {
        self.submit_with(command, SubmitOptions::default().correlation(correlation))
    }

    /// Submit for background execution. Returns without waiting for a runner.
    pub fn submit_with<C: Command>(
        &self,
        command: C,
        options: SubmitOptions<C>,
    ) -> Result<Arc<ExecutingCommand<C>>> {
        let pipeline = self.pipeline::<C>()?;
        let correlation = options.correlation.unwrap_or_default();
        let handle = Arc::new(ExecutingCommand::new(command, correlation, options.deferred));
        debug!(
            command = handle.command().name(),
            correlation = %handle.correlation(),
            "command submitted"
        );

        let deps = self.inner.deps.clone();
        let job_handle = handle.clone();
        let on_executed = options.on_executed;
        self.inner.host.enqueue(async move {
            pipeline.run(&job_handle, &deps).await;
            if let (Some(callback), Some(executed)) = (on_executed, job_handle.try_completion()) {
                callback(executed).await;
            }
        });

        Ok(handle)
    }

    /// Run the pipeline on the caller's task and wait for the result.
    pub async fn execute<C: Command>(
        &self,
        command: C,
        correlation: CorrelationToken,
    ) -> Result<Arc<ExecutedCommand<C>>> {
        let pipeline = self.pipeline::<C>()?;
        let handle = ExecutingCommand::new(command, correlation, None);
        pipeline.run(&handle, &self.inner.deps).await;
        handle.completion().await
    }
}

/// Builder that also starts the execution host.
pub struct DispatcherBuilder<D: Send + Sync + 'static> {
    deps: D,
    config: CrisConfig,
    registrations: Vec<Box<dyn FnOnce(&Dispatcher<D>) + Send>>,
}

impl<D: Send + Sync + 'static> DispatcherBuilder<D> {
    pub fn new(deps: D) -> Self {
        Self {
            deps,
            config: CrisConfig::default(),
            registrations: Vec::new(),
        }
    }

    pub fn config(mut self, config: CrisConfig) -> Self {
        self.config = config;
        self
    }

    pub fn runners(mut self, count: usize) -> Self {
        self.config.host.initial_runners = count;
        self
    }

    pub fn pipeline<C: Command>(mut self, pipeline: Pipeline<C, D>) -> Self {
        self.registrations
            .push(Box::new(move |dispatcher| dispatcher.register(pipeline)));
        self
    }

    /// Start the host on the current Tokio runtime.
    pub fn build(self) -> Result<Dispatcher<D>> {
        let host = ExecutionHost::new(&self.config.host)?;
        let dispatcher = Dispatcher::new(self.deps, host);
        for register in self.registrations {
            register(&dispatcher);
        }
        Ok(dispatcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{EventRouting, ExecutionContext, Handler};
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    struct Greet(&'static str);
    crate::cris_command!(Greet => String, String);

    struct Unregistered;
    crate::cris_command!(Unregistered => ());

    struct GreetHandler;

    #[async_trait]
    impl Handler<Greet, String> for GreetHandler {
        async fn handle(
            &self,
            command: &Greet,
            ctx: &mut ExecutionContext<'_, Greet, String>,
        ) -> anyhow::Result<String> {
            ctx.emit(format!("greeting {}", command.0), EventRouting::Immediate)?;
            Ok(format!("{}, {}", ctx.deps(), command.0))
        }
    }

    fn dispatcher() -> Dispatcher<String> {
        Dispatcher::builder("hello".to_string())
            .runners(2)
            .pipeline(Pipeline::builder().handler(GreetHandler).build().unwrap())
            .build()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_returns_handle_and_completes_in_background() {
        let dispatcher = dispatcher();
        let token = CorrelationToken::new();
        let handle = dispatcher.submit(Greet("ada"), token.clone()).unwrap();
        assert_eq!(handle.correlation(), &token);

        let executed = timeout(Duration::from_secs(2), handle.completion())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(executed.output().map(String::as_str), Some("hello, ada"));
        assert_eq!(handle.immediate_events().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_execute_runs_inline() {
        let dispatcher = dispatcher();
        let executed = dispatcher
            .execute(Greet("bob"), CorrelationToken::new())
            .await
            .unwrap();
        assert!(executed.is_success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_command_is_rejected_at_submit() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .submit(Unregistered, CorrelationToken::new())
            .unwrap_err();
        assert!(matches!(err, CrisError::UnknownCommand { .. }));
        assert!(!dispatcher.is_registered::<Unregistered>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_on_executed_receives_deferred_info() {
        let dispatcher = dispatcher();
        let info = DeferredInfo {
            sequence_id: 7,
            issuer: CorrelationToken::new(),
            execution_date: chrono::Utc::now(),
        };
        let (tx, rx) = oneshot::channel();

        dispatcher
            .submit_with(
                Greet("cy"),
                SubmitOptions::<Greet>::default()
                    .deferred(info.clone())
                    .on_executed(move |executed| {
                        async move {
                            let _ = tx.send(executed.deferred().cloned());
                        }
                        .boxed()
                    }),
            )
            .unwrap();

        let seen = timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(seen, Some(info));
    }
}
