//! The execution pipeline every submission goes through.
//!
//! ```text
//! validators (all) ──► ValidationResult ──► rejected? stop
//!                                              │
//!                                              ▼
//!                                  handler (exactly one)
//!                                              │
//!                                              ▼
//!                               post-handlers (registration order)
//!                                              │
//!                                              ▼
//!                          set_result / set_exception, events closed
//! ```
//!
//! How a command type finds its handler is decided when the pipeline is
//! built. A pipeline with zero or several handlers is rejected by
//! [`PipelineBuilder::build`], never at call time.
//!
//! Faults raised by handlers, post-handlers or validators (including panics)
//! are caught here, logged with the correlation token and turned into the
//! command's terminal result. Nothing escapes to the runner.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info_span, Instrument};

use crate::command::{Command, DeferredInfo, ExecutingCommand};
use crate::error::{panic_message, CrisError, ExecutionFault, Result};
use crate::token::CorrelationToken;
use crate::validation::{MessageCollector, ValidationResult};

/// Where an emitted event becomes visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventRouting {
    /// Appended to the immediate events as soon as it is emitted.
    Immediate,
    /// Surfaced in the terminal event list only if the command succeeds.
    OnSuccess,
    /// Surfaced in the terminal event list once execution finishes, whether
    /// it succeeded or faulted.
    OnCompletion,
}

/// Consumer of immediate events, called before `emit` returns.
pub type ImmediateConsumer<E> = Arc<dyn Fn(&CorrelationToken, &Arc<E>) + Send + Sync>;

/// Runs before execution and records user-facing messages.
#[async_trait]
pub trait Validator<C: Command, D: Send + Sync + 'static>: Send + Sync + 'static {
    async fn validate(&self, command: &C, deps: &D, messages: &mut MessageCollector);
}

/// The single handler of a command type.
#[async_trait]
pub trait Handler<C: Command, D: Send + Sync + 'static>: Send + Sync + 'static {
    async fn handle(
        &self,
        command: &C,
        ctx: &mut ExecutionContext<'_, C, D>,
    ) -> anyhow::Result<C::Output>;
}

/// Runs after the handler; sees the output but cannot replace it.
#[async_trait]
pub trait PostHandler<C: Command, D: Send + Sync + 'static>: Send + Sync + 'static {
    async fn after(
        &self,
        command: &C,
        output: &C::Output,
        ctx: &mut ExecutionContext<'_, C, D>,
    ) -> anyhow::Result<()>;
}

struct FnValidator<F>(F);

#[async_trait]
impl<C, D, F> Validator<C, D> for FnValidator<F>
where
    C: Command,
    D: Send + Sync + 'static,
    F: Fn(&C, &D, &mut MessageCollector) + Send + Sync + 'static,
{
    async fn validate(&self, command: &C, deps: &D, messages: &mut MessageCollector) {
        (self.0)(command, deps, messages)
    }
}

/// What a handler sees while it runs.
pub struct ExecutionContext<'a, C: Command, D> {
    deps: &'a D,
    handle: &'a ExecutingCommand<C>,
    consumer: Option<&'a ImmediateConsumer<C::Event>>,
    buffered: Vec<(Arc<C::Event>, EventRouting)>,
}

impl<'a, C: Command, D> ExecutionContext<'a, C, D> {
    fn new(
        deps: &'a D,
        handle: &'a ExecutingCommand<C>,
        consumer: Option<&'a ImmediateConsumer<C::Event>>,
    ) -> Self {
        Self {
            deps,
            handle,
            consumer,
            buffered: Vec::new(),
        }
    }

    pub fn deps(&self) -> &D {
        self.deps
    }

    pub fn correlation(&self) -> &CorrelationToken {
        self.handle.correlation()
    }

    pub fn deferred(&self) -> Option<&DeferredInfo> {
        self.handle.deferred()
    }

    /// Emit an event.
    ///
    /// Immediate events are appended and handed to the registered consumer
    /// before this returns; the others are buffered until completion.
    pub fn emit(&mut self, event: C::Event, routing: EventRouting) -> Result<()> {
        match routing {
            EventRouting::Immediate => {
                let event = self.handle.append_immediate_event(event)?;
                if let Some(consumer) = self.consumer {
                    consumer(self.handle.correlation(), &event);
                }
            }
            EventRouting::OnSuccess | EventRouting::OnCompletion => {
                self.buffered.push((Arc::new(event), routing));
            }
        }
        Ok(())
    }

    fn into_terminal_events(self, succeeded: bool) -> Vec<Arc<C::Event>> {
        self.buffered
            .into_iter()
            .filter(|(_, routing)| succeeded || *routing == EventRouting::OnCompletion)
            .map(|(event, _)| event)
            .collect()
    }
}

/// Validators, one handler and post-handlers for one command type.
pub struct Pipeline<C: Command, D: Send + Sync + 'static> {
    validators: Vec<Box<dyn Validator<C, D>>>,
    handler: Box<dyn Handler<C, D>>,
    post_handlers: Vec<Box<dyn PostHandler<C, D>>>,
    immediate_consumer: Option<ImmediateConsumer<C::Event>>,
}

impl<C: Command, D: Send + Sync + 'static> Pipeline<C, D> {
    pub fn builder() -> PipelineBuilder<C, D> {
        PipelineBuilder::new()
    }

    /// Run the pipeline against `handle`.
    ///
    /// Always leaves the handle completed, unless it had already been
    /// resolved by someone else (logged as an error).
    pub async fn run(&self, handle: &ExecutingCommand<C>, deps: &D) {
        let span = info_span!(
            "cris.command",
            command = handle.command().name(),
            correlation = %handle.correlation(),
        );
        self.run_steps(handle, deps).instrument(span).await
    }

    async fn run_steps(&self, handle: &ExecutingCommand<C>, deps: &D) {
        let validation = self.validate(handle.command(), deps).await;
        let passed = validation.is_success();
        if let Err(err) = handle.set_validation_result(validation) {
            error!(error = %err, "validation result could not be published");
            return;
        }
        if !passed {
            debug!(correlation = %handle.correlation(), "command rejected by validation");
            return;
        }

        let mut ctx = ExecutionContext::new(deps, handle, self.immediate_consumer.as_ref());
        let outcome = AssertUnwindSafe(self.execute(handle.command(), &mut ctx))
            .catch_unwind()
            .await;

        let resolved = match outcome {
            Ok(Ok(output)) => {
                debug!(correlation = %handle.correlation(), "command executed");
                handle.set_result(ctx.into_terminal_events(true), output)
            }
            Ok(Err(err)) => {
                let fault = ExecutionFault::new(format!("{err:#}"), handle.correlation().clone());
                error!(
                    correlation = %handle.correlation(),
                    error = %fault.message,
                    "command execution failed"
                );
                handle.set_exception(fault, ctx.into_terminal_events(false))
            }
            Err(panic) => {
                let fault = ExecutionFault::from_panic(panic, handle.correlation().clone());
                error!(
                    correlation = %handle.correlation(),
                    error = %fault.message,
                    "command handler panicked"
                );
                handle.set_exception(fault, ctx.into_terminal_events(false))
            }
        };

        if let Err(err) = resolved {
            error!(error = %err, "command result could not be published");
        }
    }

    async fn validate(&self, command: &C, deps: &D) -> ValidationResult {
        let mut messages = MessageCollector::new();
        let run = async {
            for validator in &self.validators {
                validator.validate(command, deps, &mut messages).await;
            }
        };
        let outcome = AssertUnwindSafe(run).catch_unwind().await;

        match outcome {
            Ok(()) => messages.finish(),
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(error = %message, "validator panicked");
                ValidationResult::error(format!("validation failed unexpectedly: {message}"))
            }
        }
    }

    async fn execute(
        &self,
        command: &C,
        ctx: &mut ExecutionContext<'_, C, D>,
    ) -> anyhow::Result<C::Output> {
        let output = self.handler.handle(command, ctx).await?;
        for post in &self.post_handlers {
            post.after(command, &output, ctx).await?;
        }
        Ok(output)
    }
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder<C: Command, D: Send + Sync + 'static> {
    validators: Vec<Box<dyn Validator<C, D>>>,
    handlers: Vec<Box<dyn Handler<C, D>>>,
    post_handlers: Vec<Box<dyn PostHandler<C, D>>>,
    immediate_consumer: Option<ImmediateConsumer<C::Event>>,
}

impl<C: Command, D: Send + Sync + 'static> Default for PipelineBuilder<C, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Command, D: Send + Sync + 'static> PipelineBuilder<C, D> {
    pub fn new() -> Self {
        Self {
            validators: Vec::new(),
            handlers: Vec::new(),
            post_handlers: Vec::new(),
            immediate_consumer: None,
        }
    }

    pub fn validator(mut self, validator: impl Validator<C, D>) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    /// Add a synchronous validator closure.
    pub fn validate_with<F>(self, f: F) -> Self
    where
        F: Fn(&C, &D, &mut MessageCollector) + Send + Sync + 'static,
    {
        self.validator(FnValidator(f))
    }

    pub fn handler(mut self, handler: impl Handler<C, D>) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn post_handler(mut self, post: impl PostHandler<C, D>) -> Self {
        self.post_handlers.push(Box::new(post));
        self
    }

    /// Register the consumer for immediate events.
    pub fn on_immediate<F>(mut self, f: F) -> Self
    where
        F: Fn(&CorrelationToken, &Arc<C::Event>) + Send + Sync + 'static,
    {
        self.immediate_consumer = Some(Arc::new(f));
        self
    }

    pub fn build(mut self) -> Result<Pipeline<C, D>> {
        let command = std::any::type_name::<C>();
        let count = self.handlers.len();
        let handler = match (self.handlers.pop(), count) {
            (Some(handler), 1) => handler,
            (None, _) => return Err(CrisError::MissingHandler { command }),
            (Some(_), count) => return Err(CrisError::AmbiguousHandler { command, count }),
        };

        Ok(Pipeline {
            validators: self.validators,
            handler,
            post_handlers: self.post_handlers,
            immediate_consumer: self.immediate_consumer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommandFailure;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct Transfer {
        amount: i64,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Ledger {
        Debited(i64),
        Credited(i64),
        Audited,
    }

    crate::cris_command!(Transfer => i64, Ledger);

    #[derive(Default)]
    struct Bank {
        log: Mutex<Vec<String>>,
    }

    struct TransferHandler;

    #[async_trait]
    impl Handler<Transfer, Bank> for TransferHandler {
        async fn handle(
            &self,
            command: &Transfer,
            ctx: &mut ExecutionContext<'_, Transfer, Bank>,
        ) -> anyhow::Result<i64> {
            ctx.deps().log.lock().push("handler".into());
            ctx.emit(Ledger::Debited(command.amount), EventRouting::Immediate)?;
            ctx.emit(Ledger::Credited(command.amount), EventRouting::OnSuccess)?;
            ctx.emit(Ledger::Audited, EventRouting::OnCompletion)?;
            if command.amount == 13 {
                anyhow::bail!("unlucky amount");
            }
            if command.amount == 666 {
                panic!("cursed amount");
            }
            Ok(command.amount * 2)
        }
    }

    struct Note(&'static str);

    #[async_trait]
    impl PostHandler<Transfer, Bank> for Note {
        async fn after(
            &self,
            _command: &Transfer,
            output: &i64,
            ctx: &mut ExecutionContext<'_, Transfer, Bank>,
        ) -> anyhow::Result<()> {
            ctx.deps().log.lock().push(format!("{}:{output}", self.0));
            Ok(())
        }
    }

    fn pipeline() -> Pipeline<Transfer, Bank> {
        Pipeline::builder()
            .validate_with(|cmd: &Transfer, _: &Bank, messages: &mut MessageCollector| {
                if cmd.amount <= 0 {
                    messages.error("amount must be positive");
                }
            })
            .handler(TransferHandler)
            .post_handler(Note("first"))
            .post_handler(Note("second"))
            .build()
            .unwrap()
    }

    async fn run(amount: i64) -> (Arc<ExecutingCommand<Transfer>>, Bank) {
        let bank = Bank::default();
        let handle = Arc::new(ExecutingCommand::new(
            Transfer { amount },
            CorrelationToken::new(),
            None,
        ));
        pipeline().run(&handle, &bank).await;
        (handle, bank)
    }

    #[tokio::test]
    async fn test_success_runs_handler_then_post_handlers_in_order() {
        let (handle, bank) = run(5).await;

        let executed = handle.completion().await.unwrap();
        assert_eq!(executed.output(), Some(&10));
        assert_eq!(*bank.log.lock(), ["handler", "first:10", "second:10"]);

        let terminal: Vec<_> = executed.events().iter().map(|e| (**e).clone()).collect();
        assert_eq!(terminal, [Ledger::Credited(5), Ledger::Audited]);

        let immediate: Vec<_> = handle
            .immediate_events()
            .snapshot()
            .iter()
            .map(|e| (**e).clone())
            .collect();
        assert_eq!(immediate, [Ledger::Debited(5)]);
        assert!(handle.immediate_events().is_closed());
    }

    #[tokio::test]
    async fn test_rejection_skips_handler() {
        let (handle, bank) = run(-1).await;

        let validation = handle.validation().await.unwrap();
        assert!(!validation.is_success());

        let executed = handle.completion().await.unwrap();
        assert!(matches!(executed.failure(), Some(CommandFailure::Rejected(_))));
        assert!(executed.events().is_empty());
        assert!(bank.log.lock().is_empty());
        assert!(handle.immediate_events().is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_becomes_fault_with_completion_events_only() {
        let (handle, bank) = run(13).await;

        let executed = handle.completion().await.unwrap();
        match executed.failure() {
            Some(CommandFailure::Faulted(fault)) => {
                assert!(fault.message.contains("unlucky amount"));
                assert_eq!(&fault.correlation, handle.correlation());
            }
            other => panic!("expected fault, got {other:?}"),
        }
        let terminal: Vec<_> = executed.events().iter().map(|e| (**e).clone()).collect();
        assert_eq!(terminal, [Ledger::Audited]);
        // Post-handlers never ran.
        assert_eq!(*bank.log.lock(), ["handler"]);
    }

    #[tokio::test]
    async fn test_handler_panic_is_caught_at_the_boundary() {
        let (handle, _bank) = run(666).await;

        let executed = handle.completion().await.unwrap();
        match executed.failure() {
            Some(CommandFailure::Faulted(fault)) => {
                assert_eq!(fault.message, "panic: cursed amount");
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_immediate_consumer_runs_before_emit_returns() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        struct Checker(Arc<Mutex<Vec<Ledger>>>);

        #[async_trait]
        impl Handler<Transfer, Bank> for Checker {
            async fn handle(
                &self,
                command: &Transfer,
                ctx: &mut ExecutionContext<'_, Transfer, Bank>,
            ) -> anyhow::Result<i64> {
                ctx.emit(Ledger::Debited(command.amount), EventRouting::Immediate)?;
                // Already consumed by the time emit returns.
                assert_eq!(self.0.lock().len(), 1);
                Ok(command.amount)
            }
        }

        let pipeline = Pipeline::builder()
            .handler(Checker(seen.clone()))
            .on_immediate(move |_token: &CorrelationToken, event: &Arc<Ledger>| {
                sink.lock().push((**event).clone())
            })
            .build()
            .unwrap();

        let handle = ExecutingCommand::new(Transfer { amount: 1 }, CorrelationToken::new(), None);
        pipeline.run(&handle, &Bank::default()).await;

        assert!(handle.completion().await.unwrap().is_success());
        assert_eq!(*seen.lock(), [Ledger::Debited(1)]);
    }

    #[tokio::test]
    async fn test_validator_panic_rejects_command() {
        let pipeline = Pipeline::builder()
            .validate_with(|_: &Transfer, _: &Bank, _: &mut MessageCollector| {
                panic!("validator bug")
            })
            .handler(TransferHandler)
            .build()
            .unwrap();

        let handle = ExecutingCommand::new(Transfer { amount: 1 }, CorrelationToken::new(), None);
        pipeline.run(&handle, &Bank::default()).await;

        let executed = handle.completion().await.unwrap();
        assert!(executed.failure().unwrap().is_rejected());
    }

    #[test]
    fn test_build_requires_exactly_one_handler() {
        let missing = PipelineBuilder::<Transfer, Bank>::new().build();
        assert!(matches!(missing, Err(CrisError::MissingHandler { .. })));

        let ambiguous = PipelineBuilder::<Transfer, Bank>::new()
            .handler(TransferHandler)
            .handler(TransferHandler)
            .build();
        assert!(matches!(
            ambiguous,
            Err(CrisError::AmbiguousHandler { count: 2, .. })
        ));
    }
}
