//! Commands and the per-submission tracking handle.
//!
//! An [`ExecutingCommand`] is created at submission time and shared between
//! the caller and the runner that executes it. The runner resolves it in
//! order:
//!
//! ```text
//! set_validation_result ──► (rejected) ──► completion resolved, events closed
//!         │
//!         └─► (ok) ──► append_immediate_event* ──► set_result | set_exception
//! ```
//!
//! Callers observe the same handle through [`ExecutingCommand::validation`],
//! [`ExecutingCommand::immediate_events`] and [`ExecutingCommand::completion`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collector::EventCollector;
use crate::error::{CommandFailure, CrisError, ExecutionFault, Result};
use crate::once::OnceSlot;
use crate::token::CorrelationToken;
use crate::validation::ValidationResult;

/// A request for work with exactly one logical handler.
///
/// Use [`cris_command!`](crate::cris_command) for the common case.
pub trait Command: Send + Sync + 'static {
    /// Value produced by a successful execution.
    type Output: Send + Sync + 'static;
    /// Events emitted by the handler while it runs.
    type Event: Send + Sync + 'static;

    /// Name used in logs and errors.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Scheduling metadata carried by a command that was stored for later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredInfo {
    pub sequence_id: u64,
    pub issuer: CorrelationToken,
    pub execution_date: DateTime<Utc>,
}

/// Terminal state of a command.
pub struct ExecutedCommand<C: Command> {
    command_name: &'static str,
    correlation: CorrelationToken,
    outcome: std::result::Result<C::Output, CommandFailure>,
    events: Vec<Arc<C::Event>>,
    deferred: Option<DeferredInfo>,
}

impl<C: Command> ExecutedCommand<C> {
    pub fn outcome(&self) -> std::result::Result<&C::Output, &CommandFailure> {
        self.outcome.as_ref()
    }

    pub fn output(&self) -> Option<&C::Output> {
        self.outcome.as_ref().ok()
    }

    pub fn failure(&self) -> Option<&CommandFailure> {
        self.outcome.as_ref().err()
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Events surfaced at completion.
    ///
    /// On success these are the `OnSuccess` and `OnCompletion` events in
    /// emission order; after an execution fault only the `OnCompletion`
    /// ones; after a rejection none.
    pub fn events(&self) -> &[Arc<C::Event>] {
        &self.events
    }

    pub fn correlation(&self) -> &CorrelationToken {
        &self.correlation
    }

    pub fn command_name(&self) -> &'static str {
        self.command_name
    }

    pub fn deferred(&self) -> Option<&DeferredInfo> {
        self.deferred.as_ref()
    }
}

impl<C: Command> fmt::Debug for ExecutedCommand<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutedCommand")
            .field("command", &self.command_name)
            .field("correlation", &self.correlation)
            .field("success", &self.is_success())
            .field("failure", &self.failure())
            .field("events", &self.events.len())
            .finish()
    }
}

/// Type-erased view of an [`ExecutedCommand`], for hooks that serve every
/// command type.
pub trait AnyExecuted: Send + Sync {
    fn command_name(&self) -> &'static str;
    fn correlation(&self) -> &CorrelationToken;
    fn failure(&self) -> Option<&CommandFailure>;
    fn deferred(&self) -> Option<&DeferredInfo>;
    fn as_any(&self) -> &dyn Any;

    fn is_success(&self) -> bool {
        self.failure().is_none()
    }
}

impl<C: Command> AnyExecuted for ExecutedCommand<C> {
    fn command_name(&self) -> &'static str {
        self.command_name
    }

    fn correlation(&self) -> &CorrelationToken {
        &self.correlation
    }

    fn failure(&self) -> Option<&CommandFailure> {
        ExecutedCommand::failure(self)
    }

    fn deferred(&self) -> Option<&DeferredInfo> {
        self.deferred.as_ref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Handle to a submitted command.
pub struct ExecutingCommand<C: Command> {
    command: Arc<C>,
    correlation: CorrelationToken,
    deferred: Option<DeferredInfo>,
    validation: OnceSlot<ValidationResult>,
    immediate: EventCollector<C::Event>,
    completion: OnceSlot<ExecutedCommand<C>>,
}

impl<C: Command> ExecutingCommand<C> {
    pub fn new(command: C, correlation: CorrelationToken, deferred: Option<DeferredInfo>) -> Self {
        Self {
            command: Arc::new(command),
            correlation,
            deferred,
            validation: OnceSlot::new("validation result"),
            immediate: EventCollector::new(),
            completion: OnceSlot::new("completion"),
        }
    }

    pub fn command(&self) -> &C {
        &self.command
    }

    pub fn correlation(&self) -> &CorrelationToken {
        &self.correlation
    }

    pub fn deferred(&self) -> Option<&DeferredInfo> {
        self.deferred.as_ref()
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Wait for the validation result.
    pub async fn validation(&self) -> Result<Arc<ValidationResult>> {
        self.validation.wait().await
    }

    /// Wait for the terminal result.
    pub async fn completion(&self) -> Result<Arc<ExecutedCommand<C>>> {
        self.completion.wait().await
    }

    pub fn try_validation(&self) -> Option<Arc<ValidationResult>> {
        self.validation.get()
    }

    pub fn try_completion(&self) -> Option<Arc<ExecutedCommand<C>>> {
        self.completion.get()
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_resolved()
    }

    /// Events emitted with immediate routing, live.
    pub fn immediate_events(&self) -> &EventCollector<C::Event> {
        &self.immediate
    }

    /// Called synchronously on the runner for each immediate event.
    pub fn subscribe_immediate<F>(&self, f: F)
    where
        F: Fn(&Arc<C::Event>) + Send + Sync + 'static,
    {
        self.immediate.subscribe(f);
    }

    // ------------------------------------------------------------------
    // Resolution (runner side)
    // ------------------------------------------------------------------

    /// Publish the validation result.
    ///
    /// A failed result also completes the command as rejected and closes the
    /// immediate events; nothing is executed afterwards.
    pub fn set_validation_result(&self, validation: ValidationResult) -> Result<()> {
        let validation = self.validation.set(validation)?;
        if validation.is_success() {
            return Ok(());
        }

        let executed = ExecutedCommand {
            command_name: self.command.name(),
            correlation: self.correlation.clone(),
            outcome: Err(CommandFailure::Rejected(validation.as_ref().clone())),
            events: Vec::new(),
            deferred: self.deferred.clone(),
        };
        // Closed first, so anyone woken by the completion sees it closed.
        self.immediate.close();
        self.completion.set(executed).map(|_| ())
    }

    pub fn append_immediate_event(&self, event: C::Event) -> Result<Arc<C::Event>> {
        self.ensure_validated("immediate event")?;
        self.immediate.append(event)
    }

    /// Complete successfully with the terminal events and output.
    pub fn set_result(
        &self,
        events: Vec<Arc<C::Event>>,
        output: C::Output,
    ) -> Result<Arc<ExecutedCommand<C>>> {
        self.complete(Ok(output), events)
    }

    /// Complete with an execution fault. `events` are the ones routed
    /// for completion regardless of outcome.
    pub fn set_exception(
        &self,
        fault: ExecutionFault,
        events: Vec<Arc<C::Event>>,
    ) -> Result<Arc<ExecutedCommand<C>>> {
        self.complete(Err(CommandFailure::Faulted(fault)), events)
    }

    fn complete(
        &self,
        outcome: std::result::Result<C::Output, CommandFailure>,
        events: Vec<Arc<C::Event>>,
    ) -> Result<Arc<ExecutedCommand<C>>> {
        self.ensure_validated("completion")?;
        self.immediate.close();
        self.completion.set(ExecutedCommand {
            command_name: self.command.name(),
            correlation: self.correlation.clone(),
            outcome,
            events,
            deferred: self.deferred.clone(),
        })
    }

    fn ensure_validated(&self, what: &'static str) -> Result<()> {
        match self.validation.get() {
            Some(v) if v.is_success() => Ok(()),
            // A rejection already resolved the completion.
            Some(_) => Err(CrisError::AlreadyResolved { what: "completion" }),
            None => Err(CrisError::OutOfOrder { what }),
        }
    }
}

impl<C: Command> fmt::Debug for ExecutingCommand<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutingCommand")
            .field("command", &self.command.name())
            .field("correlation", &self.correlation)
            .field("validated", &self.validation.is_resolved())
            .field("completed", &self.completion.is_resolved())
            .field("immediate_events", &self.immediate)
            .finish()
    }
}
