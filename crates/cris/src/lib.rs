//! # Cris
//!
//! A command dispatch runtime: callers submit typed commands, the runtime
//! validates them, routes them to their handler, collects the events emitted
//! while handling, and returns a result, either on the caller's task or
//! through a resizable pool of background runners. Commands can also be
//! stored for execution at a later date.
//!
//! ## Core Concepts
//!
//! - [`Command`] = a request for work with exactly one handler
//! - [`Pipeline`] = validators, one [`Handler`], post-handlers
//! - [`ExecutingCommand`] = the handle a caller observes while it runs
//! - [`ExecutionHost`] = N runners draining one shared queue
//! - [`DelayedScheduler`] = min-heap of future commands plus one timer
//!
//! ## Architecture
//!
//! ```text
//! caller ──► Dispatcher::submit ──► ExecutingCommand (returned at once)
//!                 │
//!                 ▼ enqueue
//!          ExecutionHost queue ◄── DelayedScheduler (timer fires, due entries)
//!                 │
//!                 ▼ some idle runner
//!          Pipeline::run
//!             ├─► validators ──► set_validation_result ──► rejected? done
//!             ├─► handler ──► emit(Immediate) ──► immediate events (live)
//!             ├─► post-handlers
//!             └─► set_result / set_exception ──► completion
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Exactly-once completion** - every handle completes once, through
//!    rejection, success or fault; a second resolution is an error
//! 2. **Failures are data** - rejections and faults are terminal results,
//!    never errors escaping to the runner
//! 3. **No job loss on resize** - shrinking only enqueues shrink-signals;
//!    runners stop between jobs, never during one
//! 4. **Ordered hand-off** - delayed commands leave the scheduler in
//!    non-decreasing execution-date order
//!
//! ## Example
//!
//! ```ignore
//! use cris_core::{
//!     cris_command, async_trait, CorrelationToken, DelayedScheduler, Dispatcher,
//!     EventRouting, ExecutionContext, Handler, MessageCollector, Pipeline,
//! };
//!
//! struct Reserve { sku: String, quantity: u32 }
//! enum StockEvent { Reserved(u32), LowStock }
//! cris_command!(Reserve => u32, StockEvent);
//!
//! struct ReserveHandler;
//!
//! #[async_trait]
//! impl Handler<Reserve, Warehouse> for ReserveHandler {
//!     async fn handle(
//!         &self,
//!         cmd: &Reserve,
//!         ctx: &mut ExecutionContext<'_, Reserve, Warehouse>,
//!     ) -> anyhow::Result<u32> {
//!         let left = ctx.deps().reserve(&cmd.sku, cmd.quantity)?;
//!         ctx.emit(StockEvent::Reserved(cmd.quantity), EventRouting::Immediate)?;
//!         if left < 10 {
//!             ctx.emit(StockEvent::LowStock, EventRouting::OnSuccess)?;
//!         }
//!         Ok(left)
//!     }
//! }
//!
//! let dispatcher = Dispatcher::builder(warehouse)
//!     .runners(4)
//!     .pipeline(
//!         Pipeline::builder()
//!             .validate_with(|cmd: &Reserve, _: &Warehouse, msgs: &mut MessageCollector| {
//!                 if cmd.quantity == 0 {
//!                     msgs.error("quantity must be positive");
//!                 }
//!             })
//!             .handler(ReserveHandler)
//!             .build()?,
//!     )
//!     .build()?;
//!
//! let handle = dispatcher.submit(Reserve { sku: "A-1".into(), quantity: 2 }, CorrelationToken::new())?;
//! let executed = handle.completion().await?;
//!
//! dispatcher.host().set_parallel_runner_count(8)?;
//!
//! let scheduler = DelayedScheduler::builder(dispatcher.clone()).build()?;
//! scheduler.store(Reserve { sku: "A-1".into(), quantity: 1 }, tomorrow, None)?;
//! ```

// Core modules
mod collector;
mod command;
mod command_macro;
mod config;
mod dispatch;
mod error;
mod host;
mod once;
mod pipeline;
mod scheduler;
mod token;
mod validation;


// Re-export command types
pub use crate::command::{AnyExecuted, Command, DeferredInfo, ExecutedCommand, ExecutingCommand};

// Re-export event collection
pub use crate::collector::EventCollector;

// Re-export correlation and validation types
pub use crate::token::CorrelationToken;
pub use crate::validation::{MessageCollector, MessageLevel, ValidationMessage, ValidationResult};

// Re-export error types
pub use crate::error::{CommandFailure, CrisError, ExecutionFault, Result};

// Re-export pipeline types
pub use crate::pipeline::{
    EventRouting, ExecutionContext, Handler, ImmediateConsumer, Pipeline, PipelineBuilder,
    PostHandler, Validator,
};

// Re-export dispatcher types
pub use crate::dispatch::{Dispatcher, DispatcherBuilder, OnExecuted, SubmitOptions};

// Re-export host types
pub use crate::host::ExecutionHost;

// Re-export scheduler types
pub use crate::scheduler::{
    CommandStartingHook, ContextRestorer, DeferredExecutedHook, DelayedCommand, DelayedReceipt,
    DelayedScheduler, DelayedSchedulerBuilder,
};

// Re-export configuration
pub use crate::config::{
    CrisConfig, HostConfig, SchedulerConfig, DEFAULT_MAX_RUNNERS, DEFAULT_MAX_TIMER_DELAY_MS,
};

// Re-export commonly used external types
pub use async_trait::async_trait;
