//! # Order Desk Example
//!
//! Places orders through a Cris dispatcher: validation, a handler that emits
//! progress events while it runs, a post-handler, a resize of the runner pool
//! and a reminder scheduled for later.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cris_core::{
    AnyExecuted, CommandFailure, CorrelationToken, CrisConfig, DeferredExecutedHook,
    DelayedCommand, DelayedScheduler, Dispatcher, EventRouting, ExecutionContext, Handler,
    MessageCollector, Pipeline, PostHandler, Validator,
};
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone)]
enum OrderEvent {
    /// Stock was set aside for a line
    Reserved { sku: String, quantity: u32 },

    /// The order was recorded
    Placed { order_id: Uuid, total_cents: u64 },

    /// Someone tried to place an order, whatever the outcome
    Attempted { customer: String },
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone)]
struct PlaceOrder {
    customer: String,
    lines: Vec<(String, u32)>,
}

cris_core::cris_command!(PlaceOrder => Uuid, OrderEvent);

#[derive(Debug, Clone)]
struct RemindCustomer {
    customer: String,
}

cris_core::cris_command!(RemindCustomer => ());

// ============================================================================
// Dependencies
// ============================================================================

struct Desk {
    prices: HashMap<String, u64>,
    stock: Mutex<HashMap<String, u32>>,
}

impl Desk {
    fn new() -> Self {
        let prices = HashMap::from([("kettle".to_string(), 2_999), ("mug".to_string(), 850)]);
        let stock = HashMap::from([("kettle".to_string(), 3), ("mug".to_string(), 40)]);
        Self {
            prices,
            stock: Mutex::new(stock),
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

struct KnownSkus;

#[async_trait]
impl Validator<PlaceOrder, Desk> for KnownSkus {
    async fn validate(&self, cmd: &PlaceOrder, desk: &Desk, msgs: &mut MessageCollector) {
        for (sku, _) in &cmd.lines {
            if !desk.prices.contains_key(sku) {
                msgs.error(format!("unknown sku {sku}"));
            }
        }
    }
}

fn non_empty(cmd: &PlaceOrder, _: &Desk, msgs: &mut MessageCollector) {
    if cmd.lines.is_empty() {
        msgs.error("an order needs at least one line");
    }
    msgs.nested(|msgs| {
        for (sku, quantity) in &cmd.lines {
            if *quantity == 0 {
                msgs.warn(format!("line {sku} has no quantity and is ignored"));
            }
        }
    });
}

// ============================================================================
// Handling
// ============================================================================

struct PlaceOrderHandler;

#[async_trait]
impl Handler<PlaceOrder, Desk> for PlaceOrderHandler {
    async fn handle(
        &self,
        cmd: &PlaceOrder,
        ctx: &mut ExecutionContext<'_, PlaceOrder, Desk>,
    ) -> Result<Uuid> {
        ctx.emit(
            OrderEvent::Attempted {
                customer: cmd.customer.clone(),
            },
            EventRouting::OnCompletion,
        )?;

        let mut total_cents = 0;
        for (sku, quantity) in cmd.lines.iter().filter(|(_, q)| *q > 0) {
            {
                let mut stock = ctx.deps().stock.lock().await;
                let left = stock.entry(sku.clone()).or_insert(0);
                if *left < *quantity {
                    anyhow::bail!("only {left} of {sku} left");
                }
                *left -= quantity;
            }
            let price = ctx
                .deps()
                .prices
                .get(sku)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no price for {sku}"))?;
            total_cents += price * u64::from(*quantity);
            ctx.emit(
                OrderEvent::Reserved {
                    sku: sku.clone(),
                    quantity: *quantity,
                },
                EventRouting::Immediate,
            )?;
        }

        let order_id = Uuid::new_v4();
        ctx.emit(
            OrderEvent::Placed {
                order_id,
                total_cents,
            },
            EventRouting::OnSuccess,
        )?;
        Ok(order_id)
    }
}

struct LogPlaced;

#[async_trait]
impl PostHandler<PlaceOrder, Desk> for LogPlaced {
    async fn after(
        &self,
        cmd: &PlaceOrder,
        order_id: &Uuid,
        _ctx: &mut ExecutionContext<'_, PlaceOrder, Desk>,
    ) -> Result<()> {
        info!(%order_id, customer = %cmd.customer, "order placed");
        Ok(())
    }
}

struct RemindHandler;

#[async_trait]
impl Handler<RemindCustomer, Desk> for RemindHandler {
    async fn handle(
        &self,
        cmd: &RemindCustomer,
        _ctx: &mut ExecutionContext<'_, RemindCustomer, Desk>,
    ) -> Result<()> {
        println!("  reminder sent to {}", cmd.customer);
        Ok(())
    }
}

// ============================================================================
// Scheduler hooks
// ============================================================================

struct ReportExecuted;

#[async_trait]
impl DeferredExecutedHook<Desk> for ReportExecuted {
    async fn on_executed(
        &self,
        correlation: CorrelationToken,
        executed: Arc<dyn AnyExecuted>,
        services: Option<Arc<Desk>>,
    ) {
        info!(
            %correlation,
            command = executed.command_name(),
            success = executed.is_success(),
            restored = services.is_some(),
            "deferred command finished"
        );
    }
}

// ============================================================================
// Main
// ============================================================================

fn order(customer: &str, lines: &[(&str, u32)]) -> PlaceOrder {
    PlaceOrder {
        customer: customer.to_string(),
        lines: lines.iter().map(|(s, q)| (s.to_string(), *q)).collect(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = CrisConfig::from_env()?;
    let dispatcher = Dispatcher::builder(Desk::new())
        .config(config.clone())
        .pipeline(
            Pipeline::builder()
                .validate_with(non_empty)
                .validator(KnownSkus)
                .handler(PlaceOrderHandler)
                .post_handler(LogPlaced)
                .on_immediate(|token: &CorrelationToken, event: &Arc<OrderEvent>| {
                    println!("  [{token}] live: {event:?}");
                })
                .build()?,
        )
        .pipeline(Pipeline::builder().handler(RemindHandler).build()?)
        .build()?;

    // Inline execution
    println!("Placing an order inline:");
    let executed = dispatcher
        .execute(order("ada", &[("kettle", 1), ("mug", 2)]), CorrelationToken::new())
        .await?;
    println!("  output: {:?}, events: {:?}", executed.output(), executed.events());

    // Rejections and faults are results, not errors
    println!("Submitting orders in the background:");
    dispatcher.host().set_parallel_runner_count(4)?;
    let handles = [
        dispatcher.submit(order("bob", &[("teapot", 1)]), CorrelationToken::new())?,
        dispatcher.submit(order("cy", &[("kettle", 5)]), CorrelationToken::new())?,
        dispatcher.submit(order("dee", &[("mug", 1), ("mug", 0)]), CorrelationToken::new())?,
    ];
    for handle in &handles {
        let executed = handle.completion().await?;
        match executed.failure() {
            None => println!("  {} placed {:?}", handle.command().customer, executed.output()),
            Some(CommandFailure::Rejected(validation)) => {
                println!("  {} rejected: {validation}", handle.command().customer)
            }
            Some(CommandFailure::Faulted(fault)) => {
                println!("  {} failed: {}", handle.command().customer, fault.message)
            }
        }
    }
    dispatcher.host().set_parallel_runner_count(1)?;

    // Deferred execution
    println!("Scheduling a reminder:");
    let scheduler = DelayedScheduler::builder(dispatcher.clone())
        .config(config.scheduler)
        .on_command_executing(|cmd: &DelayedCommand| {
            println!("  handing off #{} ({})", cmd.info.sequence_id, cmd.command_name);
        })
        .on_executed(ReportExecuted)
        .build()?;
    let receipt = scheduler.store(
        RemindCustomer {
            customer: "ada".into(),
        },
        chrono::Utc::now() + chrono::Duration::milliseconds(200),
        None,
    )?;
    receipt.started().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    dispatcher.host().shutdown().await;
    println!("Done!");

    Ok(())
}
