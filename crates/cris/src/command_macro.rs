//! Macros for reducing command boilerplate.

/// Implement [`Command`](crate::Command) in one line.
///
/// The event type defaults to `()` for commands that never emit events.
///
/// # Example
///
/// ```ignore
/// use cris_core::cris_command;
///
/// struct PlaceOrder {
///     sku: String,
///     quantity: u32,
/// }
///
/// enum OrderEvent {
///     Reserved { sku: String },
///     Confirmed { order_id: Uuid },
/// }
///
/// cris_command!(PlaceOrder => Uuid, OrderEvent);
///
/// struct Ping;
/// cris_command!(Ping => ());
/// ```
#[macro_export]
macro_rules! cris_command {
    ($command:ty => $output:ty, $event:ty) => {
        impl $crate::Command for $command {
            type Output = $output;
            type Event = $event;
        }
    };
    ($command:ty => $output:ty) => {
        $crate::cris_command!($command => $output, ());
    };
}
