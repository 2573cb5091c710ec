//! Session Event Delivery
//!
//! - Typed event bus keyed by `(session code, signal kind)`
//! - Bounded-wait utility racing a subscription against timeout/cancel

mod bus;
mod wait;

pub use bus::{EventBus, SignalKind, SignalPayload, Subscription};
pub use wait::{await_signal, await_signal_cancellable, WaitError};
