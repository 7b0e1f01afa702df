//! Typed payloads, handler tables and subscription fan-out.

pub mod bus;
pub mod event;
pub mod handler;

pub use bus::{Fanout, FanoutError, Subscription, SubscriptionId};
pub use event::EventPayload;
pub use handler::{HandlerError, HandlerRegistry};
