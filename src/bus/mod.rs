//! Event system for realtime execution state.
//!
//! Events flow from the runtime components through the [`EventBus`] to any
//! number of subscribers (UI bridges, log sinks). Delivery is buffered per
//! subscriber; a slow subscriber can never block the publisher, and losing
//! a subscriber never loses events for anyone else.

mod event_bus;
pub mod event_types;

pub use event_bus::{EventBus, Subscription, SubscriptionFilter, SwarmEvent};
