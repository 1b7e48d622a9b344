// State Module
// Versioned path-addressed state with change subscriptions

pub mod store;
pub mod value;

pub use store::{
    ChangeCallback, StateChange, StateSnapshot, StateStore, SubscribeOptions, Subscription,
    SubscriptionId,
};
pub use value::Value;
