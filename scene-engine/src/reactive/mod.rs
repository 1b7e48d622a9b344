// Reactive Module
// Dependency-tracked, edge-triggered condition watching

pub mod condition;
pub mod watcher;

pub use condition::{ConditionCallback, ConditionStats, ConditionTrigger, RemovalReason, WatchOptions};
pub use watcher::{ReactiveConditionWatcher, WatchError, WatchHandle};
