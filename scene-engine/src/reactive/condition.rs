// Watched Conditions
// Per-condition bookkeeping and the edge-trigger rule

use crate::expression::EvalError;
use crate::state::Value;

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Callback invoked when a condition becomes true
pub type ConditionCallback = Arc<dyn Fn(&ConditionTrigger) + Send + Sync>;

/// Registration options for a watched condition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Higher priorities are evaluated first when several conditions share a path
    pub priority: i32,
    /// Minimum spacing between two triggers; 0 disables throttling
    pub debounce_ms: u64,
    /// Unregister after this many triggers
    pub max_triggers: Option<u32>,
    /// Unregister this long after registration
    pub timeout_ms: Option<u64>,
}

impl WatchOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_debounce(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    pub fn with_max_triggers(mut self, max_triggers: u32) -> Self {
        self.max_triggers = Some(max_triggers);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn once() -> Self {
        Self::default().with_max_triggers(1)
    }
}

/// Passed to the callback of a condition that just became true
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionTrigger {
    pub id: String,
    pub expression: String,
    /// Value the expression evaluated to
    pub result: Value,
    /// Write that caused the evaluation; None for the initial check and polling
    pub changed_path: Option<String>,
    pub changed_value: Option<Value>,
    /// Triggers so far, including this one
    pub trigger_count: u32,
}

/// Observable counters of a live condition
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionStats {
    pub expression: String,
    pub dependencies: BTreeSet<String>,
    pub evaluation_count: u64,
    pub trigger_count: u32,
    pub last_value: Option<Value>,
    pub polling: bool,
    pub created_at: DateTime<Utc>,
}

/// Why a condition left the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Unwatched,
    Replaced,
    MaxTriggers,
    Timeout,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::Unwatched => write!(f, "unwatched"),
            RemovalReason::Replaced => write!(f, "replaced"),
            RemovalReason::MaxTriggers => write!(f, "max triggers reached"),
            RemovalReason::Timeout => write!(f, "timed out"),
        }
    }
}

/// Result of folding one evaluation into a condition
#[derive(Debug)]
pub(crate) enum Evaluation {
    /// Transition to true; fire the callback
    Triggered { trigger: ConditionTrigger, exhausted: bool },
    /// Transition to true inside the debounce window
    Debounced,
    /// No transition
    Quiet,
    Failed(EvalError),
}

pub(crate) struct Condition {
    pub id: String,
    pub expression: String,
    pub dependencies: BTreeSet<String>,
    pub callback: ConditionCallback,
    pub options: WatchOptions,
    pub polling: bool,
    pub created_at: DateTime<Utc>,
    /// Registration order, used to break priority ties
    pub sequence: u64,
    /// Distinguishes this registration from a later one under the same id
    pub generation: u64,
    pub last_value: Option<Value>,
    pub evaluation_count: u64,
    pub trigger_count: u32,
    pub last_trigger: Option<Instant>,
    /// Last store write seen, so one write reaching several subscriptions evaluates once
    pub last_write: Option<(String, u64)>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Condition {
    /// Fold an evaluation outcome into the condition.
    ///
    /// `last_value` is replaced on every evaluation. An error clears it, so the
    /// next true result counts as a rising edge.
    pub fn apply(
        &mut self,
        outcome: Result<Value, EvalError>,
        changed: Option<(&str, &Value)>,
        now: Instant,
    ) -> Evaluation {
        self.evaluation_count += 1;

        let value = match outcome {
            Ok(value) => value,
            Err(err) => {
                self.last_value = None;
                return Evaluation::Failed(err);
            }
        };

        let was_true = self.last_value.as_ref().is_some_and(Value::is_truthy);
        let is_true = value.is_truthy();
        self.last_value = Some(value.clone());

        if !is_true || was_true {
            return Evaluation::Quiet;
        }

        if let Some(last) = self.last_trigger {
            let window = Duration::from_millis(self.options.debounce_ms);
            if !window.is_zero() && now.duration_since(last) < window {
                return Evaluation::Debounced;
            }
        }

        self.trigger_count += 1;
        self.last_trigger = Some(now);

        Evaluation::Triggered {
            trigger: ConditionTrigger {
                id: self.id.clone(),
                expression: self.expression.clone(),
                result: value,
                changed_path: changed.map(|(path, _)| path.to_string()),
                changed_value: changed.map(|(_, value)| value.clone()),
                trigger_count: self.trigger_count,
            },
            exhausted: self
                .options
                .max_triggers
                .is_some_and(|max| self.trigger_count >= max),
        }
    }

    pub fn stats(&self) -> ConditionStats {
        ConditionStats {
            expression: self.expression.clone(),
            dependencies: self.dependencies.clone(),
            evaluation_count: self.evaluation_count,
            trigger_count: self.trigger_count,
            last_value: self.last_value.clone(),
            polling: self.polling,
            created_at: self.created_at,
        }
    }

    /// Ordering key: priority descending, then registration order
    pub fn order_key(&self) -> (std::cmp::Reverse<i32>, u64) {
        (std::cmp::Reverse(self.options.priority), self.sequence)
    }
}

impl Drop for Condition {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(options: WatchOptions) -> Condition {
        Condition {
            id: "c".to_string(),
            expression: "x".to_string(),
            dependencies: BTreeSet::from(["x".to_string()]),
            callback: Arc::new(|_: &ConditionTrigger| {}),
            options,
            polling: false,
            created_at: Utc::now(),
            sequence: 0,
            generation: 0,
            last_value: None,
            evaluation_count: 0,
            trigger_count: 0,
            last_trigger: None,
            last_write: None,
            tasks: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_edge_trigger() {
        let mut c = condition(WatchOptions::default());
        let now = Instant::now();

        assert!(matches!(c.apply(Ok(Value::Bool(false)), None, now), Evaluation::Quiet));
        assert!(matches!(
            c.apply(Ok(Value::Bool(true)), None, now),
            Evaluation::Triggered { .. }
        ));
        assert!(matches!(c.apply(Ok(Value::Bool(true)), None, now), Evaluation::Quiet));
        assert!(matches!(c.apply(Ok(Value::Bool(false)), None, now), Evaluation::Quiet));
        assert!(matches!(
            c.apply(Ok(Value::Bool(true)), None, now),
            Evaluation::Triggered { .. }
        ));
        assert_eq!(c.evaluation_count, 5);
        assert_eq!(c.trigger_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_clears_last_value() {
        let mut c = condition(WatchOptions::default());
        let now = Instant::now();

        c.apply(Ok(Value::Bool(true)), None, now);
        assert!(matches!(
            c.apply(Err(EvalError::UnknownPath("x".to_string())), None, now),
            Evaluation::Failed(_)
        ));
        assert_eq!(c.last_value, None);
        assert_eq!(c.evaluation_count, 2);
        // True after an error is a new rising edge
        let Evaluation::Triggered { trigger, .. } = c.apply(Ok(Value::Bool(true)), None, now)
        else {
            panic!("expected trigger");
        };
        assert_eq!(trigger.trigger_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_on_max_triggers() {
        let mut c = condition(WatchOptions::default().with_max_triggers(2));
        let now = Instant::now();

        let Evaluation::Triggered { exhausted, .. } = c.apply(Ok(Value::Bool(true)), None, now)
        else {
            panic!("expected trigger");
        };
        assert!(!exhausted);

        c.apply(Ok(Value::Bool(false)), None, now);
        let Evaluation::Triggered { exhausted, trigger } =
            c.apply(Ok(Value::Bool(true)), Some(("x", &Value::Bool(true))), now)
        else {
            panic!("expected trigger");
        };
        assert!(exhausted);
        assert_eq!(trigger.trigger_count, 2);
        assert_eq!(trigger.changed_path.as_deref(), Some("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_suppresses_but_tracks_value() {
        let mut c = condition(WatchOptions::default().with_debounce(100));
        let start = Instant::now();

        assert!(matches!(
            c.apply(Ok(Value::Bool(true)), None, start),
            Evaluation::Triggered { .. }
        ));
        c.apply(Ok(Value::Bool(false)), None, start);
        assert!(matches!(
            c.apply(Ok(Value::Bool(true)), None, start + Duration::from_millis(50)),
            Evaluation::Debounced
        ));
        assert_eq!(c.last_value, Some(Value::Bool(true)));
        assert_eq!(c.trigger_count, 1);

        c.apply(Ok(Value::Bool(false)), None, start);
        assert!(matches!(
            c.apply(Ok(Value::Bool(true)), None, start + Duration::from_millis(150)),
            Evaluation::Triggered { .. }
        ));
    }
}
