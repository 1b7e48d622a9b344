// Simulation Transport
// Play / pause / step / speed state consulted between unit dispatches

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationStatus {
    Stopped,
    Running,
    Paused,
    /// Let exactly one dispatch through, then pause
    Stepping,
}

impl fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationStatus::Stopped => write!(f, "stopped"),
            SimulationStatus::Running => write!(f, "running"),
            SimulationStatus::Paused => write!(f, "paused"),
            SimulationStatus::Stepping => write!(f, "stepping"),
        }
    }
}

/// Snapshot of the transport state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationState {
    pub status: SimulationStatus,
    pub speed: f64,
    /// Units dispatched since the simulation was last started
    pub current_step: usize,
    pub total_steps: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Default for SimulationState {
    fn default() -> Self {
        Self {
            status: SimulationStatus::Stopped,
            speed: 1.0,
            current_step: 0,
            total_steps: 0,
            started_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Outcome of waiting at a dispatch checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// Dispatch may proceed after the given throttle delay
    Proceed(Duration),
    Stopped,
}

#[derive(Debug, Default)]
struct ClockInner {
    state: SimulationState,
    active_runs: usize,
    /// A run started the simulation and no transport control has been used since
    auto_played: bool,
}

/// Shared transport state
#[derive(Debug, Clone, Default)]
pub struct SimulationClock {
    inner: Arc<Mutex<ClockInner>>,
}

impl SimulationClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SimulationState {
        self.inner.lock().state.clone()
    }

    pub fn status(&self) -> SimulationStatus {
        self.inner.lock().state.status
    }

    pub fn play(&self) -> SimulationStatus {
        self.transition(SimulationStatus::Running)
    }

    pub fn pause(&self) -> SimulationStatus {
        self.transition(SimulationStatus::Paused)
    }

    pub fn step(&self) -> SimulationStatus {
        self.transition(SimulationStatus::Stepping)
    }

    pub fn stop(&self) -> SimulationStatus {
        self.transition(SimulationStatus::Stopped)
    }

    /// Caller validates the value
    pub fn set_speed(&self, speed: f64) {
        let mut inner = self.inner.lock();
        inner.state.speed = speed;
        inner.state.updated_at = Utc::now();
    }

    /// Explicit transport control. Returns the previous status.
    fn transition(&self, status: SimulationStatus) -> SimulationStatus {
        let mut inner = self.inner.lock();
        inner.auto_played = false;
        set_status(&mut inner.state, status)
    }

    /// Register a run of `units` dispatches. A stopped simulation starts playing.
    ///
    /// Returns true when the run started the simulation. Every call must be
    /// paired with [`SimulationClock::end_run`].
    pub fn begin_run(&self, units: usize) -> bool {
        let mut inner = self.inner.lock();
        let started = inner.state.status == SimulationStatus::Stopped;
        if started {
            set_status(&mut inner.state, SimulationStatus::Running);
            inner.auto_played = true;
        }
        inner.active_runs += 1;
        inner.state.total_steps = inner.state.current_step + units;
        started
    }

    /// Finish a run. When the last run ends and the simulation was only
    /// playing because a run started it, it returns to stopped.
    ///
    /// Returns the previous status if the simulation was stopped here.
    pub fn end_run(&self) -> Option<SimulationStatus> {
        let mut inner = self.inner.lock();
        inner.active_runs = inner.active_runs.saturating_sub(1);
        if inner.active_runs > 0
            || !inner.auto_played
            || inner.state.status != SimulationStatus::Running
        {
            return None;
        }
        inner.auto_played = false;
        Some(set_status(&mut inner.state, SimulationStatus::Stopped))
    }

    /// Decide whether the next dispatch may proceed, without waiting.
    /// `None` means paused.
    pub fn try_checkpoint(&self, base_delay: Duration) -> Option<Checkpoint> {
        let mut inner = self.inner.lock();
        let state = &mut inner.state;
        match state.status {
            SimulationStatus::Stopped => Some(Checkpoint::Stopped),
            SimulationStatus::Paused => None,
            SimulationStatus::Running | SimulationStatus::Stepping => {
                if state.status == SimulationStatus::Stepping {
                    state.status = SimulationStatus::Paused;
                }
                state.current_step += 1;
                state.updated_at = Utc::now();
                Some(Checkpoint::Proceed(throttle_delay(base_delay, state.speed)))
            }
        }
    }

    /// Wait until the next dispatch may proceed, polling while paused, then
    /// apply the speed throttle.
    pub async fn checkpoint(&self, poll_interval: Duration, base_delay: Duration) -> Checkpoint {
        loop {
            match self.try_checkpoint(base_delay) {
                Some(Checkpoint::Proceed(delay)) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    return Checkpoint::Proceed(delay);
                }
                Some(Checkpoint::Stopped) => return Checkpoint::Stopped,
                None => tokio::time::sleep(poll_interval).await,
            }
        }
    }
}

fn set_status(state: &mut SimulationState, status: SimulationStatus) -> SimulationStatus {
    let previous = state.status;
    if previous == SimulationStatus::Stopped && status != SimulationStatus::Stopped {
        state.current_step = 0;
        state.total_steps = 0;
        state.started_at = Some(Utc::now());
    }
    state.status = status;
    state.updated_at = Utc::now();
    previous
}

/// `base × (1 − speed) / speed` below normal speed, zero otherwise
pub fn throttle_delay(base: Duration, speed: f64) -> Duration {
    if speed >= 1.0 || speed <= 0.0 || !speed.is_finite() {
        return Duration::ZERO;
    }
    base.mul_f64((1.0 - speed) / speed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_delay() {
        let base = Duration::from_millis(100);
        assert_eq!(throttle_delay(base, 1.0), Duration::ZERO);
        assert_eq!(throttle_delay(base, 4.0), Duration::ZERO);
        assert_eq!(throttle_delay(base, 0.5), Duration::from_millis(100));
        assert_eq!(throttle_delay(base, 0.25), Duration::from_millis(300));
    }

    #[test]
    fn test_begin_run_auto_plays() {
        let clock = SimulationClock::new();
        assert!(clock.begin_run(3));
        let state = clock.state();
        assert_eq!(state.status, SimulationStatus::Running);
        assert_eq!(state.total_steps, 3);
        assert!(state.started_at.is_some());

        clock.pause();
        assert!(!clock.begin_run(2));
        assert_eq!(clock.status(), SimulationStatus::Paused);
    }

    #[test]
    fn test_end_run_stops_auto_played_simulation() {
        let clock = SimulationClock::new();
        assert!(clock.begin_run(2));
        assert!(!clock.begin_run(1));

        // Another run is still active
        assert_eq!(clock.end_run(), None);
        assert_eq!(clock.status(), SimulationStatus::Running);

        assert_eq!(clock.end_run(), Some(SimulationStatus::Running));
        assert_eq!(clock.status(), SimulationStatus::Stopped);
        assert_eq!(clock.end_run(), None);
    }

    #[test]
    fn test_end_run_keeps_explicit_play() {
        let clock = SimulationClock::new();
        clock.play();
        assert!(!clock.begin_run(1));
        assert_eq!(clock.end_run(), None);
        assert_eq!(clock.status(), SimulationStatus::Running);

        // A transport control during an auto-played run hands control to the caller
        clock.stop();
        assert!(clock.begin_run(1));
        clock.play();
        assert_eq!(clock.end_run(), None);
        assert_eq!(clock.status(), SimulationStatus::Running);
    }

    #[test]
    fn test_stepping_lets_one_dispatch_through() {
        let clock = SimulationClock::new();
        clock.begin_run(2);
        clock.pause();
        assert_eq!(clock.try_checkpoint(Duration::ZERO), None);

        clock.step();
        assert_eq!(
            clock.try_checkpoint(Duration::ZERO),
            Some(Checkpoint::Proceed(Duration::ZERO))
        );
        assert_eq!(clock.status(), SimulationStatus::Paused);
        assert_eq!(clock.try_checkpoint(Duration::ZERO), None);
        assert_eq!(clock.state().current_step, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_waits_while_paused() {
        let clock = SimulationClock::new();
        clock.begin_run(1);
        clock.pause();

        let resume = clock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            resume.play();
        });

        let started = tokio::time::Instant::now();
        let outcome = clock
            .checkpoint(Duration::from_millis(100), Duration::from_millis(100))
            .await;
        assert_eq!(outcome, Checkpoint::Proceed(Duration::ZERO));
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_checkpoint_after_stop() {
        let clock = SimulationClock::new();
        clock.begin_run(1);
        clock.stop();
        assert_eq!(
            clock.checkpoint(Duration::from_millis(10), Duration::ZERO).await,
            Checkpoint::Stopped
        );
    }
}
