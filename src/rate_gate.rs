use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Default)]
struct GateState {
    last_call: Option<Instant>,
    paused_until: Option<Instant>,
}

/// Throttle shared by every caller of one rate-limited provider.
///
/// Clones share state, so a single gate handed to several workers enforces
/// the spacing across all of them, and a `pause` from any worker holds back
/// every subsequent call.
#[derive(Debug, Clone)]
pub struct RateGate {
    state: Arc<Mutex<GateState>>,
    min_spacing: Duration,
    max_pause: Duration,
}

/// Longest provider cool-down honoured unless configured otherwise.
pub const DEFAULT_MAX_PAUSE: Duration = Duration::from_secs(15 * 60);

impl RateGate {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState::default())),
            min_spacing,
            max_pause: DEFAULT_MAX_PAUSE,
        }
    }

    /// Cap applied to every `pause`, whatever wait the provider asked for.
    pub fn with_max_pause(mut self, max_pause: Duration) -> Self {
        self.max_pause = max_pause;
        self
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    /// Wait until the next outbound call is allowed, then claim the slot.
    ///
    /// The lock is held while sleeping so concurrent callers queue up behind
    /// each other instead of all waking at the same instant.
    pub async fn wait(&self) {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        let mut ready_at = state
            .last_call
            .and_then(|last| last.checked_add(self.min_spacing))
            .map_or(now, |ready| ready.max(now));
        if let Some(paused_until) = state.paused_until {
            ready_at = ready_at.max(paused_until);
        }

        if ready_at > Instant::now() {
            log::debug!(
                "Rate gate holding for {:?}",
                ready_at.saturating_duration_since(Instant::now())
            );
            sleep_until(ready_at).await;
        }

        state.paused_until = None;
        state.last_call = Some(Instant::now());
    }

    /// Honour a provider cool-down: no call passes the gate for `wait`,
    /// capped at `max_pause`. Overlapping pauses keep the later deadline.
    pub async fn pause(&self, wait: Duration) {
        let wait = wait.min(self.max_pause);
        let now = Instant::now();
        let until = now
            .checked_add(wait)
            .or_else(|| now.checked_add(DEFAULT_MAX_PAUSE))
            .unwrap_or(now);
        let mut state = self.state.lock().await;
        state.paused_until = Some(match state.paused_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        log::warn!(
            "Provider requested cool-down, pausing all calls for {:?}",
            until.saturating_duration_since(now)
        );
    }

    pub async fn paused_for(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        state
            .paused_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }
}
