//! Heartbeat and reconnect state machine, shared shape for both endpoint
//! classes but implemented here on the gateway side (spec §4.1).

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Probe,
}

/// Tracks backoff state across reconnect attempts. Not thread-safe by
/// design — owned by the single task driving the connection loop.
pub struct ReconnectState {
    mode: Mode,
    attempt: u32,
    max_attempts: u32,
    probe_interval: Duration,
    initial_backoff: Duration,
    backoff_cap: Duration,
    fast_path_pending: bool,
}

impl ReconnectState {
    pub fn new(config: &agentim_config::GatewayClientConfig) -> Self {
        Self {
            mode: Mode::Normal,
            attempt: 0,
            max_attempts: config.max_reconnect_attempts,
            probe_interval: config.probe_interval,
            initial_backoff: config.normal_backoff_initial,
            backoff_cap: config.normal_backoff_cap,
            fast_path_pending: false,
        }
    }

    /// Call on a successful connection open: resets to normal mode and
    /// clears the attempt counter.
    pub fn on_open(&mut self) {
        self.mode = Mode::Normal;
        self.attempt = 0;
        self.fast_path_pending = false;
    }

    /// Call when the close was triggered by a pong timeout: arms a
    /// one-shot fast-path reconnect delay for the *next* attempt only.
    pub fn on_pong_timeout(&mut self) {
        self.fast_path_pending = true;
    }

    /// Compute the delay before the next reconnect attempt and advance
    /// internal state (attempt counter / mode transition).
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::rng())
    }

    fn next_delay_with_rng(&mut self, rng: &mut impl Rng) -> Duration {
        if self.fast_path_pending {
            self.fast_path_pending = false;
            let jitter = Duration::from_millis(rng.random_range(0..500));
            return Duration::from_secs(1) + jitter;
        }

        match self.mode {
            Mode::Normal => {
                let base_secs = (self.initial_backoff.as_secs_f64() * 1.5f64.powi(self.attempt as i32))
                    .min(self.backoff_cap.as_secs_f64());
                self.attempt += 1;
                if self.attempt >= self.max_attempts {
                    self.mode = Mode::Probe;
                }
                let jitter_secs = rng.random_range(0.0..base_secs.max(f64::MIN_POSITIVE));
                Duration::from_secs_f64(base_secs + jitter_secs)
            },
            Mode::Probe => {
                let base_secs = self.probe_interval.as_secs_f64();
                let jitter_secs = rng.random_range(0.0..base_secs.max(f64::MIN_POSITIVE));
                Duration::from_secs_f64(base_secs + jitter_secs)
            },
        }
    }

    pub fn is_probe_mode(&self) -> bool {
        self.mode == Mode::Probe
    }
}

/// Periodic ping / pong-timeout tracking, used identically on both sides of
/// the connection (the gateway client owns its own instance; the server
/// keeps one per endpoint).
pub struct HeartbeatState {
    interval: Duration,
    pong_timeout: Duration,
    last_pong_armed_at: Option<tokio::time::Instant>,
}

impl HeartbeatState {
    pub fn new(interval: Duration, pong_timeout: Duration) -> Self {
        Self { interval, pong_timeout, last_pong_armed_at: None }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Arm the pong-timeout timer after sending a ping.
    pub fn arm(&mut self) {
        self.last_pong_armed_at = Some(tokio::time::Instant::now());
    }

    /// Call on receiving a pong: resets the timer.
    pub fn on_pong(&mut self) {
        self.last_pong_armed_at = None;
    }

    /// True once the pong timeout has elapsed since the last ping with no
    /// intervening pong.
    pub fn is_timed_out(&self) -> bool {
        self.last_pong_armed_at
            .map(|armed_at| armed_at.elapsed() >= self.pong_timeout)
            .unwrap_or(false)
    }
}
