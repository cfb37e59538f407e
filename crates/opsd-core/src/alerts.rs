//! Rule-based alert emission over bus events.
//!
//! The engine is pure state-machine code driven by an injected clock:
//! `observe` folds one event into rule state, `tick` fires time-based
//! rules. The daemon wires a bus subscription and an interval timer to
//! these two calls and forwards emitted alerts to the configured sink.
//!
//! Rules:
//!
//! - **worker-offline**: an offline status arms a per-worker deadline;
//!   a matching online status before expiry disarms it. Firing is
//!   idempotent against the dedup key.
//! - **dispatch-failures**: FAILED lifecycle events accumulate in a
//!   sliding window; reaching the threshold emits one alert and resets
//!   the window.
//! - **breaker-open**: emits immediately.
//!
//! Every emission is deduplicated per `(rule, subject)` within the
//! configured window, so flapping subjects produce one alert per window.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::events::{BreakerState, BusEvent, DispatchPhase, WorkerStatus};

/// Rule name for worker-offline alerts.
pub const RULE_WORKER_OFFLINE: &str = "worker-offline";

/// Rule name for dispatch-failure-threshold alerts.
pub const RULE_DISPATCH_FAILURES: &str = "dispatch-failures";

/// Rule name for breaker-open alerts.
pub const RULE_BREAKER_OPEN: &str = "breaker-open";

/// Alert engine tuning.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Grace period before an offline worker alerts.
    pub worker_offline_grace: Duration,
    /// Number of failures in the window that triggers an alert.
    pub dispatch_fail_threshold: u32,
    /// Sliding window for counting dispatch failures.
    pub dispatch_fail_window: Duration,
    /// Dedup window per `(rule, subject)`.
    pub dedup_window: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            worker_offline_grace: Duration::from_millis(120_000),
            dispatch_fail_threshold: 3,
            dispatch_fail_window: Duration::from_secs(600),
            dedup_window: Duration::from_secs(300),
        }
    }
}

/// One emitted alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Rule that fired.
    pub rule: &'static str,
    /// Subject the rule fired for (worker id, provider, or `dispatch`).
    pub subject: String,
    /// Human-readable body. Built from identifiers only; free-form event
    /// payloads never flow into it.
    pub message: String,
}

/// Sink alerts are delivered to. Tests install a recording sink; the
/// daemon installs the Telegram transport when configured.
pub trait AlertSink: Send + Sync {
    /// Delivers one alert body.
    fn send(&self, text: &str);
}

/// The alert rule engine.
#[derive(Debug)]
pub struct AlertEngine {
    config: AlertConfig,
    /// Armed offline deadlines per worker.
    offline_deadlines: HashMap<String, Instant>,
    /// Timestamps of recent dispatch failures.
    dispatch_failures: VecDeque<Instant>,
    /// Last emission per dedup key.
    last_emitted: HashMap<String, Instant>,
}

impl AlertEngine {
    /// Creates an engine with the given tuning.
    #[must_use]
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            offline_deadlines: HashMap::new(),
            dispatch_failures: VecDeque::new(),
            last_emitted: HashMap::new(),
        }
    }

    /// Folds one bus event into rule state, returning any alerts that
    /// fire immediately.
    pub fn observe(&mut self, event: &BusEvent, now: Instant) -> Vec<Alert> {
        match event {
            BusEvent::WorkerStatus {
                worker_id, status, ..
            } => {
                match status {
                    WorkerStatus::Offline => {
                        // Arm (or re-arm) the grace deadline; the alert
                        // fires from tick() if no online event lands first.
                        self.offline_deadlines
                            .entry(worker_id.clone())
                            .or_insert(now + self.config.worker_offline_grace);
                    }
                    WorkerStatus::Online => {
                        self.offline_deadlines.remove(worker_id);
                    }
                }
                Vec::new()
            }

            BusEvent::DispatchLifecycle { phase, .. } => {
                if *phase != DispatchPhase::Failed {
                    return Vec::new();
                }
                self.dispatch_failures.push_back(now);
                self.prune_failures(now);
                if self.dispatch_failures.len() >= self.config.dispatch_fail_threshold as usize {
                    let count = self.dispatch_failures.len();
                    self.dispatch_failures.clear();
                    self.emit(
                        RULE_DISPATCH_FAILURES,
                        "dispatch",
                        format!("{count} dispatch failures in the current window"),
                        now,
                    )
                    .into_iter()
                    .collect()
                } else {
                    Vec::new()
                }
            }

            BusEvent::BreakerState {
                provider, state, ..
            } => {
                if *state == BreakerState::Open {
                    self.emit(
                        RULE_BREAKER_OPEN,
                        provider,
                        format!("circuit breaker OPEN for provider {provider}"),
                        now,
                    )
                    .into_iter()
                    .collect()
                } else {
                    Vec::new()
                }
            }

            _ => Vec::new(),
        }
    }

    /// Fires time-based rules: expired offline deadlines alert and disarm.
    pub fn tick(&mut self, now: Instant) -> Vec<Alert> {
        let expired: Vec<String> = self
            .offline_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(worker, _)| worker.clone())
            .collect();

        let mut alerts = Vec::new();
        for worker in expired {
            self.offline_deadlines.remove(&worker);
            if let Some(alert) = self.emit(
                RULE_WORKER_OFFLINE,
                &worker,
                format!("worker {worker} offline past grace period"),
                now,
            ) {
                alerts.push(alert);
            }
        }
        alerts
    }

    fn prune_failures(&mut self, now: Instant) {
        let cutoff = now
            .checked_sub(self.config.dispatch_fail_window)
            .unwrap_or(now);
        while let Some(front) = self.dispatch_failures.front() {
            if *front < cutoff {
                self.dispatch_failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn emit(
        &mut self,
        rule: &'static str,
        subject: &str,
        message: String,
        now: Instant,
    ) -> Option<Alert> {
        let key = format!("{rule}:{subject}");
        if let Some(last) = self.last_emitted.get(&key) {
            if now.duration_since(*last) < self.config.dedup_window {
                return None;
            }
        }
        self.last_emitted.insert(key, now);
        Some(Alert {
            rule,
            subject: subject.to_string(),
            message,
        })
    }
}
