//! Wires the event bus into the alert rule engine.
//!
//! One background task owns the [`AlertEngine`]: it folds every bus
//! event into rule state and ticks time-based rules once a second.
//! Emitted alerts go to the injected sink. The Telegram transport is an
//! external collaborator implementing [`AlertSink`]; when it is not
//! configured the daemon installs [`TracingSink`] so alerts still land
//! in the logs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opsd_core::alerts::{AlertConfig, AlertEngine, AlertSink};
use opsd_core::events::EventBus;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// Tick interval for time-based alert rules.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Sink that writes alerts to the tracing log.
#[derive(Debug, Default)]
pub struct TracingSink;

impl AlertSink for TracingSink {
    fn send(&self, text: &str) {
        warn!(alert = text, "alert emitted");
    }
}

/// Spawns the alert driver task.
///
/// The task runs until the bus is dropped (all senders gone).
pub fn spawn(
    bus: &EventBus,
    config: AlertConfig,
    sink: Arc<dyn AlertSink>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        let mut engine = AlertEngine::new(config);
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => {
                        for alert in engine.observe(&event, Instant::now()) {
                            sink.send(&alert.message);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // A slow consumer dropped events; rule state may
                        // undercount but must not wedge the task.
                        warn!(missed, "alert driver lagged behind the bus");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = interval.tick() => {
                    for alert in engine.tick(Instant::now()) {
                        sink.send(&alert.message);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use opsd_core::events::{BreakerState, BusEvent};

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<String>>,
    }

    impl AlertSink for RecordingSink {
        fn send(&self, text: &str) {
            self.sent.lock().unwrap().push(text.to_string());
        }
    }

    #[tokio::test]
    async fn test_breaker_open_reaches_sink() {
        let bus = EventBus::default();
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn(&bus, AlertConfig::default(), Arc::clone(&sink) as Arc<dyn AlertSink>);

        bus.publish(BusEvent::BreakerState {
            provider: "github".to_string(),
            state: BreakerState::Open,
            detail: serde_json::json!({}),
        });

        // Give the driver a moment to drain the channel.
        for _ in 0..50 {
            if !sink.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("github"));
        handle.abort();
    }
}
