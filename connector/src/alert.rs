//! Out-of-band status reporting (spec §4.8), independent of any particular
//! in-flight call — used for things like "engine restarted" or "heartbeat
//! missed" that no caller is blocked waiting for.

use std::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Alert {
    Good(String),
    Bad(String),
}

/// Receives [`Alert`]s. Implementations must be safe to call from the
/// runner thread, the dispatch thread, or a caller thread — whichever one
/// first notices the condition being reported.
pub trait AlertSink: Send + Sync {
    fn alert(&self, alert: Alert);
}

/// Logs alerts through `tracing`, serialized behind a mutex so interleaved
/// alerts from different threads don't interleave their log lines. A
/// consumer can disable the user-visible surface (e.g. during an expected
/// supervised restart) without tearing down the sink; disabled alerts still
/// reach the log at debug level instead of vanishing entirely.
pub struct LoggingAlertSink {
    enabled: Mutex<bool>,
}

impl Default for LoggingAlertSink {
    fn default() -> Self {
        Self {
            enabled: Mutex::new(true),
        }
    }
}

impl LoggingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.lock().unwrap() = enabled;
    }
}

impl AlertSink for LoggingAlertSink {
    fn alert(&self, alert: Alert) {
        let enabled = *self.enabled.lock().unwrap();
        if !enabled {
            // Disabled only suppresses the user-visible surface; the
            // message itself still reaches the log.
            match alert {
                Alert::Good(message) => tracing::debug!(%message, "alert (disabled)"),
                Alert::Bad(message) => tracing::debug!(%message, "alert (disabled)"),
            }
            return;
        }
        match alert {
            Alert::Good(message) => tracing::info!(%message, "connector alert"),
            Alert::Bad(message) => tracing::warn!(%message, "connector alert"),
        }
    }
}
