//! Connector configuration (grounded in `Settings.h`'s field set).

use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ConnectorConfig {
    /// Directory the rendezvous and session endpoint files are created in.
    pub endpoint_dir: PathBuf,
    /// Rendezvous endpoint name (`connection-pipe`).
    pub connection_pipe: String,
    /// Session endpoint name prefixes (`input-pipe-prefix`, `output-pipe-prefix`).
    pub input_pipe_prefix: String,
    pub output_pipe_prefix: String,
    /// Max collision retries for endpoint creation (`max-pipe-attempts`).
    pub max_pipe_attempts: u32,
    /// User name sent in the connect descriptor.
    pub user_name: String,
    /// Language identifier sent in the connect descriptor.
    pub language_id: String,
    /// Whether the engine should be started in debug mode.
    pub debug: bool,
    /// Deadline for the handshake (rendezvous connect + descriptor exchange).
    pub handshake_timeout: Duration,
    /// Default deadline used to send a request frame.
    pub send_timeout: Duration,
    /// Default deadline used to wait for a synchronous reply. Per spec
    /// §4.7, defaults to twice `send_timeout` when not set explicitly.
    pub call_timeout: Option<Duration>,
    /// Idle period before a heartbeat ping is sent.
    pub heartbeat_timeout: Duration,
    /// How many consecutive unanswered heartbeats before the client leaves
    /// RUNNING with restart intent.
    pub heartbeat_miss_limit: u32,
    /// How long the dispatch worker thread waits with an empty queue
    /// before shutting itself down (`inactivity-timeout`).
    pub dispatch_idle_timeout: Duration,
    /// Fixed delay applied to a requeued dispatch operation.
    pub reschedule_delay: Duration,
    /// Requeue count (derived from a period / `reschedule_delay`) after
    /// which a WARN is logged.
    pub reschedule_info_period: Duration,
    /// Requeue count after which the operation and the rest of the queue
    /// (save VITAL operations) are abandoned.
    pub reschedule_abort_period: Duration,
    /// Number of slots the synchronous call table starts with.
    pub initial_slot_capacity: usize,
    /// Upper bound the call table will grow to before returning
    /// `OutOfMemory` instead of growing further.
    pub max_slot_capacity: usize,
    /// Service manager knobs (§4.3); `service_name` of `None` means
    /// "always find-or-spawn `service_executable` directly".
    pub service_name: Option<String>,
    pub service_executable: PathBuf,
    pub service_poll: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    /// Opaque path handed to the logging layer; the core never reads it.
    pub log_configuration: Option<PathBuf>,
    /// Whether user-visible alerts are emitted at all.
    pub display_alerts: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            endpoint_dir: std::env::temp_dir(),
            connection_pipe: "connector-rendezvous".to_string(),
            input_pipe_prefix: "connector-ctoe-".to_string(),
            output_pipe_prefix: "connector-etoc-".to_string(),
            max_pipe_attempts: 16,
            user_name: whoami_fallback(),
            language_id: "Rust".to_string(),
            debug: false,
            handshake_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            call_timeout: None,
            heartbeat_timeout: Duration::from_secs(2),
            heartbeat_miss_limit: 2,
            dispatch_idle_timeout: Duration::from_secs(30),
            reschedule_delay: Duration::from_millis(250),
            reschedule_info_period: Duration::from_secs(5),
            reschedule_abort_period: Duration::from_secs(30),
            initial_slot_capacity: 64,
            max_slot_capacity: 1 << 19,
            service_name: None,
            service_executable: PathBuf::from("engine"),
            service_poll: Duration::from_millis(200),
            start_timeout: Duration::from_secs(15),
            stop_timeout: Duration::from_secs(10),
            log_configuration: None,
            display_alerts: true,
        }
    }
}

impl ConnectorConfig {
    /// The deadline used to wait for a synchronous reply: twice the send
    /// timeout unless overridden (spec §4.7).
    pub fn effective_call_timeout(&self) -> Duration {
        self.call_timeout.unwrap_or(self.send_timeout * 2)
    }
}

fn whoami_fallback() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
