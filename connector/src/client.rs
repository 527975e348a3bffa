//! Client lifecycle state machine (spec §4.4): one runner thread drives
//! startup, the steady-state dispatch loop, restart-on-poison, and
//! shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use connector_transport::{ClientEndpoint, UnixClientEndpoint};
use connector_wire::{Frame, Message, Value};

use crate::alert::AlertSink;
use crate::config::ConnectorConfig;
use crate::dispatch::Dispatcher;
use crate::error::ConnectorError;
use crate::session::{self, Session};
use crate::supervisor::EngineSupervisor;
use crate::sync_calls::SyncCallTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Starting,
    Running,
    Stopping,
    Poisoned,
    Errored,
    Stopped,
}

pub type StateChangeCallback = dyn Fn(ClientState, ClientState) + Send + Sync;

pub(crate) struct SessionState {
    to_engine: UnixClientEndpoint,
    from_engine: UnixClientEndpoint,
}

impl From<Session> for SessionState {
    fn from(session: Session) -> Self {
        Self {
            to_engine: session.to_engine,
            from_engine: session.from_engine,
        }
    }
}

enum LoopExit {
    StopRequested,
    RestartIntended,
}

/// Owns one engine supervisor and one session; the public surface other
/// modules (request builder, public API) drive.
pub struct Client {
    config: ConnectorConfig,
    supervisor: EngineSupervisor,
    pub(crate) sync_table: Arc<SyncCallTable>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    alert_sink: Arc<dyn AlertSink>,
    session: Mutex<Option<Arc<SessionState>>>,
    write_lock: Mutex<()>,
    state: Mutex<ClientState>,
    state_cond: Condvar,
    state_callback: Mutex<Option<Box<StateChangeCallback>>>,
    stop_requested: AtomicBool,
    stop_mutex: Mutex<()>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn new(config: ConnectorConfig, alert_sink: Arc<dyn AlertSink>) -> Arc<Self> {
        let sync_table = SyncCallTable::new(config.initial_slot_capacity, config.max_slot_capacity);
        let dispatcher = Dispatcher::new(
            config.dispatch_idle_timeout,
            config.reschedule_delay,
            config.reschedule_info_period,
            config.reschedule_abort_period,
        );
        let supervisor = EngineSupervisor::new(&config);
        Arc::new(Self {
            config,
            supervisor,
            sync_table,
            dispatcher,
            alert_sink,
            session: Mutex::new(None),
            write_lock: Mutex::new(()),
            state: Mutex::new(ClientState::Stopped),
            state_cond: Condvar::new(),
            state_callback: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            stop_mutex: Mutex::new(()),
            runner: Mutex::new(None),
        })
    }

    pub fn set_state_callback(&self, callback: Box<StateChangeCallback>) {
        *self.state_callback.lock().unwrap() = Some(callback);
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap()
    }

    /// STOPPED/ERRORED → STARTING, then spawns the single runner thread
    /// that drives the rest of the lifecycle. A no-op if already starting
    /// or running.
    pub fn start(self: &Arc<Self>) -> Result<(), ConnectorError> {
        let mut runner = self.runner.lock().unwrap();
        if runner.is_some() {
            return Ok(());
        }
        {
            let mut state = self.state.lock().unwrap();
            if !matches!(*state, ClientState::Stopped | ClientState::Errored) {
                return Ok(());
            }
            self.transition(&mut state, ClientState::Starting);
        }
        self.stop_requested.store(false, Ordering::Release);
        let this = Arc::clone(self);
        *runner = Some(std::thread::spawn(move || this.run()));
        Ok(())
    }

    /// Blocks the calling thread until the client reaches RUNNING or a
    /// terminal (ERRORED) state, returning whether it is RUNNING.
    pub fn wait_for_startup(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            match *state {
                ClientState::Running => return true,
                ClientState::Errored | ClientState::Stopped => return false,
                _ => {}
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return matches!(*state, ClientState::Running);
            }
            let (guard, result) = self.state_cond.wait_timeout(state, remaining).unwrap();
            state = guard;
            if result.timed_out() {
                return matches!(*state, ClientState::Running);
            }
        }
    }

    /// Idempotent, mutex-protected shutdown: signals every blocked slot
    /// waiter, best-effort poisons the engine, poisons and releases the
    /// dispatcher, closes the session, and joins the runner.
    pub fn stop(self: &Arc<Self>) {
        let _guard = self.stop_mutex.lock().unwrap();
        let Some(handle) = self.runner.lock().unwrap().take() else {
            return;
        };
        self.stop_requested.store(true, Ordering::Release);
        self.sync_table.signal_all_semaphores();
        self.dispatcher.poison();
        let _ = self.send_poison_message();
        if let Some(session) = self.current_session() {
            session.to_engine.close();
            session.from_engine.close();
        }
        let _ = handle.join();
    }

    pub(crate) fn current_session(&self) -> Option<Arc<SessionState>> {
        self.session.lock().unwrap().clone()
    }

    /// Serializes frame sends on the session per spec §5 ("sends on a
    /// session are serialized per session — no interleaving of bytes from
    /// different writes").
    pub fn send_frame(&self, frame: &Frame, deadline: Duration) -> Result<(), ConnectorError> {
        let session = self.current_session().ok_or(ConnectorError::NotConnected)?;
        let _serialize = self.write_lock.lock().unwrap();
        session::write_frame(&session.to_engine, frame, deadline)
    }

    pub fn effective_call_timeout(&self) -> Duration {
        self.config.effective_call_timeout()
    }

    pub fn sync_table(&self) -> &Arc<SyncCallTable> {
        &self.sync_table
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ClientState::Running)
    }

    fn run(self: Arc<Self>) {
        if !self.bring_up(false) {
            return;
        }
        loop {
            match self.dispatch_loop() {
                LoopExit::StopRequested => {
                    self.finish_stop();
                    return;
                }
                LoopExit::RestartIntended => {
                    {
                        let mut state = self.state.lock().unwrap();
                        self.transition(&mut state, ClientState::Poisoned);
                    }
                    self.teardown_session();
                    if !self.bring_up(true) {
                        return;
                    }
                }
            }
        }
    }

    /// Runs the STARTING phase: one attempt, and if `allow_retry` is
    /// false (the initial bring-up) a second attempt on failure, else
    /// (POISONED → RUNNING) only the one. Ends in RUNNING (`true`) or
    /// ERRORED (`false`).
    fn bring_up(self: &Arc<Self>, is_retry_after_poison: bool) -> bool {
        let max_attempts = if is_retry_after_poison { 1 } else { 2 };
        for attempt in 1..=max_attempts {
            match self.attempt_start() {
                Ok(session) => {
                    *self.session.lock().unwrap() = Some(Arc::new(session.into()));
                    self.sync_table.clear_all_semaphores();
                    let mut state = self.state.lock().unwrap();
                    self.transition(&mut state, ClientState::Running);
                    return true;
                }
                Err(e) => {
                    self.teardown_session();
                    self.supervisor.stop();
                    if attempt == max_attempts {
                        tracing::error!(error = %e, "engine failed to start");
                        self.alert_sink.alert(crate::alert::Alert::Bad(format!("engine start failed: {e}")));
                        let mut state = self.state.lock().unwrap();
                        self.transition(&mut state, ClientState::Errored);
                        return false;
                    }
                    tracing::warn!(error = %e, "engine start failed, retrying once");
                }
            }
        }
        unreachable!("loop always returns within max_attempts iterations")
    }

    fn attempt_start(&self) -> Result<Session, ConnectorError> {
        self.supervisor.start()?;
        let session = session::establish(&self.config)?;
        self.initial_heartbeat(&session)?;
        Ok(session)
    }

    /// "heartbeat succeeded" as part of STARTING (spec §4.4's transition
    /// table): a ping-pong that also proves the session carries real
    /// traffic, not merely that both ends accepted the connection.
    fn initial_heartbeat(&self, session: &Session) -> Result<(), ConnectorError> {
        session::write_frame(&session.to_engine, &heartbeat_frame(), self.config.handshake_timeout)?;
        session::read_frame(&session.from_engine, self.config.handshake_timeout)?;
        Ok(())
    }

    fn dispatch_loop(self: &Arc<Self>) -> LoopExit {
        let mut missed_heartbeats: u32 = 0;
        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                return LoopExit::StopRequested;
            }
            let Some(session) = self.current_session() else {
                return LoopExit::RestartIntended;
            };
            match session::read_frame(&session.from_engine, self.config.heartbeat_timeout) {
                Ok(frame) => {
                    missed_heartbeats = 0;
                    self.route_frame(frame);
                }
                Err(ConnectorError::Timeout) => {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= self.config.heartbeat_miss_limit {
                        tracing::warn!(missed_heartbeats, "engine missed consecutive heartbeats, restarting");
                        return LoopExit::RestartIntended;
                    }
                    if let Err(e) = self.send_frame(&heartbeat_frame(), self.config.send_timeout) {
                        tracing::warn!(error = %e, "failed to send heartbeat");
                        return LoopExit::RestartIntended;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "session read failed, restarting");
                    return LoopExit::RestartIntended;
                }
            }
        }
    }

    fn route_frame(self: &Arc<Self>, frame: Frame) {
        match frame.handle {
            Some(handle) => self.sync_table.deliver(handle as u32, frame.payload),
            None => match frame.class_name() {
                Some(class_name) => {
                    let class_name = class_name.to_string();
                    self.dispatcher.dispatch(&class_name, frame.payload);
                }
                None => tracing::debug!("dropping notification with no class name"),
            },
        }
    }

    fn send_poison_message(&self) -> Result<(), ConnectorError> {
        let frame = Frame::notification(Message::new().with_ordinal(0, Value::Str("Poison".to_string())));
        self.send_frame(&frame, self.config.send_timeout)
    }

    fn teardown_session(&self) {
        if let Some(session) = self.session.lock().unwrap().take() {
            session.to_engine.close();
            session.from_engine.close();
        }
    }

    fn finish_stop(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            self.transition(&mut state, ClientState::Stopping);
        }
        self.teardown_session();
        self.supervisor.stop();
        let mut state = self.state.lock().unwrap();
        self.transition(&mut state, ClientState::Stopped);
    }

    fn transition(self: &Arc<Self>, state: &mut ClientState, to: ClientState) {
        let from = *state;
        *state = to;
        self.state_cond.notify_all();
        if let Some(callback) = self.state_callback.lock().unwrap().as_ref() {
            callback(from, to);
        }
    }
}

fn heartbeat_frame() -> Frame {
    Frame::notification(Message::new().with_ordinal(0, Value::Str("Heartbeat".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LoggingAlertSink;
    use connector_transport::{ServerEndpoint, UnixServerEndpoint};
    use connector_wire::codec::BinaryCodec;

    fn test_config(dir: &std::path::Path) -> ConnectorConfig {
        let mut config = ConnectorConfig::default();
        config.endpoint_dir = dir.to_path_buf();
        config.handshake_timeout = Duration::from_secs(2);
        config.heartbeat_timeout = Duration::from_millis(200);
        config.heartbeat_miss_limit = 2;
        config.service_executable = std::path::PathBuf::from("cat");
        config
    }

    /// A fake engine: completes the rendezvous handshake, answers the
    /// initial heartbeat, then echoes every frame it receives back with
    /// the same handle until told to stop.
    fn spawn_fake_engine(dir: std::path::PathBuf, connection_pipe: String) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let rendezvous_path = dir.join(&connection_pipe);
            let server = UnixServerEndpoint::bind(&rendezvous_path).unwrap();
            let rendezvous_client = server.accept(Duration::from_secs(5)).unwrap();
            let mut buf = vec![0u8; 4096];
            let n = rendezvous_client.read(&mut buf, Duration::from_secs(5)).unwrap();
            let msg = BinaryCodec.decode_descriptor_message(&buf[..n]).unwrap();
            let descriptor = connector_wire::ConnectDescriptor::from_message(&msg).unwrap();

            let to_client = connector_transport::connect(&descriptor.java_to_cpp_pipe, Duration::from_secs(5)).unwrap();
            let from_client = connector_transport::connect(&descriptor.cpp_to_java_pipe, Duration::from_secs(5)).unwrap();

            // Answer the startup heartbeat.
            let frame = session::read_frame(&from_client, Duration::from_secs(5)).unwrap();
            session::write_frame(&to_client, &frame, Duration::from_secs(5)).unwrap();

            loop {
                match session::read_frame(&from_client, Duration::from_secs(5)) {
                    Ok(frame) => {
                        if frame.class_name() == Some("Poison") {
                            return;
                        }
                        let _ = session::write_frame(&to_client, &frame, Duration::from_secs(5));
                    }
                    Err(_) => return,
                }
            }
        })
    }

    #[test]
    fn start_then_stop_reaches_stopped() {
        let dir = std::env::temp_dir().join(format!("connector-client-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = test_config(&dir);
        let connection_pipe = config.connection_pipe.clone();
        let engine = spawn_fake_engine(dir.clone(), connection_pipe);

        let client = Client::new(config, Arc::new(LoggingAlertSink::default()));
        client.start().unwrap();
        assert!(client.wait_for_startup(Duration::from_secs(5)));
        assert_eq!(client.state(), ClientState::Running);

        client.stop();
        assert_eq!(client.state(), ClientState::Stopped);

        let _ = engine.join();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn echoed_reply_is_delivered_to_the_waiting_slot() {
        let dir = std::env::temp_dir().join(format!("connector-client-test-echo-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = test_config(&dir);
        let connection_pipe = config.connection_pipe.clone();
        let engine = spawn_fake_engine(dir.clone(), connection_pipe);

        let client = Client::new(config, Arc::new(LoggingAlertSink::default()));
        client.start().unwrap();
        assert!(client.wait_for_startup(Duration::from_secs(5)));

        let slot = client.sync_table().acquire().unwrap();
        let frame = Frame::reply(slot.handle() as i32, Message::new().with_named("nonce", Value::I32(11)));
        client.send_frame(&frame, Duration::from_secs(2)).unwrap();
        let reply = client
            .sync_table()
            .wait(&slot, Duration::from_secs(2), client.is_running())
            .unwrap();
        assert_eq!(reply.get_named("nonce").and_then(Value::as_i32), Some(11));

        client.stop();
        let _ = engine.join();
        let _ = std::fs::remove_dir_all(&dir);
    }

    /// Completes one handshake, answers the heartbeat, then drops the
    /// session (simulating a crash) before re-accepting a second
    /// rendezvous connection and staying up this time.
    fn spawn_crash_once_engine(dir: std::path::PathBuf, connection_pipe: String) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let rendezvous_path = dir.join(&connection_pipe);
            let server = UnixServerEndpoint::bind(&rendezvous_path).unwrap();
            for attempt in 0..2 {
                let rendezvous_client = server.accept(Duration::from_secs(5)).unwrap();
                let mut buf = vec![0u8; 4096];
                let n = rendezvous_client.read(&mut buf, Duration::from_secs(5)).unwrap();
                let msg = BinaryCodec.decode_descriptor_message(&buf[..n]).unwrap();
                let descriptor = connector_wire::ConnectDescriptor::from_message(&msg).unwrap();

                let to_client =
                    connector_transport::connect(&descriptor.java_to_cpp_pipe, Duration::from_secs(5)).unwrap();
                let from_client =
                    connector_transport::connect(&descriptor.cpp_to_java_pipe, Duration::from_secs(5)).unwrap();

                let frame = session::read_frame(&from_client, Duration::from_secs(5)).unwrap();
                session::write_frame(&to_client, &frame, Duration::from_secs(5)).unwrap();

                if attempt == 0 {
                    to_client.close();
                    from_client.close();
                    continue;
                }

                loop {
                    match session::read_frame(&from_client, Duration::from_secs(5)) {
                        Ok(frame) => {
                            if frame.class_name() == Some("Poison") {
                                return;
                            }
                            let _ = session::write_frame(&to_client, &frame, Duration::from_secs(5));
                        }
                        Err(_) => return,
                    }
                }
            }
        })
    }

    #[test]
    fn engine_crash_then_recover_returns_to_running() {
        let dir = std::env::temp_dir().join(format!("connector-client-test-crash-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = test_config(&dir);
        let connection_pipe = config.connection_pipe.clone();
        let engine = spawn_crash_once_engine(dir.clone(), connection_pipe);

        let client = Client::new(config, Arc::new(LoggingAlertSink::default()));
        client.start().unwrap();
        assert!(client.wait_for_startup(Duration::from_secs(5)));
        assert_eq!(client.state(), ClientState::Running);

        // The client may already have cycled through POISONED and back to
        // RUNNING between polls; only treat it as stuck if it never leaves
        // RUNNING (the pre-crash state) at all within the deadline.
        let poisoned_deadline = std::time::Instant::now() + Duration::from_secs(5);
        while client.state() == ClientState::Running {
            if std::time::Instant::now() > poisoned_deadline {
                panic!("client never observed the simulated crash (stuck in RUNNING)");
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let recovered_deadline = std::time::Instant::now() + Duration::from_secs(5);
        while client.state() != ClientState::Running {
            if std::time::Instant::now() > recovered_deadline {
                panic!("client never recovered into RUNNING after the simulated crash (stuck in {:?})", client.state());
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        client.stop();
        let _ = engine.join();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn engine_hang_exhausts_the_single_poison_retry_and_errors() {
        let dir = std::env::temp_dir().join(format!("connector-client-test-hang-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut config = test_config(&dir);
        config.handshake_timeout = Duration::from_millis(300);
        let connection_pipe = config.connection_pipe.clone();

        // Accepts exactly one rendezvous connection, answers the initial
        // heartbeat, then never responds again and never re-accepts -
        // standing in for an engine that hangs and cannot be reconnected
        // to, so the retry after POISONED has nothing to connect to.
        let engine = std::thread::spawn(move || {
            let rendezvous_path = dir.join(&connection_pipe);
            let server = UnixServerEndpoint::bind(&rendezvous_path).unwrap();
            let rendezvous_client = server.accept(Duration::from_secs(5)).unwrap();
            let mut buf = vec![0u8; 4096];
            let n = rendezvous_client.read(&mut buf, Duration::from_secs(5)).unwrap();
            let msg = BinaryCodec.decode_descriptor_message(&buf[..n]).unwrap();
            let descriptor = connector_wire::ConnectDescriptor::from_message(&msg).unwrap();
            let to_client = connector_transport::connect(&descriptor.java_to_cpp_pipe, Duration::from_secs(5)).unwrap();
            let from_client = connector_transport::connect(&descriptor.cpp_to_java_pipe, Duration::from_secs(5)).unwrap();
            let frame = session::read_frame(&from_client, Duration::from_secs(5)).unwrap();
            session::write_frame(&to_client, &frame, Duration::from_secs(5)).unwrap();
            std::thread::sleep(Duration::from_secs(10));
        });

        let client = Client::new(config, Arc::new(LoggingAlertSink::default()));
        client.start().unwrap();
        assert!(client.wait_for_startup(Duration::from_secs(5)));
        assert_eq!(client.state(), ClientState::Running);

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while client.state() != ClientState::Errored {
            if std::time::Instant::now() > deadline {
                panic!("client never reached ERRORED after the engine hung and the retry failed to connect");
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        client.stop();
        drop(engine);
    }
}
