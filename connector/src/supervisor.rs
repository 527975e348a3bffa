//! Engine supervisor (spec §4.3): decide whether the engine is already
//! running, start or attach to it, and tear it down again.
//!
//! Service-manager interrogation is out of scope for the POSIX backend
//! built here (there is no single service-manager API across init systems);
//! `start()` always takes the "no service name configured" path — find an
//! existing process with the configured executable image and attach to it,
//! else spawn it. A future service-aware backend would slot in behind the
//! same [`EngineSupervisor`] contract.

use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sysinfo::{Pid, System};

use crate::config::ConnectorConfig;
use crate::error::ConnectorError;

enum EngineHandle {
    /// We spawned this process ourselves and own its `Child`.
    Owned(Child),
    /// We attached to a process that was already running.
    Attached(Pid),
}

pub struct EngineSupervisor {
    executable: std::path::PathBuf,
    poll_interval: Duration,
    stop_timeout: Duration,
    handle: Mutex<Option<EngineHandle>>,
    attached_before: AtomicBool,
}

impl EngineSupervisor {
    pub fn new(config: &ConnectorConfig) -> Self {
        Self {
            executable: config.service_executable.clone(),
            poll_interval: config.service_poll,
            stop_timeout: config.stop_timeout,
            handle: Mutex::new(None),
            attached_before: AtomicBool::new(false),
        }
    }

    /// Finds an existing process running the configured executable image,
    /// attaches to it if found, else spawns a fresh one.
    pub fn start(&self) -> Result<(), ConnectorError> {
        let mut slot = self.handle.lock().unwrap();
        if slot.is_some() {
            return Ok(());
        }
        if let Some(pid) = self.find_running_image() {
            self.attached_before.store(true, Ordering::Release);
            *slot = Some(EngineHandle::Attached(pid));
            return Ok(());
        }
        let child = Command::new(&self.executable)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                tracing::warn!(error = %e, executable = %self.executable.display(), "failed to spawn engine process");
                ConnectorError::EngineUnavailable
            })?;
        *slot = Some(EngineHandle::Owned(child));
        Ok(())
    }

    fn find_running_image(&self) -> Option<Pid> {
        let mut system = System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        let image_name = self.executable.file_name()?.to_string_lossy();
        system
            .processes()
            .iter()
            .find(|(_, process)| process.name().to_string_lossy() == image_name)
            .map(|(pid, _)| *pid)
    }

    pub fn is_alive(&self) -> bool {
        let mut slot = self.handle.lock().unwrap();
        match slot.as_mut() {
            Some(EngineHandle::Owned(child)) => matches!(child.try_wait(), Ok(None)),
            Some(EngineHandle::Attached(pid)) => {
                let mut system = System::new();
                system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[*pid]), true);
                system.process(*pid).is_some()
            }
            None => false,
        }
    }

    /// Sends a terminate signal (for a process we spawned) or nothing (for
    /// one we merely attached to — we never had a stop control for it),
    /// polls for exit up to `stop-timeout`, then forcibly kills it.
    pub fn stop(&self) {
        let mut slot = self.handle.lock().unwrap();
        let Some(handle) = slot.take() else { return };
        match handle {
            EngineHandle::Owned(mut child) => {
                let _ = terminate(&child);
                let deadline = Instant::now() + self.stop_timeout;
                loop {
                    match child.try_wait() {
                        Ok(Some(_)) => return,
                        Ok(None) if Instant::now() < deadline => {
                            std::thread::sleep(self.poll_interval);
                        }
                        _ => {
                            let _ = child.kill();
                            let _ = child.wait();
                            return;
                        }
                    }
                }
            }
            EngineHandle::Attached(_) => {
                // We never owned this process; leave it for whatever
                // started it to manage.
            }
        }
    }

    /// True exactly once: the first call after a successful `start()` tells
    /// the caller whether we attached to a pre-existing engine rather than
    /// bringing one up ourselves.
    pub fn first_connection(&self) -> bool {
        !self.attached_before.swap(true, Ordering::AcqRel)
    }
}

#[cfg(unix)]
fn terminate(child: &Child) -> Result<(), ConnectorError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as NixPid;
    kill(NixPid::from_raw(child.id() as i32), Signal::SIGTERM)
        .map_err(|e| ConnectorError::Internal(format!("cannot signal engine process: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(executable: &str) -> ConnectorConfig {
        let mut config = ConnectorConfig::default();
        config.service_executable = std::path::PathBuf::from(executable);
        config.service_poll = Duration::from_millis(20);
        config.stop_timeout = Duration::from_millis(500);
        config
    }

    #[test]
    fn start_spawns_when_no_matching_process_is_running() {
        let config = test_config("yes");
        let supervisor = EngineSupervisor::new(&config);
        supervisor.start().unwrap();
        assert!(supervisor.is_alive());
        supervisor.stop();
        assert!(!supervisor.is_alive());
    }

    #[test]
    fn first_connection_is_true_exactly_once() {
        let config = test_config("yes");
        let supervisor = EngineSupervisor::new(&config);
        supervisor.start().unwrap();
        assert!(supervisor.first_connection());
        assert!(!supervisor.first_connection());
        supervisor.stop();
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let config = test_config("sleep");
        let supervisor = EngineSupervisor::new(&config);
        supervisor.stop();
        assert!(!supervisor.is_alive());
    }
}
