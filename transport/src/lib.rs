//! Local bidirectional byte-stream endpoints (spec §4.1).
//!
//! Every operation here takes an explicit deadline rather than relying on a
//! socket-wide timeout set once at construction, because the call sites
//! above this crate (handshake, slot-table wait, heartbeat) each need a
//! different deadline for the same stream. A "server-role" endpoint only
//! offers [`ServerEndpoint::accept`]; the connection it hands back is a
//! plain [`ClientEndpoint`] like the one [`connect`] returns. Named-pipe
//! backends would unify listener and connection into one handle — Unix
//! domain sockets don't, so this crate keeps the two separate rather than
//! forcing an artificial unification.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once};
use std::time::{Duration, Instant};

/// Written by the server immediately after `accept`, and read by the client
/// immediately after `connect`, before either side does anything else. A
/// kernel can hand the server a connection it then discards on error before
/// the client observes the failure; the handshake byte turns that race into
/// a read error on the client instead of silent data loss.
const HANDSHAKE_BYTE: u8 = 0x01;
const HANDSHAKE_DEADLINE: Duration = Duration::from_millis(5_000);

/// Send-buffer size applied to every endpoint (spec §4.1: "small, so a slow
/// or wedged peer applies backpressure quickly instead of absorbing
/// megabytes of queued frames").
const SEND_BUFFER_BYTES: usize = 4096;

static IGNORE_SIGPIPE: Once = Once::new();

fn ensure_sigpipe_ignored() {
    IGNORE_SIGPIPE.call_once(|| {
        use nix::sys::signal::{signal, SigHandler, Signal};
        // SAFETY: SigIgn is one of the two handlers `signal` documents as
        // always safe to install; writing to an already-shutdown stream
        // would otherwise raise SIGPIPE and kill the process instead of
        // returning an error we can act on.
        if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
            tracing::warn!(error = %e, "failed to ignore SIGPIPE");
        }
    });
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,
    #[error("stream is closed")]
    Closed,
    #[error("handshake byte was not received")]
    HandshakeFailed,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A connected, bidirectional byte stream.
pub trait ClientEndpoint: Send + Sync {
    /// Reads at least one byte into `buf`, blocking up to `deadline`.
    /// Returns `Ok(0)` only if `buf` is empty.
    fn read(&self, buf: &mut [u8], deadline: Duration) -> Result<usize, TransportError>;

    /// Writes as much of `buf` as the peer will currently accept, blocking
    /// up to `deadline`.
    fn write(&self, buf: &[u8], deadline: Duration) -> Result<usize, TransportError>;

    fn flush(&self) -> Result<(), TransportError>;

    /// Closes the stream now. Idempotent; unblocks any other thread
    /// currently inside [`ClientEndpoint::read`] or [`ClientEndpoint::write`]
    /// on the same endpoint with [`TransportError::Closed`].
    fn close(&self);

    /// Arms a soft idle deadline: the next `read` or `write` whose caller
    /// deadline exceeds `idle` is capped to `idle` instead, and if that
    /// capped deadline expires the stream is closed rather than returning
    /// a plain timeout.
    fn lazy_close(&self, idle: Duration);

    fn cancel_lazy_close(&self);

    fn write_all(&self, mut buf: &[u8], deadline: Duration) -> Result<(), TransportError> {
        let deadline_at = Instant::now() + deadline;
        while !buf.is_empty() {
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }
            let n = self.write(buf, remaining)?;
            buf = &buf[n..];
        }
        Ok(())
    }
}

/// A listening endpoint offering connections to clients.
pub trait ServerEndpoint: Send + Sync {
    type Client: ClientEndpoint;

    fn accept(&self, deadline: Duration) -> Result<Self::Client, TransportError>;
}

/// A Unix-domain-socket-backed [`ServerEndpoint`], bound at a filesystem
/// path (spec §9 Open Question: Windows named pipes are a separate backend
/// behind the same trait, not yet implemented here).
pub struct UnixServerEndpoint {
    listener: UnixListener,
}

impl UnixServerEndpoint {
    /// Binds a new listener at `path`. Removes a stale socket file first;
    /// safe because endpoint names are generated fresh per session (see
    /// [`generate_endpoint_name`]) and never reused across processes.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        ensure_sigpipe_ignored();
        let path = path.as_ref();
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        Ok(Self { listener })
    }
}

impl ServerEndpoint for UnixServerEndpoint {
    type Client = UnixClientEndpoint;

    fn accept(&self, deadline: Duration) -> Result<UnixClientEndpoint, TransportError> {
        wait_readable(self.listener.as_raw_fd(), deadline)?;
        let (stream, _addr) = self.listener.accept()?;
        let endpoint = UnixClientEndpoint::from_stream(stream)?;
        endpoint.write_all(&[HANDSHAKE_BYTE], HANDSHAKE_DEADLINE)?;
        Ok(endpoint)
    }
}

/// Connects to a [`UnixServerEndpoint`] bound at `path`.
///
/// The server may not have called [`UnixServerEndpoint::bind`] yet (the
/// rendezvous endpoint names the not-yet-created session endpoints), so
/// `ENOENT`/`ECONNREFUSED` are retried in a short poll loop until `deadline`
/// elapses rather than failing on the first attempt.
pub fn connect(path: impl AsRef<Path>, deadline: Duration) -> Result<UnixClientEndpoint, TransportError> {
    ensure_sigpipe_ignored();
    let path = path.as_ref();
    let deadline_at = Instant::now() + deadline;
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => {
                eprintln!("[transport] connected to {:?}, calling from_stream", path);
                let endpoint = UnixClientEndpoint::from_stream(stream)?;
                eprintln!("[transport] from_stream ok, reading handshake byte");
                match endpoint.read_handshake_byte() {
                    Ok(()) => { eprintln!("[transport] handshake byte ok"); }
                    Err(e) => { eprintln!("[transport] handshake byte FAILED: {:?}", e); return Err(e); }
                }
                return Ok(endpoint);
            }
            Err(e)
                if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused)
                    && Instant::now() < deadline_at =>
            {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
}

#[derive(Debug)]
pub struct UnixClientEndpoint {
    stream: UnixStream,
    closed: AtomicBool,
    lazy_idle: Mutex<Option<Duration>>,
}

impl UnixClientEndpoint {
    fn from_stream(stream: UnixStream) -> Result<Self, TransportError> {
        configure_send_buffer(&stream);
        Ok(Self {
            stream,
            closed: AtomicBool::new(false),
            lazy_idle: Mutex::new(None),
        })
    }

    fn write_handshake_byte(&self) -> Result<(), TransportError> {
        self.write_all(&[HANDSHAKE_BYTE], HANDSHAKE_DEADLINE)
    }

    fn read_handshake_byte(&self) -> Result<(), TransportError> {
        let mut byte = [0u8; 1];
        let n = self.read(&mut byte, HANDSHAKE_DEADLINE)?;
        if n != 1 || byte[0] != HANDSHAKE_BYTE {
            return Err(TransportError::HandshakeFailed);
        }
        Ok(())
    }

    /// Shrinks `caller` to the armed idle deadline when the latter is
    /// tighter, reporting whether the shrink happened so the caller can
    /// tell a genuine timeout from an idle-close.
    fn effective_deadline(&self, caller: Duration) -> (Duration, bool) {
        match *self.lazy_idle.lock().unwrap() {
            Some(idle) if idle < caller => (idle, true),
            _ => (caller, false),
        }
    }
}

impl ClientEndpoint for UnixClientEndpoint {
    fn read(&self, buf: &mut [u8], deadline: Duration) -> Result<usize, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let (deadline, lazy) = self.effective_deadline(deadline);
        if deadline.is_zero() {
            return Err(if lazy {
                self.close();
                TransportError::Closed
            } else {
                TransportError::Timeout
            });
        }
        self.stream.set_read_timeout(Some(deadline))?;
        match (&self.stream).read(buf) {
            Ok(0) if !buf.is_empty() => {
                self.close();
                Err(TransportError::Closed)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if lazy {
                    self.close();
                    Err(TransportError::Closed)
                } else {
                    Err(TransportError::Timeout)
                }
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn write(&self, buf: &[u8], deadline: Duration) -> Result<usize, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let (deadline, lazy) = self.effective_deadline(deadline);
        if deadline.is_zero() {
            return Err(if lazy {
                self.close();
                TransportError::Closed
            } else {
                TransportError::Timeout
            });
        }
        self.stream.set_write_timeout(Some(deadline))?;
        match (&self.stream).write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if lazy {
                    self.close();
                    Err(TransportError::Closed)
                } else {
                    Err(TransportError::Timeout)
                }
            }
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                self.close();
                Err(TransportError::Closed)
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn flush(&self) -> Result<(), TransportError> {
        // Unix stream sockets carry no userspace write buffer in this
        // implementation, so there is nothing to flush.
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn lazy_close(&self, idle: Duration) {
        *self.lazy_idle.lock().unwrap() = Some(idle);
    }

    fn cancel_lazy_close(&self) {
        *self.lazy_idle.lock().unwrap() = None;
    }
}

fn configure_send_buffer(stream: &UnixStream) {
    use nix::sys::socket::{setsockopt, sockopt::SndBuf};
    if let Err(e) = setsockopt(stream, SndBuf, &SEND_BUFFER_BYTES) {
        tracing::warn!(error = %e, "failed to set send buffer size");
    }
}

fn wait_readable(fd: std::os::fd::RawFd, deadline: Duration) -> Result<(), TransportError> {
    use nix::poll::{poll, PollFd, PollFlags};
    let timeout_ms = i32::try_from(deadline.as_millis()).unwrap_or(i32::MAX);
    let borrowed_fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(&borrowed_fd, PollFlags::POLLIN)];
    let ready = poll(&mut fds, timeout_ms).map_err(|e| TransportError::Io(io::Error::from(e)))?;
    if ready == 0 {
        return Err(TransportError::Timeout);
    }
    Ok(())
}

/// Generates a unique endpoint path under `dir`, named `<prefix><8 hex
/// digits>` from a monotonic counter (grounded in the rendezvous pipe
/// naming scheme: a short prefix plus a collision-resistant suffix, so two
/// sessions started in the same directory never collide).
pub fn generate_endpoint_name(dir: impl AsRef<Path>, prefix: &str) -> std::path::PathBuf {
    use std::sync::atomic::AtomicU32;
    static COUNTER: AtomicU32 = AtomicU32::new(1);
    let suffix = COUNTER.fetch_add(1, Ordering::Relaxed) ^ (std::process::id());
    dir.as_ref().join(format!("{prefix}{suffix:08x}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn temp_socket_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("connector-transport-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn accept_and_connect_complete_the_handshake() {
        let path = temp_socket_path("handshake");
        let server = UnixServerEndpoint::bind(&path).unwrap();
        let accepted = std::thread::spawn(move || server.accept(Duration::from_secs(2)).unwrap());
        let client = connect(&path, Duration::from_secs(2)).unwrap();
        let server_side = accepted.join().unwrap();

        client.write_all(b"ping", Duration::from_secs(1)).unwrap();
        let mut buf = [0u8; 4];
        let n = server_side.read(&mut buf, Duration::from_secs(1)).unwrap();
        assert_eq!(&buf[..n], b"ping");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn accept_times_out_when_nobody_connects() {
        let path = temp_socket_path("accept-timeout");
        let server = UnixServerEndpoint::bind(&path).unwrap();
        let err = server.accept(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn read_times_out_without_closing() {
        let path = temp_socket_path("read-timeout");
        let server = UnixServerEndpoint::bind(&path).unwrap();
        let accepted = std::thread::spawn(move || server.accept(Duration::from_secs(2)).unwrap());
        let client = connect(&path, Duration::from_secs(2)).unwrap();
        let server_side = accepted.join().unwrap();

        let mut buf = [0u8; 4];
        let err = server_side.read(&mut buf, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, TransportError::Timeout));

        client.write_all(b"ok!!", Duration::from_secs(1)).unwrap();
        let n = server_side.read(&mut buf, Duration::from_secs(1)).unwrap();
        assert_eq!(&buf[..n], b"ok!!");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn close_unblocks_a_concurrent_reader() {
        let path = temp_socket_path("close-unblocks");
        let server = UnixServerEndpoint::bind(&path).unwrap();
        let accepted = std::thread::spawn(move || server.accept(Duration::from_secs(2)).unwrap());
        let _client = connect(&path, Duration::from_secs(2)).unwrap();
        let server_side = Arc::new(accepted.join().unwrap());

        let reader = {
            let server_side = Arc::clone(&server_side);
            std::thread::spawn(move || {
                let mut buf = [0u8; 4];
                server_side.read(&mut buf, Duration::from_secs(10))
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        server_side.close();
        let result = reader.join().unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn lazy_close_caps_a_longer_caller_deadline() {
        let path = temp_socket_path("lazy-close");
        let server = UnixServerEndpoint::bind(&path).unwrap();
        let accepted = std::thread::spawn(move || server.accept(Duration::from_secs(2)).unwrap());
        let _client = connect(&path, Duration::from_secs(2)).unwrap();
        let server_side = accepted.join().unwrap();

        server_side.lazy_close(Duration::from_millis(50));
        let mut buf = [0u8; 4];
        let err = server_side.read(&mut buf, Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cancel_lazy_close_restores_the_caller_deadline() {
        let path = temp_socket_path("cancel-lazy-close");
        let server = UnixServerEndpoint::bind(&path).unwrap();
        let accepted = std::thread::spawn(move || server.accept(Duration::from_secs(2)).unwrap());
        let client = connect(&path, Duration::from_secs(2)).unwrap();
        let server_side = accepted.join().unwrap();

        server_side.lazy_close(Duration::from_millis(50));
        server_side.cancel_lazy_close();
        std::thread::sleep(Duration::from_millis(100));

        client.write_all(b"late", Duration::from_secs(1)).unwrap();
        let mut buf = [0u8; 4];
        let n = server_side.read(&mut buf, Duration::from_secs(1)).unwrap();
        assert_eq!(&buf[..n], b"late");
        let _ = std::fs::remove_file(&path);
    }
}
