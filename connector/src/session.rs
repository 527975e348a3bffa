//! Session establishment (spec §4.2): create the two session endpoints,
//! hand their names to the engine over the rendezvous endpoint, and accept
//! the engine's connections back.

use std::time::{Duration, Instant};

use connector_transport::{connect, ClientEndpoint, ServerEndpoint, UnixClientEndpoint, UnixServerEndpoint};
use connector_wire::{codec::BinaryCodec, ConnectDescriptor, Frame};

use crate::config::ConnectorConfig;
use crate::error::ConnectorError;

/// A live pair of session endpoints. `to_engine` carries client-to-engine
/// traffic (the `CPPToJavaPipe` side); `from_engine` carries engine-to-
/// client traffic (`JavaToCPPPipe`).
pub struct Session {
    pub to_engine: UnixClientEndpoint,
    pub from_engine: UnixClientEndpoint,
}

const LENGTH_PREFIX_BYTES: usize = 4;

pub fn write_frame(stream: &UnixClientEndpoint, frame: &Frame, deadline: Duration) -> Result<(), ConnectorError> {
    let body = BinaryCodec.encode_frame(frame);
    let mut out = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    stream.write_all(&out, deadline)?;
    Ok(())
}

pub fn read_frame(stream: &UnixClientEndpoint, deadline: Duration) -> Result<Frame, ConnectorError> {
    let deadline_at = Instant::now() + deadline;
    let mut length_buf = [0u8; LENGTH_PREFIX_BYTES];
    read_exact(stream, &mut length_buf, deadline_at)?;
    let length = u32::from_be_bytes(length_buf) as usize;
    let mut body = vec![0u8; length];
    read_exact(stream, &mut body, deadline_at)?;
    Ok(BinaryCodec.decode_frame(&body)?)
}

fn read_exact(stream: &UnixClientEndpoint, buf: &mut [u8], deadline_at: Instant) -> Result<(), ConnectorError> {
    let mut filled = 0;
    while filled < buf.len() {
        let remaining = deadline_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ConnectorError::Timeout);
        }
        let n = stream.read(&mut buf[filled..], remaining)?;
        filled += n;
    }
    Ok(())
}

/// Binds a session-side listener at a freshly generated name, retrying on
/// a name collision up to `max_attempts` times.
fn bind_with_retry(
    dir: &std::path::Path,
    prefix: &str,
    max_attempts: u32,
) -> Result<(UnixServerEndpoint, String), ConnectorError> {
    let mut last_error = None;
    for _ in 0..max_attempts.max(1) {
        let path = connector_transport::generate_endpoint_name(dir, prefix);
        match UnixServerEndpoint::bind(&path) {
            Ok(listener) => return Ok((listener, path.to_string_lossy().into_owned())),
            Err(e) => last_error = Some(e),
        }
    }
    Err(ConnectorError::HandshakeFailed(format!(
        "could not create a session endpoint after {max_attempts} attempt(s): {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Runs the full handshake: create both session listeners, connect to the
/// rendezvous endpoint, hand over the connect descriptor, then accept the
/// engine's connection on each listener.
pub fn establish(config: &ConnectorConfig) -> Result<Session, ConnectorError> {
    eprintln!("[{:?}] binding to_engine", std::time::Instant::now());
    let (to_engine_listener, to_engine_name) =
        bind_with_retry(&config.endpoint_dir, &config.input_pipe_prefix, config.max_pipe_attempts)?;
    eprintln!("[{:?}] bound to_engine at {:?}", std::time::Instant::now(), to_engine_name);
    let (from_engine_listener, from_engine_name) =
        bind_with_retry(&config.endpoint_dir, &config.output_pipe_prefix, config.max_pipe_attempts)?;
    eprintln!("[{:?}] bound from_engine at {:?}", std::time::Instant::now(), from_engine_name);
    for entry in std::fs::read_dir("/proc/self/fd").unwrap() {
        let entry = entry.unwrap();
        if let Ok(target) = std::fs::read_link(entry.path()) {
            eprintln!("  fd {:?} -> {:?}", entry.file_name(), target);
        }
    }

    let rendezvous_path = config.endpoint_dir.join(&config.connection_pipe);
    let rendezvous = connect(&rendezvous_path, config.handshake_timeout)
        .map_err(|e| ConnectorError::HandshakeFailed(format!("cannot connect to rendezvous endpoint: {e}")))?;

    let descriptor = ConnectDescriptor {
        user_name: config.user_name.clone(),
        cpp_to_java_pipe: to_engine_name,
        java_to_cpp_pipe: from_engine_name,
        language_id: config.language_id.clone(),
        debug: config.debug,
    };
    let encoded = BinaryCodec.encode_descriptor_message(&descriptor.to_message());
    rendezvous
        .write_all(&encoded, config.handshake_timeout)
        .map_err(|e| ConnectorError::HandshakeFailed(format!("cannot write connect descriptor: {e}")))?;
    rendezvous.close();

    eprintln!("[{:?}] accepting to_engine", std::time::Instant::now());
    let to_engine = to_engine_listener
        .accept(config.handshake_timeout)
        .map_err(|e| ConnectorError::HandshakeFailed(format!("cannot accept on the input endpoint: {e}")))?;
    eprintln!("[{:?}] accepted to_engine", std::time::Instant::now());
    let from_engine = from_engine_listener
        .accept(config.handshake_timeout)
        .map_err(|e| ConnectorError::HandshakeFailed(format!("cannot accept on the output endpoint: {e}")))?;
    eprintln!("[{:?}] accepted from_engine", std::time::Instant::now());

    Ok(Session { to_engine, from_engine })
}

#[cfg(test)]
mod tests {
    use super::*;
    use connector_wire::{Message, Value};

    /// A stand-in rendezvous server: accepts one connection, reads the
    /// connect descriptor, and reports the two session endpoint names it
    /// was handed so a test can connect to them as the engine would.
    fn spawn_fake_rendezvous(path: std::path::PathBuf) -> std::thread::JoinHandle<ConnectDescriptor> {
        std::thread::spawn(move || {
            let server = connector_transport::UnixServerEndpoint::bind(&path).unwrap();
            let client = server.accept(Duration::from_secs(5)).unwrap();
            let mut buf = vec![0u8; 4096];
            let n = client.read(&mut buf, Duration::from_secs(5)).unwrap();
            let msg = BinaryCodec.decode_descriptor_message(&buf[..n]).unwrap();
            ConnectDescriptor::from_message(&msg).unwrap()
        })
    }

    fn nonce_message(n: i32) -> Message {
        Message::new().with_named("nonce", Value::I32(n))
    }

    #[test]
    fn establish_completes_a_full_handshake() {
        let dir = std::env::temp_dir().join(format!("connector-session-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut config = ConnectorConfig::default();
        config.endpoint_dir = dir.clone();
        config.handshake_timeout = Duration::from_secs(5);

        let rendezvous_path = dir.join(&config.connection_pipe);
        let fake_rendezvous = spawn_fake_rendezvous(rendezvous_path);

        let config_for_engine = config.clone();
        let engine = std::thread::spawn(move || {
            let descriptor = fake_rendezvous.join().unwrap();
            eprintln!("[{:?}] engine got descriptor: {:?}", std::time::Instant::now(), descriptor);
            let to_client = connect(descriptor.java_to_cpp_pipe.clone(), config_for_engine.handshake_timeout).unwrap();
            eprintln!("[{:?}] engine connected to_client", std::time::Instant::now());
            let from_client = connect(descriptor.cpp_to_java_pipe.clone(), config_for_engine.handshake_timeout).unwrap();
            eprintln!("[{:?}] engine connected from_client", std::time::Instant::now());
            (to_client, from_client)
        });

        let session = establish(&config).unwrap();
        let (_engine_to_client, engine_from_client) = engine.join().unwrap();

        write_frame(&session.to_engine, &Frame::notification(nonce_message(1)), Duration::from_secs(2)).unwrap();

        let received = {
            let mut len_buf = [0u8; 4];
            engine_from_client.read(&mut len_buf, Duration::from_secs(2)).unwrap();
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            engine_from_client.read(&mut body, Duration::from_secs(2)).unwrap();
            BinaryCodec.decode_frame(&body).unwrap()
        };
        assert_eq!(received.payload.get_named("nonce").and_then(Value::as_i32), Some(1));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
