//! Drives a [`connector_core::Client`] end to end against an in-process
//! loopback stand-in for the engine, since this workspace ships no real
//! engine binary. The stand-in completes the rendezvous handshake, answers
//! the startup heartbeat, echoes `Echo` requests back, and pushes one
//! `Notify` event shortly after connecting.

use std::sync::Arc;
use std::time::Duration;

use connector_core::{
    call, Alert, AlertSink, Client, ConnectorConfig, ConnectorError, DispatchOutcome, LoggingAlertSink, Message,
    Value, WireRequest, WireResponse,
};
use connector_transport::{connect, ClientEndpoint, ServerEndpoint, UnixServerEndpoint};
use connector_wire::{codec::BinaryCodec, ConnectDescriptor, Frame};

struct EchoRequest {
    nonce: i32,
}

impl WireRequest for EchoRequest {
    fn to_message(&self) -> Message {
        Message::new().with_named("nonce", Value::I32(self.nonce))
    }
}

#[derive(Debug)]
struct EchoResponse {
    nonce: i32,
}

impl WireResponse for EchoResponse {
    fn from_message(message: Message) -> Result<Self, ConnectorError> {
        let nonce = message
            .get_named("nonce")
            .and_then(Value::as_i32)
            .ok_or_else(|| ConnectorError::Protocol("missing nonce".into()))?;
        Ok(Self { nonce })
    }
}

fn spawn_loopback_engine(dir: std::path::PathBuf, connection_pipe: String) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let rendezvous_path = dir.join(&connection_pipe);
        let server = match UnixServerEndpoint::bind(&rendezvous_path) {
            Ok(server) => server,
            Err(e) => {
                tracing::error!(error = %e, "loopback engine failed to bind the rendezvous endpoint");
                return;
            }
        };
        let rendezvous_client = match server.accept(Duration::from_secs(5)) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "loopback engine never saw a rendezvous connection");
                return;
            }
        };
        let mut buf = vec![0u8; 4096];
        let n = rendezvous_client.read(&mut buf, Duration::from_secs(5)).unwrap();
        let msg = BinaryCodec.decode_descriptor_message(&buf[..n]).unwrap();
        let descriptor = ConnectDescriptor::from_message(&msg).unwrap();

        let to_client = connect(descriptor.java_to_cpp_pipe.clone(), Duration::from_secs(5)).unwrap();
        let from_client = connect(descriptor.cpp_to_java_pipe.clone(), Duration::from_secs(5)).unwrap();

        // Answer the startup heartbeat.
        if let Ok(frame) = read_frame(&from_client) {
            let _ = write_frame(&to_client, &frame);
        }

        // Push an unsolicited notification shortly after connecting.
        std::thread::sleep(Duration::from_millis(50));
        let event = Frame::notification(
            Message::new()
                .with_ordinal(0, Value::Str("Notify".to_string()))
                .with_named("detail", Value::Str("engine is ready".to_string())),
        );
        let _ = write_frame(&to_client, &event);

        loop {
            match read_frame(&from_client) {
                Ok(frame) => {
                    if frame.class_name() == Some("Poison") {
                        return;
                    }
                    let _ = write_frame(&to_client, &frame);
                }
                Err(_) => return,
            }
        }
    })
}

fn read_frame(stream: &impl ClientEndpoint) -> Result<Frame, connector_transport::TransportError> {
    let mut len_buf = [0u8; 4];
    stream.read(&mut len_buf, Duration::from_secs(5))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read(&mut body, Duration::from_secs(5))?;
    Ok(BinaryCodec.decode_frame(&body).expect("loopback engine only ever sees its own well-formed frames"))
}

fn write_frame(stream: &impl ClientEndpoint, frame: &Frame) -> Result<(), connector_transport::TransportError> {
    let body = BinaryCodec.encode_frame(frame);
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    stream.write_all(&out, Duration::from_secs(5))
}

fn main() {
    tracing_subscriber::fmt::init();

    let dir = std::env::temp_dir().join(format!("connector-demo-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create demo endpoint directory");

    let mut config = ConnectorConfig::default();
    config.endpoint_dir = dir.clone();
    config.service_executable = std::path::PathBuf::from("yes");
    config.heartbeat_timeout = Duration::from_millis(500);

    let engine = spawn_loopback_engine(dir.clone(), config.connection_pipe.clone());

    let client = Client::new(config, Arc::new(LoggingAlertSink::default()));
    client.set_state_callback(Box::new(|from, to| {
        tracing::info!(?from, ?to, "client state changed");
    }));
    client.dispatcher().register(
        "Notify",
        Box::new(|message: &Message| {
            let detail = message.get_named("detail").and_then(Value::as_str).unwrap_or("");
            tracing::info!(detail, "received an async notification");
            DispatchOutcome::Done
        }),
        Box::new(|| tracing::debug!("Notify callback removed")),
    );

    client.start().expect("start");
    if !client.wait_for_startup(Duration::from_secs(5)) {
        tracing::error!("client never reached RUNNING");
        client.stop();
        let _ = engine.join();
        let _ = std::fs::remove_dir_all(&dir);
        return;
    }

    let response: EchoResponse = call(&client, &EchoRequest { nonce: 42 }, Duration::from_secs(1)).expect("echo call");
    tracing::info!(nonce = response.nonce, "echo call completed");

    Arc::new(LoggingAlertSink::default()).alert(Alert::Good("demo run complete".to_string()));

    std::thread::sleep(Duration::from_millis(200));
    client.stop();
    let _ = engine.join();
    let _ = std::fs::remove_dir_all(&dir);
}
