//! Request builder (spec §4.7): a thin, typed surface over an acquired
//! slot and a sent frame. The builder owns the decoded reply until it is
//! consumed or detached.

use std::sync::Arc;
use std::time::Duration;

use connector_wire::{Frame, Message};

use crate::client::Client;
use crate::error::ConnectorError;
use crate::sync_calls::SlotHandle;

/// Marshals a request value into the wire [`Message`] it is sent as.
pub trait WireRequest {
    fn to_message(&self) -> Message;
}

/// Unmarshals a reply [`Message`] into a typed response.
pub trait WireResponse: Sized {
    fn from_message(message: Message) -> Result<Self, ConnectorError>;
}

/// One in-flight (or already-replied) synchronous call.
///
/// `send()` acquires a slot and writes the request frame; `recv(timeout)`
/// blocks for the reply and decodes it; `detach()` hands the decoded value
/// back to the caller instead of the builder dropping it. Dropping a
/// builder that was never `recv`'d simply releases its slot — there is no
/// reply to discard since nothing has arrived yet.
pub struct RequestBuilder<Resp> {
    client: Arc<Client>,
    slot: Option<SlotHandle>,
    _response: std::marker::PhantomData<Resp>,
}

impl<Resp: WireResponse> RequestBuilder<Resp> {
    pub fn new(client: Arc<Client>) -> Self {
        Self {
            client,
            slot: None,
            _response: std::marker::PhantomData,
        }
    }

    /// Marshals `request`, acquires a slot, and writes the frame. Returns
    /// the distinct `not-connected` error (spec §4.7) when the client
    /// isn't RUNNING rather than attempting the send.
    pub fn send(&mut self, request: &impl WireRequest, deadline: Duration) -> Result<(), ConnectorError> {
        if !self.client.is_running() {
            return Err(ConnectorError::NotConnected);
        }
        if self.slot.is_some() {
            return Err(ConnectorError::AlreadyPending);
        }
        let slot = self.client.sync_table().acquire()?;
        let frame = Frame::reply(slot.handle() as i32, request.to_message());
        if let Err(e) = self.client.send_frame(&frame, deadline) {
            return Err(e);
        }
        self.slot = Some(slot);
        Ok(())
    }

    /// Blocks up to `timeout` (default `2 × send-timeout` via
    /// [`Client::effective_call_timeout`]) for the reply and decodes it.
    pub fn recv(&mut self, timeout: Duration) -> Result<Resp, ConnectorError> {
        let slot = self.slot.take().ok_or(ConnectorError::SlotInvalid)?;
        let message = self.client.sync_table().wait(&slot, timeout, self.client.is_running())?;
        Resp::from_message(message)
    }

    /// Releases the slot early without waiting for a reply.
    pub fn detach(mut self) {
        self.slot.take();
    }
}

/// Sends `request` and waits for its reply using the client's default
/// timeout, retrying once via [`Client::wait_for_startup`] if the client
/// is not yet RUNNING.
pub fn call<Resp: WireResponse>(
    client: &Arc<Client>,
    request: &impl WireRequest,
    startup_wait: Duration,
) -> Result<Resp, ConnectorError> {
    let mut builder = RequestBuilder::new(Arc::clone(client));
    let timeout = client.effective_call_timeout();
    match builder.send(request, timeout) {
        Err(ConnectorError::NotConnected) => {
            if !client.wait_for_startup(startup_wait) {
                return Err(ConnectorError::NotConnected);
            }
            builder.send(request, timeout)?;
        }
        Err(e) => return Err(e),
        Ok(()) => {}
    }
    builder.recv(timeout)
}
