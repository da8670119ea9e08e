use crate::{describe_timeout, lock, BusError, Message};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Called by a transport for every inbound message that does not complete a
/// pending call.
pub type InboundHandler = Arc<dyn Fn(&Message) + Send + Sync>;

type ReplyCallback = Box<dyn FnOnce(Message) + Send>;

/// The platform transport a [`Connection`](crate::Connection) is built on.
///
/// Implementations stamp the serial number and sender on outgoing messages
/// and deliver replies to the [`PendingCall`] registered for their serial.
pub trait Transport: Send + Sync {
    /// Unique name assigned by the bus, or `None` on a peer-to-peer link.
    fn unique_name(&self) -> Option<String>;

    /// Queue a message for delivery and return its serial.
    fn send(&self, msg: Message) -> Result<u32, BusError>;

    /// Send a method call and return a handle that completes with the reply.
    fn send_with_reply(
        &self,
        msg: Message,
        timeout: Option<Duration>,
    ) -> Result<PendingCall, BusError>;

    /// Process traffic until `pending` completes or `timeout` expires.
    fn wait(&self, pending: &PendingCall, timeout: Option<Duration>) -> Result<(), BusError>;

    /// Install the callback that receives inbound messages.
    fn set_inbound_handler(&self, handler: InboundHandler);

    fn close(&self);

    /// The blocking round trip: send, wait, and return the reply message.
    fn send_with_reply_and_block(
        &self,
        msg: Message,
        timeout: Option<Duration>,
    ) -> Result<Message, BusError> {
        let pending = self.send_with_reply(msg, timeout)?;
        self.wait(&pending, timeout)?;
        pending
            .take_reply()
            .ok_or_else(|| BusError::NoReply(describe_timeout(timeout)))
    }
}

#[derive(Default)]
struct PendingState {
    reply: Option<Message>,
    callback: Option<ReplyCallback>,
    completed: bool,
    cancelled: bool,
}

/// A method call awaiting its reply. Clones share the same state.
#[derive(Clone)]
pub struct PendingCall {
    serial: u32,
    state: Arc<Mutex<PendingState>>,
}

impl PendingCall {
    pub fn new(serial: u32) -> Self {
        Self {
            serial,
            state: Arc::new(Mutex::new(PendingState::default())),
        }
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Run `f` with the reply. Runs immediately if the reply is already here.
    pub fn on_complete(&self, f: impl FnOnce(Message) + Send + 'static) {
        let reply = {
            let mut state = lock(&self.state);
            if state.cancelled {
                return;
            }
            match state.reply.take() {
                Some(reply) => reply,
                None => {
                    state.callback = Some(Box::new(f));
                    return;
                }
            }
        };
        f(reply);
    }

    /// Deliver the reply. Called by transports; later calls are ignored.
    pub fn complete(&self, reply: Message) {
        let callback = {
            let mut state = lock(&self.state);
            if state.cancelled || state.completed {
                return;
            }
            state.completed = true;
            match state.callback.take() {
                Some(callback) => callback,
                None => {
                    state.reply = Some(reply);
                    return;
                }
            }
        };
        callback(reply);
    }

    /// Abandon the call. A reply that arrives later is dropped.
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        state.cancelled = true;
        state.callback = None;
        state.reply = None;
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.state).cancelled
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.state).completed
    }

    /// Take the stored reply, if it arrived and no callback consumed it.
    pub fn take_reply(&self) -> Option<Message> {
        lock(&self.state).reply.take()
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("PendingCall")
            .field("serial", &self.serial)
            .field("completed", &state.completed)
            .field("cancelled", &state.cancelled)
            .finish_non_exhaustive()
    }
}
