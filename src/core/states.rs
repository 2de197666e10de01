use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{self, RecvTimeoutError, Sender};
use crate::core::error::ServerError;
use crate::support::debug::{self, InfoLevel};

/// Messages the server control loop understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Terminate,
    Reload(String),
}

const REPLY_POLL: Duration = Duration::from_millis(100);

pub(crate) type Reply = Sender<Result<(), ServerError>>;

pub(crate) struct Envelope {
    pub(crate) message: ControlMessage,
    pub(crate) reply: Option<Reply>,
}

/// A cloneable handle for steering a running server from any thread.
#[derive(Clone)]
pub struct AsyncController {
    courier: Sender<Envelope>,
    closed: Arc<AtomicBool>,
}

impl AsyncController {
    /// Fire and forget. Fails once the control loop has stopped.
    pub fn send(&self, message: ControlMessage) -> Result<(), ServerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServerError::ControlClosed);
        }

        self.courier
            .send(Envelope { message, reply: None })
            .map_err(|_| ServerError::ControlClosed)
    }

    /// Deliver `message` and wait until the control loop has acted on it.
    pub(crate) fn request(&self, message: ControlMessage) -> Result<(), ServerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServerError::ControlClosed);
        }

        let (tx, rx) = channel::bounded(1);
        self.courier
            .send(Envelope { message, reply: Some(tx) })
            .map_err(|_| ServerError::ControlClosed)?;

        loop {
            match rx.recv_timeout(REPLY_POLL) {
                Ok(outcome) => return outcome,
                Err(RecvTimeoutError::Timeout) if !self.closed.load(Ordering::Acquire) => continue,
                Err(_) => return rx.try_recv().unwrap_or(Err(ServerError::ControlClosed)),
            }
        }
    }
}

pub(crate) struct ServerStates {
    running: AtomicBool,
    shutting_down: AtomicBool,
    closed: Arc<AtomicBool>,
    courier_channel: (channel::Sender<Envelope>, channel::Receiver<Envelope>),
}

impl ServerStates {
    pub(crate) fn new() -> Self {
        ServerStates {
            running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            courier_channel: channel::unbounded(),
        }
    }

    #[inline]
    pub(crate) fn get_courier(&self) -> AsyncController {
        AsyncController {
            courier: channel::Sender::clone(&self.courier_channel.0),
            closed: Arc::clone(&self.closed),
        }
    }

    /// Wait up to `timeout` for the next control message. `None` on timeout, or when every
    /// controller is gone.
    pub(crate) fn courier_recv(&self, timeout: Duration) -> Option<Envelope> {
        match self.courier_channel.1.recv_timeout(timeout) {
            Ok(envelope) => Some(envelope),
            Err(RecvTimeoutError::Timeout) => None,
            Err(err) => {
                debug::print(&format!("Control channel disconnected: {}", err), InfoLevel::Warning);
                None
            }
        }
    }

    /// Refuse further messages and answer the ones still queued.
    pub(crate) fn close_courier(&self) {
        self.closed.store(true, Ordering::Release);

        while let Ok(envelope) = self.courier_channel.1.try_recv() {
            if let Some(reply) = envelope.reply {
                let _ = reply.send(Err(ServerError::ControlClosed));
            }
        }
    }

    #[inline]
    pub(crate) fn toggle_running_state(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flip into shutdown. Only the first caller gets `true`.
    pub(crate) fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}
