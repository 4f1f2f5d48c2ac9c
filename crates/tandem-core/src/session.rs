use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tandem_models::gateway::{Envelope, FrameError};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// A serialized outbound frame. Encoded once and shared by every recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Arc<str>);

impl Frame {
    pub fn encode(envelope: &Envelope) -> Result<Self, FrameError> {
        Ok(Self(envelope.encode()?.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Frame {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why the server closed a session's queue. The writer turns this into a
/// WebSocket close frame once the queue is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    SlowConsumer,
    Shutdown,
    SessionLimit,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            Self::SlowConsumer => 1013,
            Self::Shutdown => 1001,
            Self::SessionLimit => 1008,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::SlowConsumer => "Gateway fell behind; reconnect required",
            Self::Shutdown => "Server shutting down",
            Self::SessionLimit => "Too many concurrent sessions for this user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    Full,
    Closed,
}

struct Outbound {
    sender: Option<mpsc::Sender<Frame>>,
    close_reason: Option<CloseReason>,
}

/// One live connection for one user.
///
/// The session owns the producing half of its bounded outbound queue; the
/// consuming half goes to the writer task, the only code allowed to touch the
/// socket sink. Closing the queue drops the sender, which lets the writer
/// drain what is left and then stop. An evicted slow consumer skips the
/// drain and only gets its close frame.
pub struct Session {
    id: Uuid,
    user_id: String,
    connected_at: DateTime<Utc>,
    outbound: Mutex<Outbound>,
    closed_notify: Notify,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            connected_at: Utc::now(),
            outbound: Mutex::new(Outbound {
                sender: Some(tx),
                close_reason: None,
            }),
            closed_notify: Notify::new(),
        });
        (session, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Non-blocking enqueue. `Closed` covers both a closed queue and a writer
    /// that has already gone away.
    pub fn enqueue(&self, frame: Frame) -> Result<(), EnqueueError> {
        let outbound = self.outbound.lock();
        let Some(sender) = outbound.sender.as_ref() else {
            return Err(EnqueueError::Closed);
        };
        sender.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Closes the outbound queue. Returns `true` only for the call that
    /// actually closed it; the reason of that call is the one kept.
    pub fn close_queue(&self, reason: Option<CloseReason>) -> bool {
        {
            let mut outbound = self.outbound.lock();
            if outbound.sender.take().is_none() {
                return false;
            }
            outbound.close_reason = reason;
        }
        self.closed_notify.notify_waiters();
        true
    }

    /// Resolves once the outbound queue has been closed, by whoever closed it.
    pub async fn queue_closed(&self) {
        let notified = self.closed_notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.lock().sender.is_none()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.outbound.lock().close_reason
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
