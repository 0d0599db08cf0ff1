//! Outbound send queue
//!
//! Sends issued while the session is not live wait here until the shard
//! enters RUNNING (transmitted in order) or the socket is closed (rejected).

use crate::error::GatewayError;
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// Completion handle for a send
pub(crate) type SendAck = oneshot::Sender<Result<(), GatewayError>>;

pub(crate) struct QueuedSend {
    pub(crate) text: String,
    pub(crate) op: u8,
    pub(crate) done: SendAck,
}

#[derive(Default)]
pub(crate) struct SendQueue {
    items: VecDeque<QueuedSend>,
}

impl SendQueue {
    pub(crate) fn push(&mut self, text: String, op: u8) -> oneshot::Receiver<Result<(), GatewayError>> {
        let (done, rx) = oneshot::channel();
        self.items.push_back(QueuedSend { text, op, done });
        rx
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Take every queued send, oldest first.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = QueuedSend> + '_ {
        self.items.drain(..)
    }

    /// Reject every queued send with a force-flush error.
    pub(crate) fn reject_all(&mut self, shard_id: u32) -> usize {
        let rejected = self.items.len();
        for item in self.items.drain(..) {
            // Caller may have stopped waiting
            let _ = item
                .done
                .send(Err(GatewayError::QueueForceFlushed { shard_id }));
        }
        rejected
    }
}
