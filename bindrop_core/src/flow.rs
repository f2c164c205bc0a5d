//! Flow-controlled sender: the only writer of a session's stream.
//!
//! Bursts are queued FIFO and a single task writes them one message at a
//! time. A finished write is the idle signal that releases the next
//! message, so independently produced bursts never interleave on the wire.
//! If the peer goes away mid-burst the rest of the queue is dropped
//! silently; nothing is retried.

use crate::protocol::{Message, send_msg};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

struct Burst {
    messages: Vec<Message>,
    done: oneshot::Sender<bool>,
}

/// Resolves once a burst has been written (`true`) or dropped (`false`)
pub struct Delivery(oneshot::Receiver<bool>);

impl Delivery {
    pub async fn delivered(self) -> bool {
        self.0.await.unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct FlowSender {
    tx: mpsc::UnboundedSender<Burst>,
    pending: Arc<watch::Sender<usize>>,
}

impl FlowSender {
    /// Take ownership of the write half and start the writer task
    pub fn spawn<W>(writer: W, session: impl Into<String>) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0usize);
        let pending = Arc::new(pending);
        let handle = tokio::spawn(write_loop(writer, rx, pending.clone(), session.into()));
        (Self { tx, pending }, handle)
    }

    /// Queue an ordered burst behind everything already queued
    pub fn enqueue(&self, messages: Vec<Message>) -> Delivery {
        let (done, rx) = oneshot::channel();
        self.pending.send_modify(|n| *n += 1);
        if let Err(mpsc::error::SendError(burst)) = self.tx.send(Burst { messages, done }) {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            let _ = burst.done.send(false);
        }
        Delivery(rx)
    }

    pub fn send(&self, message: Message) -> Delivery {
        self.enqueue(vec![message])
    }

    /// Resolves when no burst is queued or being written
    pub async fn wait_idle(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Burst>,
    pending: Arc<watch::Sender<usize>>,
    session: String,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(burst) = rx.recv().await {
        let mut ok = true;
        for msg in &burst.messages {
            if let Err(e) = send_msg(&mut writer, msg).await {
                debug!(session = %session, kind = msg.name(), error = %e, "Write failed, dropping queue");
                ok = false;
                break;
            }
        }
        let _ = burst.done.send(ok);
        pending.send_modify(|n| *n = n.saturating_sub(1));

        if !ok {
            rx.close();
            while let Some(rest) = rx.recv().await {
                let _ = rest.done.send(false);
                pending.send_modify(|n| *n = n.saturating_sub(1));
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}
