//! Outbound queue for one connection
//!
//! Frames are queued on an unbounded channel and drained by a dedicated
//! writer task. The queue tracks how many bytes are waiting so broadcasts can
//! detect a slow consumer without blocking on it.

use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::frames::{truncate_close_reason, ErrorShape, EventFrame, ResponseFrame};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("connection writer has shut down")]
    Closed,
    #[error("frame serialization failed")]
    Serialize,
}

/// Sending half of a connection's outbound queue.
#[derive(Clone, Debug)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
    buffered: Arc<AtomicUsize>,
}

/// Receiving half, owned by the writer task.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
    buffered: Arc<AtomicUsize>,
}

fn message_len(msg: &Message) -> usize {
    match msg {
        Message::Text(text) => text.as_str().len(),
        Message::Binary(bytes) => bytes.len(),
        Message::Close(Some(frame)) => frame.reason.as_str().len() + 2,
        _ => 0,
    }
}

impl Outbound {
    pub fn channel() -> (Outbound, OutboundReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        (
            Outbound {
                tx,
                buffered: buffered.clone(),
            },
            OutboundReceiver { rx, buffered },
        )
    }

    fn send(&self, msg: Message) -> Result<(), SendError> {
        let len = message_len(&msg);
        self.buffered.fetch_add(len, Ordering::AcqRel);
        self.tx.send(msg).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            SendError::Closed
        })
    }

    /// Send a pre-serialized JSON string (broadcast paths serialize once).
    pub fn send_text(&self, text: String) -> Result<(), SendError> {
        self.send(Message::Text(text.into()))
    }

    pub fn send_json<T: Serialize>(&self, payload: &T) -> Result<(), SendError> {
        let text = serde_json::to_string(payload).map_err(|_| SendError::Serialize)?;
        self.send_text(text)
    }

    pub fn send_response(
        &self,
        id: &str,
        ok: bool,
        payload: Option<Value>,
        error: Option<ErrorShape>,
    ) -> Result<(), SendError> {
        self.send_json(&ResponseFrame {
            frame_type: "res",
            id,
            ok,
            payload,
            error,
        })
    }

    pub fn send_event(&self, frame: &EventFrame<'_>) -> Result<(), SendError> {
        self.send_json(frame)
    }

    pub fn send_close(&self, code: u16, reason: &str) -> Result<(), SendError> {
        self.send(Message::Close(Some(CloseFrame {
            code,
            reason: truncate_close_reason(reason).into(),
        })))
    }

    /// Bytes queued but not yet written to the socket.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl OutboundReceiver {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Non-blocking receive; test helper and drain path.
    pub fn try_recv(&mut self) -> Option<Message> {
        let msg = self.rx.try_recv().ok()?;
        self.mark_written(message_len(&msg));
        Some(msg)
    }

    fn mark_written(&self, len: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(len))
            });
    }
}

/// Spawn the writer task. It drains the queue into the socket sink and stops
/// after a close frame or the first write error.
pub fn spawn_writer<S>(mut sink: S, mut rx: OutboundReceiver) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            let len = message_len(&msg);
            let result = sink.send(msg).await;
            rx.mark_written(len);
            if result.is_err() || is_close {
                break;
            }
        }
        let _ = sink.close().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::PollSender;

    #[test]
    fn test_buffered_bytes_tracks_queue() {
        let (out, mut rx) = Outbound::channel();
        out.send_text("hello".to_string()).unwrap();
        out.send_text("world!".to_string()).unwrap();
        assert_eq!(out.buffered_bytes(), 11);

        rx.try_recv().unwrap();
        assert_eq!(out.buffered_bytes(), 6);
        rx.try_recv().unwrap();
        assert_eq!(out.buffered_bytes(), 0);
    }

    #[test]
    fn test_send_after_receiver_dropped_fails() {
        let (out, rx) = Outbound::channel();
        drop(rx);
        assert_eq!(out.send_text("x".to_string()), Err(SendError::Closed));
        assert!(out.is_closed());
        assert_eq!(out.buffered_bytes(), 0);
    }

    #[test]
    fn test_close_reason_truncated() {
        let (out, mut rx) = Outbound::channel();
        out.send_close(1008, &"x".repeat(500)).unwrap();
        match rx.try_recv() {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, 1008);
                assert_eq!(frame.reason.len(), 123);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test]
    fn test_response_frame_shape() {
        let (out, mut rx) = Outbound::channel();
        out.send_response("abc", true, Some(json!({ "x": 1 })), None)
            .unwrap();
        let Some(Message::Text(text)) = rx.try_recv() else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value, json!({ "type": "res", "id": "abc", "ok": true, "payload": { "x": 1 } }));
    }

    #[tokio::test]
    async fn test_writer_stops_after_close() {
        let (out, rx) = Outbound::channel();
        let (sink_tx, mut written) = mpsc::channel::<Message>(8);
        let writer = spawn_writer(PollSender::new(sink_tx), rx);

        out.send_text("one".to_string()).unwrap();
        out.send_close(1000, "bye").unwrap();
        writer.await.unwrap();

        assert!(matches!(written.recv().await, Some(Message::Text(_))));
        assert!(matches!(written.recv().await, Some(Message::Close(_))));
        assert_eq!(out.buffered_bytes(), 0);
        // Queue is dead once the writer exits.
        assert!(out.send_text("late".to_string()).is_err());
    }
}
