//! Fire-and-forget messages back to the HTTP server.
//!
//! The indexer never talks to a transport directly; it hands request and
//! response handles to the server's message loop and moves on.

use std::sync::mpsc;

use crate::request::{RequestHandle, ResponseHandle};

/// Message kinds the indexer sends to the server's dispatcher.
pub enum ServerMessage {
    /// Ask the transport to read more request body for a streaming client.
    RequestProceed {
        req: RequestHandle,
        res: ResponseHandle,
    },
    /// Emit the current response for a synchronous request.
    StreamResponse {
        req: RequestHandle,
        res: ResponseHandle,
    },
}

impl std::fmt::Debug for ServerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerMessage::RequestProceed { .. } => f.write_str("RequestProceed"),
            ServerMessage::StreamResponse { .. } => f.write_str("StreamResponse"),
        }
    }
}

/// Sink for server messages. Sends never block and may be dropped if the
/// server is shutting down.
pub trait MessageDispatcher: Send + Sync {
    fn send(&self, message: ServerMessage);
}

/// Dispatcher backed by a standard channel; the server end drains the
/// receiver on its own thread.
pub struct ChannelDispatcher {
    tx: mpsc::Sender<ServerMessage>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl MessageDispatcher for ChannelDispatcher {
    fn send(&self, message: ServerMessage) {
        // Receiver gone means the server already shut down.
        let _ = self.tx.send(message);
    }
}
