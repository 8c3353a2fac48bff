//! Listener façade: per-transport drivers that feed bytes to a decoder
//! session and forward every decoded message to the dispatcher.
//!
//! A listener is created `(protocol, port, mode, decoder, opaque)` per
//! spec.md §4.1. This module holds the transport-independent contract —
//! [`ConnectionDriver`] — and [`tcp`], [`udp`], [`http`] hold the
//! transport-specific accept loops.

pub mod http;
pub mod tcp;
pub mod udp;

use tokio::task::JoinHandle;

use crate::decoder::{ConnMeta, Decoder, DecoderSession};
use crate::dispatch::Dispatcher;
use crate::error::ListenerError;

/// A running listener: the port it's bound to and the task driving its
/// accept loop. Dropping or aborting the handle stops the listener —
/// reload-by-port-diff (spec.md §4.1) is built on this.
pub struct ListenerHandle {
    pub port: u16,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn new(port: u16, task: JoinHandle<()>) -> Self {
        ListenerHandle { port, task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

/// Drives one connection (or, for UDP, one socket's datagram stream)
/// through a decoder session: accumulates bytes for non-streaming
/// decoders, forwards chunks immediately for streaming ones, and dispatches
/// every produced message as soon as it is available.
pub struct ConnectionDriver {
    session: Box<dyn DecoderSession>,
    streaming: bool,
    buffer: Vec<u8>,
    max_buffer: usize,
}

impl ConnectionDriver {
    pub fn new(decoder: &dyn Decoder, meta: &ConnMeta, max_buffer: usize) -> Result<Self, ListenerError> {
        let session = decoder.new_session(meta)?;
        Ok(ConnectionDriver {
            session,
            streaming: decoder.supports_streaming(),
            buffer: Vec::new(),
            max_buffer,
        })
    }

    /// Feed one chunk of incoming bytes. For streaming decoders this calls
    /// through immediately; for batch decoders it grows an internal buffer
    /// (spec.md §4.1's "double-on-overflow" growing buffer, realized here
    /// as `Vec::extend_from_slice`, which already amortizes growth) bounded
    /// by `max_buffer` (the listener's `connection_memory_limit`).
    pub async fn feed(&mut self, bytes: &[u8], dispatcher: &Dispatcher) -> Result<(), ListenerError> {
        if self.streaming {
            let messages = self.session.on_chunk(bytes)?;
            dispatcher.dispatch_all(messages).await;
            return Ok(());
        }
        if self.buffer.len() + bytes.len() > self.max_buffer {
            return Err(ListenerError::ConnectionMemoryLimitExceeded);
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// End of request/connection: for batch decoders, this is where the
    /// whole accumulated body is finally handed to the decoder exactly
    /// once; for streaming decoders, this signals end-of-stream with an
    /// empty buffer so the session can drain trailing state.
    pub async fn finish(mut self, dispatcher: &Dispatcher) -> Result<(), ListenerError> {
        let messages = if self.streaming {
            self.session.on_end()?
        } else {
            let body = std::mem::take(&mut self.buffer);
            self.session.on_chunk(&body)?
        };
        dispatcher.dispatch_all(messages).await;
        Ok(())
    }
}

/// Returns `true` if `ip` matches any blacklist entry (exact string match —
/// spec.md's blacklist is a flat list of addresses, not CIDR ranges).
pub fn is_blacklisted(ip: &str, blacklist: &[String]) -> bool {
    blacklist.iter().any(|entry| entry == ip)
}

pub struct Listeners {
    handles: Vec<ListenerHandle>,
}

impl Default for Listeners {
    fn default() -> Self {
        Listeners { handles: Vec::new() }
    }
}

impl Listeners {
    pub fn push(&mut self, handle: ListenerHandle) {
        self.handles.push(handle);
    }

    /// Reload-by-port-diff (spec.md §4.1): stop every currently running
    /// listener whose port is not in `keep_ports`. The listener socket/task
    /// for a kept port is never recreated — only its decoder's reloadable
    /// state (registries, stream tables, offset parameters) is swapped in
    /// place via the decoder's own `reload` hook, driven from `main.rs`.
    pub fn retain_ports(&mut self, keep_ports: &[u16]) {
        let (keep, stale): (Vec<ListenerHandle>, Vec<ListenerHandle>) = std::mem::take(&mut self.handles)
            .into_iter()
            .partition(|h| keep_ports.contains(&h.port));
        for handle in &stale {
            handle.stop();
        }
        self.handles = keep;
    }

    pub fn has_port(&self, port: u16) -> bool {
        self.handles.iter().any(|h| h.port == port)
    }

    pub fn stop_all(&mut self) {
        for handle in &self.handles {
            handle.stop();
        }
        self.handles.clear();
    }
}
