//! Shared decoder contract.
//!
//! A `Decoder` is the Rust realization of the spec's vtable-of-capabilities
//! (spec.md §9): one value per `decode_as` kind, created per listener with
//! that listener's opaque config (its per-listener enrichment object).
//! `new_session` starts a per-connection `DecoderSession`; whether the
//! listener feeds it one whole-body chunk or many partial chunks is
//! governed by `Decoder::supports_streaming`.

pub mod mse;
pub mod meraki;
pub mod zz;

use crate::error::DecodeError;

/// Per-connection metadata the listener façade hands to every decoder
/// invocation (spec.md §4.1).
#[derive(Debug, Clone, Default)]
pub struct ConnMeta {
    pub client_ip: String,
    pub topic: Option<String>,
    pub sensor_uuid: Option<String>,
}

/// One message ready to be handed to the topic/partitioner layer: the
/// resolved topic name, the serialized JSON payload, and an optional raw
/// partition key (already extracted/derived — e.g. a MAC address string).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub partition_key: Option<Vec<u8>>,
}

/// A decoder "kind": produces sessions for incoming connections/requests.
pub trait Decoder: Send + Sync {
    /// Whether the listener may call a session's `on_chunk` repeatedly
    /// with partial buffers (streaming) or must accumulate the whole
    /// request body and call it exactly once (batch).
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Start a new per-connection session. May fail immediately for
    /// decoders that authorize at connection start (ZZ: unknown topic/
    /// sensor UUID).
    fn new_session(&self, meta: &ConnMeta) -> Result<Box<dyn DecoderSession>, DecodeError>;
}

/// Per-connection decoder state.
pub trait DecoderSession: Send {
    /// Feed one chunk of bytes (the whole body, for non-streaming
    /// decoders). Returns zero or more messages ready to publish.
    fn on_chunk(&mut self, bytes: &[u8]) -> Result<Vec<DecodedMessage>, DecodeError>;

    /// Called once with an empty buffer at end-of-stream. Default no-op;
    /// streaming decoders override to drain trailing state.
    fn on_end(&mut self) -> Result<Vec<DecodedMessage>, DecodeError> {
        Ok(Vec::new())
    }
}

/// `dumb` decode_as: forwards the whole body unchanged to the listener's
/// default topic, no enrichment, no parsing. Used for smoke-testing a
/// listener wiring and as the config default.
pub struct DumbDecoder {
    pub topic: String,
}

impl Decoder for DumbDecoder {
    fn new_session(&self, _meta: &ConnMeta) -> Result<Box<dyn DecoderSession>, DecodeError> {
        Ok(Box::new(DumbSession {
            topic: self.topic.clone(),
        }))
    }
}

struct DumbSession {
    topic: String,
}

impl DecoderSession for DumbSession {
    fn on_chunk(&mut self, bytes: &[u8]) -> Result<Vec<DecodedMessage>, DecodeError> {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![DecodedMessage {
            topic: self.topic.clone(),
            payload: bytes.to_vec(),
            partition_key: None,
        }])
    }
}
