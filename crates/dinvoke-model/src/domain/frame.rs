use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CorrelationId, ModelError, Payload};

/// Envelope carrying a correlation id and a payload.
///
/// Frames are immutable once built: the only way to obtain one is [`Frame::wrap`] (fresh id,
/// used for requests) or [`Frame::with_id`] (caller-provided id, used for replies).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame<P> {
    id: CorrelationId,
    payload: P,
}

impl<P> Frame<P> {
    /// Wrap `payload` into a frame with a newly minted id.
    pub fn wrap(payload: P) -> Self {
        Self {
            id: CorrelationId::new(),
            payload,
        }
    }

    /// Wrap `payload` into a frame reusing `id`, so the peer can correlate the reply.
    pub fn with_id(payload: P, id: CorrelationId) -> Self {
        Self { id, payload }
    }

    #[inline]
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    #[inline]
    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_parts(self) -> (CorrelationId, P) {
        (self.id, self.payload)
    }
}

#[derive(Deserialize)]
struct Envelope {
    id: CorrelationId,
    payload: Value,
}

impl Frame<Payload> {
    /// Reconstruct a frame from a self-describing JSON document.
    ///
    /// Decoding happens in two stages so the caller can tell the failure modes apart:
    /// a document without the `{id, payload}` envelope is [`ModelError::NotAFrame`],
    /// an envelope whose payload the reader does not understand is [`ModelError::UnknownPayload`]
    /// (the id is still reported so the request can be answered).
    pub fn decode(value: Value) -> Result<Self, ModelError> {
        let envelope: Envelope =
            serde_json::from_value(value).map_err(|e| ModelError::NotAFrame(e.to_string()))?;

        match serde_json::from_value::<Payload>(envelope.payload) {
            Ok(payload) => Ok(Frame::with_id(payload, envelope.id)),
            Err(e) => Err(ModelError::UnknownPayload {
                id: envelope.id,
                reason: e.to_string(),
            }),
        }
    }
}
