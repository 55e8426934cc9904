use crate::protocol::{Outbound, ProtocolError, Request};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireCodec {
    Json,
    Msgpack,
}

/// Decodes a request, trying MessagePack before JSON.
pub fn decode_request(bytes: &[u8]) -> Result<(Request, WireCodec), ProtocolError> {
    if let Ok(request) = rmp_serde::from_slice::<Request>(bytes) {
        return Ok((request, WireCodec::Msgpack));
    }
    let request = serde_json::from_slice::<Request>(bytes)
        .map_err(|err| ProtocolError::Decode(err.to_string()))?;
    Ok((request, WireCodec::Json))
}

pub fn encode_outbound(message: &Outbound, wire: WireCodec) -> Result<Vec<u8>, ProtocolError> {
    match wire {
        WireCodec::Msgpack => {
            rmp_serde::to_vec_named(message).map_err(|err| ProtocolError::Encode(err.to_string()))
        }
        WireCodec::Json => {
            serde_json::to_vec(message).map_err(|err| ProtocolError::Encode(err.to_string()))
        }
    }
}
