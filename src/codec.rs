//! Line codec: decodes input lines into envelopes and probes, and encodes outgoing envelopes as lines.
//!
//! Decoding is two-pass. [`decode_line`] reads the envelope with a schema-less body and independently probes the
//! body for its `type` and `msg_id`. [`resolve`] then commits to a concrete schema. A body whose type-specific
//! fields are malformed therefore still yields a probe, so the error reply can name the request it answers.

use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::DecodeError,
    message::{Body, Envelope, Inbound, Payload, Probe, Request},
};

/// A successfully decoded input line.
#[derive(Clone, Debug, PartialEq)]
pub struct Decoded {
    /// The envelope with its body left as raw JSON.
    pub envelope: Envelope<Value>,
    /// The body's type and inbound id.
    pub probe: Probe,
}

/// Decodes one input line (without its trailing newline) into an envelope and probe.
///
/// Any line that is not a JSON object with a `body` object carrying a string `type` fails with a
/// [`DecodeError`], which keeps whatever `src`, `dest` and `msg_id` could be recovered.
pub fn decode_line(line: &[u8]) -> Result<Decoded, DecodeError> {
    let value: Value = serde_json::from_slice(line).map_err(DecodeError::json)?;
    let (src, dest, msg_id) = salvage_addressing(&value);
    let with_addressing = |mut err: DecodeError| {
        err.src = src.clone();
        err.dest = dest.clone();
        err.msg_id = msg_id;
        err
    };

    let envelope = Envelope::<Value>::deserialize(value)
        .map_err(|err| with_addressing(DecodeError::json(err)))?;
    let probe = probe(&envelope.body).map_err(|err| with_addressing(DecodeError::json(err)))?;

    Ok(Decoded { envelope, probe })
}

/// Extracts the `type` and `msg_id` from a body without validating the rest of its schema.
///
/// A `msg_id` that is missing or not a non-negative integer probes as `None`.
pub fn probe(body: &Value) -> Result<Probe, serde_json::Error> {
    let Some(fields) = body.as_object() else {
        return Err(serde::de::Error::custom("message body is not an object"));
    };
    let Some(kind) = fields.get("type").and_then(Value::as_str) else {
        return Err(serde::de::Error::missing_field("type"));
    };

    Ok(Probe {
        kind: kind.to_string(),
        msg_id: fields.get("msg_id").and_then(Value::as_u64),
    })
}

/// Resolves a decoded line against the known schemas, producing the request a handler sees.
///
/// Types with a schema in [`Payload`] must decode fully; any other type is passed through as
/// [`Inbound::Unknown`].
pub fn resolve(decoded: Decoded) -> Result<Request, serde_json::Error> {
    let Decoded { envelope, probe } = decoded;
    let (in_reply_to, message) = if Payload::is_known(&probe.kind) {
        let body = Body::<Payload>::deserialize(envelope.body)?;
        (body.in_reply_to, Inbound::Known(body.payload))
    } else {
        let in_reply_to = envelope.body.get("in_reply_to").and_then(Value::as_u64);
        (in_reply_to, Inbound::Unknown(envelope.body))
    };

    Ok(Request {
        src: envelope.src,
        dest: envelope.dest,
        kind: probe.kind,
        msg_id: probe.msg_id,
        in_reply_to,
        message,
    })
}

/// Serializes an envelope as a single newline-terminated line.
pub fn encode_line(envelope: &Envelope<Body>) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(envelope)?;
    line.push(b'\n');
    Ok(line)
}

fn salvage_addressing(value: &Value) -> (Option<String>, Option<String>, Option<u64>) {
    let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);
    let msg_id = value
        .get("body")
        .and_then(|body| body.get("msg_id"))
        .and_then(Value::as_u64);
    (field("src"), field("dest"), msg_id)
}
