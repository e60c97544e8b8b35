//! The serialization boundary.
//!
//! Payloads cross the transport as UTF-8 JSON by default; both directions can
//! be overridden with hooks. Decoding never fails outward: a payload the
//! configured decoder cannot handle is delivered as [`Payload::Raw`] so one
//! malformed message cannot crash any consumer. That fallback is inherited
//! behavior, preserved as-is.

use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

/// Error type for user-supplied hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Custom encoder applied by `publish` in place of JSON encoding.
pub type Serializer = Arc<dyn Fn(&Value) -> Result<Vec<u8>, HookError> + Send + Sync>;

/// Custom decoder applied at dispatch in place of JSON decoding.
///
/// Mutually exclusive with [`Reviver`].
pub type Deserializer =
    Arc<dyn Fn(&[u8], DecodeContext<'_>) -> Result<Value, HookError> + Send + Sync>;

/// Post-parse transform applied to every decoded JSON node, bottom-up.
///
/// Called with the member key (object key, array index as a string, or `""`
/// for the root) and the already-revived node, mirroring the `JSON.parse`
/// reviver convention. Mutually exclusive with [`Deserializer`].
pub type Reviver = Arc<dyn Fn(&str, Value) -> Value + Send + Sync>;

/// Context handed to the decode hook.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    /// The concrete channel the payload arrived on.
    pub channel: &'a str,
    /// The matching pattern, for pattern subscriptions.
    pub pattern: Option<&'a str>,
}

/// A decoded payload as delivered to consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A successfully decoded value.
    Value(Value),
    /// The raw bytes of a payload the decoder could not handle.
    Raw(Bytes),
}

impl Payload {
    /// The decoded value, if decoding succeeded.
    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    /// The raw bytes, if decoding fell back.
    #[must_use]
    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Self::Value(_) => None,
            Self::Raw(raw) => Some(raw),
        }
    }
}

/// Encode/decode pair used by publish and by message dispatch.
#[derive(Clone, Default)]
pub struct PayloadCodec {
    serializer: Option<Serializer>,
    deserializer: Option<Deserializer>,
    reviver: Option<Reviver>,
}

impl PayloadCodec {
    pub(crate) fn new(
        serializer: Option<Serializer>,
        deserializer: Option<Deserializer>,
        reviver: Option<Reviver>,
    ) -> Self {
        Self {
            serializer,
            deserializer,
            reviver,
        }
    }

    /// Encode a value for the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the serializer hook or JSON encoding fails.
    pub fn encode(&self, value: &Value) -> Result<Bytes, HookError> {
        let bytes = match &self.serializer {
            Some(serializer) => serializer(value)?,
            None => serde_json::to_vec(value)?,
        };
        Ok(Bytes::from(bytes))
    }

    /// Decode raw bytes from the wire.
    ///
    /// Never fails: on any decode error the raw bytes are delivered
    /// unmodified.
    pub fn decode(&self, raw: &Bytes, context: DecodeContext<'_>) -> Payload {
        let decoded = match &self.deserializer {
            Some(deserializer) => deserializer(raw, context),
            None => serde_json::from_slice::<Value>(raw)
                .map(|value| match &self.reviver {
                    Some(reviver) => revive("", value, reviver.as_ref()),
                    None => value,
                })
                .map_err(Into::into),
        };

        match decoded {
            Ok(value) => Payload::Value(value),
            Err(err) => {
                trace!(channel = %context.channel, error = %err, "Decode failed, delivering raw bytes");
                Payload::Raw(raw.clone())
            }
        }
    }
}

fn revive(key: &str, value: Value, f: &(dyn Fn(&str, Value) -> Value + Send + Sync)) -> Value {
    let value = match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let v = revive(&k, v, f);
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| revive(&i.to_string(), v, f))
                .collect(),
        ),
        other => other,
    };
    f(key, value)
}
