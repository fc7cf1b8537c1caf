//! Envelope codec: wraps `{body, headers}` into a single broker payload and
//! unwraps on delivery.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WrapError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
}

/// On-wire shape. Field names are capitalized to match the historical
/// `{"Body": ..., "Headers": ...}` envelope format exactly.
#[derive(Debug, Serialize, Deserialize, Default)]
struct WireEnvelope {
    #[serde(rename = "Body", with = "base64_bytes")]
    body: Vec<u8>,
    #[serde(rename = "Headers", default, with = "base64_header_map")]
    headers: HashMap<String, Vec<u8>>,
}

mod base64_bytes {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod base64_header_map {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        headers: &HashMap<String, Vec<u8>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = s.serialize_map(Some(headers.len()))?;
        for (k, v) in headers {
            map.serialize_entry(k, &STANDARD.encode(v))?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<HashMap<String, Vec<u8>>, D::Error> {
        let raw: HashMap<String, String> = Option::deserialize(d)?.unwrap_or_default();
        raw.into_iter()
            .map(|(k, v)| {
                STANDARD
                    .decode(v.as_bytes())
                    .map(|decoded| (k, decoded))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// Codec contract for the envelope that rides inside every broker payload.
pub trait Wrapper: Send + Sync {
    fn wrap(&self, body: &[u8], headers: &HashMap<String, Vec<u8>>) -> Result<Vec<u8>, WrapError>;
    fn unwrap(&self, message: &[u8]) -> Result<(Vec<u8>, HashMap<String, Vec<u8>>), DecodeError>;
}

/// Default, and only, production `Wrapper`: compact JSON with base64 byte fields.
#[derive(Default, Clone, Copy)]
pub struct JsonWrapper;

impl Wrapper for JsonWrapper {
    fn wrap(&self, body: &[u8], headers: &HashMap<String, Vec<u8>>) -> Result<Vec<u8>, WrapError> {
        let envelope = WireEnvelope { body: body.to_vec(), headers: headers.clone() };
        serde_json::to_vec(&envelope).map_err(WrapError::Encode)
    }

    fn unwrap(&self, message: &[u8]) -> Result<(Vec<u8>, HashMap<String, Vec<u8>>), DecodeError> {
        let envelope: WireEnvelope = serde_json::from_slice(message).map_err(DecodeError::Decode)?;
        Ok((envelope.body, envelope.headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &[u8])]) -> HashMap<String, Vec<u8>> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_vec())).collect()
    }

    #[test]
    fn round_trips_body_and_headers() {
        let w = JsonWrapper;
        let h = headers(&[("x-tenant-id", b"A"), ("x-other", b"B")]);
        let wrapped = w.wrap(b"hello", &h).unwrap();
        let (body, out_headers) = w.unwrap(&wrapped).unwrap();
        assert_eq!(body, b"hello");
        assert_eq!(out_headers, h);
    }

    #[test]
    fn round_trips_empty_body_and_headers() {
        let w = JsonWrapper;
        let wrapped = w.wrap(b"", &HashMap::new()).unwrap();
        let (body, out_headers) = w.unwrap(&wrapped).unwrap();
        assert_eq!(body, Vec::<u8>::new());
        assert!(out_headers.is_empty());
    }

    #[test]
    fn missing_headers_field_decodes_as_empty_map() {
        let w = JsonWrapper;
        let raw = serde_json::json!({ "Body": STANDARD.encode(b"hi") });
        let (body, headers) = w.unwrap(raw.to_string().as_bytes()).unwrap();
        assert_eq!(body, b"hi");
        assert!(headers.is_empty());
    }

    #[test]
    fn malformed_input_is_a_decode_error() {
        let w = JsonWrapper;
        assert!(w.unwrap(b"not json").is_err());
    }

    #[test]
    fn wire_shape_uses_capitalized_field_names() {
        let w = JsonWrapper;
        let wrapped = w.wrap(b"x", &HashMap::new()).unwrap();
        let text = String::from_utf8(wrapped).unwrap();
        assert!(text.contains("\"Body\""));
        assert!(text.contains("\"Headers\""));
    }
}
