use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::broker::RawRecord;
use crate::offset::{Envelope, Offset, UntypedEnvelope};

/// Header carrying the payload's declared type. Falls back to the top-level
/// `"type"` field of the JSON payload when absent.
pub const TYPE_HEADER: &str = "message-type";

/// Payload types that can flow through a typed pipeline. The tag is an
/// explicit discriminator compared by value; producers attach it to every
/// record of the type.
pub trait TypedPayload: DeserializeOwned + Send + 'static {
    const TYPE_TAG: &'static str;
}

/// Result of deserializing one raw record. A skipped record's offset must
/// still be acknowledged, or consumption would stall on it forever.
pub enum DecodeOutcome {
    Decoded(UntypedEnvelope),
    Skipped(Offset),
}

pub struct Deserializer;

impl Deserializer {
    /// Converts raw bytes into an untyped envelope. Malformed or untagged
    /// payloads are skipped, never fatal.
    pub fn decode(record: RawRecord) -> DecodeOutcome {
        let RawRecord {
            offset,
            payload,
            headers,
        } = record;

        let value: Value = match serde_json::from_slice(&payload) {
            Ok(value) => value,
            Err(e) => {
                debug!(
                    topic = %offset.topic,
                    partition = offset.partition,
                    offset = offset.offset,
                    "Skipping malformed payload: {}",
                    e
                );
                return DecodeOutcome::Skipped(offset);
            }
        };

        let type_tag = headers
            .get(TYPE_HEADER)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .map(str::to_owned)
            .or_else(|| value.get("type").and_then(Value::as_str).map(str::to_owned));

        match type_tag {
            Some(type_tag) => DecodeOutcome::Decoded(UntypedEnvelope {
                value,
                type_tag,
                offset,
            }),
            None => {
                debug!(
                    topic = %offset.topic,
                    partition = offset.partition,
                    offset = offset.offset,
                    "Skipping record without a type tag"
                );
                DecodeOutcome::Skipped(offset)
            }
        }
    }
}

/// Result of type-filtering one envelope.
pub enum FilterOutcome<T> {
    Matched(Envelope<T>),
    Skipped(Offset),
}

/// Routes envelopes by their type tag: matches go downstream for
/// processing, everything else is acknowledged and dropped. A shared topic
/// may carry several logical message types; this subscriber must still
/// advance its commit position past the ones it does not own.
pub struct TypeFilter<T> {
    _payload: PhantomData<fn() -> T>,
}

impl<T: TypedPayload> TypeFilter<T> {
    pub fn new() -> Self {
        Self {
            _payload: PhantomData,
        }
    }

    pub fn filter(&self, envelope: UntypedEnvelope) -> FilterOutcome<T> {
        if envelope.type_tag != T::TYPE_TAG {
            debug!(
                type_tag = %envelope.type_tag,
                expected = T::TYPE_TAG,
                "Skipping record of foreign type"
            );
            return FilterOutcome::Skipped(envelope.offset);
        }

        match serde_json::from_value::<T>(envelope.value) {
            Ok(payload) => FilterOutcome::Matched(Envelope {
                payload,
                offset: envelope.offset,
            }),
            Err(e) => {
                // tagged as ours but the shape does not decode; treat as malformed
                warn!(
                    type_tag = T::TYPE_TAG,
                    topic = %envelope.offset.topic,
                    partition = envelope.offset.partition,
                    offset = envelope.offset.offset,
                    "Skipping undecodable record: {}",
                    e
                );
                FilterOutcome::Skipped(envelope.offset)
            }
        }
    }
}

impl<T: TypedPayload> Default for TypeFilter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize, PartialEq)]
    struct UserCreated {
        user_id: u64,
    }

    impl TypedPayload for UserCreated {
        const TYPE_TAG: &'static str = "user-created";
    }

    fn record(payload: &str, header_tag: Option<&str>) -> RawRecord {
        let mut headers = HashMap::new();
        if let Some(tag) = header_tag {
            headers.insert(TYPE_HEADER.to_string(), tag.as_bytes().to_vec());
        }
        RawRecord {
            offset: Offset::new("events", 0, 42),
            payload: payload.as_bytes().to_vec(),
            headers,
        }
    }

    #[test]
    fn test_decode_takes_tag_from_header() {
        let outcome = Deserializer::decode(record(r#"{"user_id":7}"#, Some("user-created")));
        match outcome {
            DecodeOutcome::Decoded(envelope) => assert_eq!(envelope.type_tag, "user-created"),
            DecodeOutcome::Skipped(_) => panic!("expected a decoded envelope"),
        }
    }

    #[test]
    fn test_decode_falls_back_to_type_field() {
        let outcome = Deserializer::decode(record(r#"{"type":"user-created","user_id":7}"#, None));
        match outcome {
            DecodeOutcome::Decoded(envelope) => assert_eq!(envelope.type_tag, "user-created"),
            DecodeOutcome::Skipped(_) => panic!("expected a decoded envelope"),
        }
    }

    #[test]
    fn test_decode_skips_malformed_payload() {
        let outcome = Deserializer::decode(record("{not json", Some("user-created")));
        match outcome {
            DecodeOutcome::Skipped(offset) => assert_eq!(offset.offset, 42),
            DecodeOutcome::Decoded(_) => panic!("expected a skip"),
        }
    }

    #[test]
    fn test_decode_skips_untagged_payload() {
        let outcome = Deserializer::decode(record(r#"{"user_id":7}"#, None));
        assert!(matches!(outcome, DecodeOutcome::Skipped(_)));
    }

    #[test]
    fn test_filter_matches_expected_tag() {
        let filter = TypeFilter::<UserCreated>::new();
        let DecodeOutcome::Decoded(envelope) =
            Deserializer::decode(record(r#"{"user_id":7}"#, Some("user-created")))
        else {
            panic!("expected a decoded envelope");
        };

        match filter.filter(envelope) {
            FilterOutcome::Matched(envelope) => {
                assert_eq!(envelope.payload, UserCreated { user_id: 7 });
                assert_eq!(envelope.offset.offset, 42);
            }
            FilterOutcome::Skipped(_) => panic!("expected a match"),
        }
    }

    #[test]
    fn test_filter_skips_foreign_tag() {
        let filter = TypeFilter::<UserCreated>::new();
        let DecodeOutcome::Decoded(envelope) =
            Deserializer::decode(record(r#"{"user_id":7}"#, Some("order-placed")))
        else {
            panic!("expected a decoded envelope");
        };

        assert!(matches!(filter.filter(envelope), FilterOutcome::Skipped(_)));
    }

    #[test]
    fn test_filter_skips_matching_tag_with_wrong_shape() {
        let filter = TypeFilter::<UserCreated>::new();
        let DecodeOutcome::Decoded(envelope) =
            Deserializer::decode(record(r#"{"name":"no id"}"#, Some("user-created")))
        else {
            panic!("expected a decoded envelope");
        };

        assert!(matches!(filter.filter(envelope), FilterOutcome::Skipped(_)));
    }
}
