//! OTLP attribute conversion
//!
//! Converts protobuf `KeyValue` attributes into the JSON attribute map the
//! normalizer consumes, keeping arrays and key-value lists structured.

use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value};
use serde_json::Value as JsonValue;

use crate::domain::Attributes;

/// Convert a KeyValue slice into an attribute map.
///
/// Attributes without a value are skipped; later duplicates win.
pub fn key_values_to_attributes(attrs: &[KeyValue]) -> Attributes {
    attrs
        .iter()
        .filter_map(|kv| {
            kv.value
                .as_ref()
                .map(|v| (kv.key.clone(), any_value_to_json(v)))
        })
        .collect()
}

/// Convert AnyValue to its JSON representation.
pub fn any_value_to_json(value: &AnyValue) -> JsonValue {
    match &value.value {
        Some(any_value::Value::StringValue(s)) => JsonValue::String(s.clone()),
        Some(any_value::Value::BoolValue(b)) => JsonValue::Bool(*b),
        Some(any_value::Value::IntValue(i)) => JsonValue::from(*i),
        Some(any_value::Value::DoubleValue(d)) => serde_json::Number::from_f64(*d)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Some(any_value::Value::ArrayValue(arr)) => {
            JsonValue::Array(arr.values.iter().map(any_value_to_json).collect())
        }
        Some(any_value::Value::KvlistValue(kvlist)) => JsonValue::Object(
            kvlist
                .values
                .iter()
                .filter_map(|kv| {
                    kv.value
                        .as_ref()
                        .map(|v| (kv.key.clone(), any_value_to_json(v)))
                })
                .collect(),
        ),
        Some(any_value::Value::BytesValue(b)) => JsonValue::String(hex::encode(b)),
        None => JsonValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::{ArrayValue, KeyValueList};
    use serde_json::json;

    fn kv(key: &str, value: any_value::Value) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue { value: Some(value) }),
        }
    }

    #[test]
    fn test_scalar_conversion() {
        let attrs = key_values_to_attributes(&[
            kv("gen_ai.system", any_value::Value::StringValue("openai".into())),
            kv("gen_ai.usage.input_tokens", any_value::Value::IntValue(12)),
            kv("gen_ai.request.temperature", any_value::Value::DoubleValue(0.5)),
            kv("llm.is_streaming", any_value::Value::BoolValue(false)),
        ]);

        assert_eq!(attrs["gen_ai.system"], json!("openai"));
        assert_eq!(attrs["gen_ai.usage.input_tokens"], json!(12));
        assert_eq!(attrs["gen_ai.request.temperature"], json!(0.5));
        assert_eq!(attrs["llm.is_streaming"], json!(false));
    }

    #[test]
    fn test_nested_conversion() {
        let array = any_value::Value::ArrayValue(ArrayValue {
            values: vec![AnyValue {
                value: Some(any_value::Value::StringValue("stop".into())),
            }],
        });
        let kvlist = any_value::Value::KvlistValue(KeyValueList {
            values: vec![kv("id", any_value::Value::StringValue("call_1".into()))],
        });
        let bytes = any_value::Value::BytesValue(vec![0xde, 0xad]);

        let attrs = key_values_to_attributes(&[
            kv("gen_ai.response.finish_reasons", array),
            kv("tool", kvlist),
            kv("blob", bytes),
        ]);

        assert_eq!(attrs["gen_ai.response.finish_reasons"], json!(["stop"]));
        assert_eq!(attrs["tool"], json!({"id": "call_1"}));
        assert_eq!(attrs["blob"], json!("dead"));
    }

    #[test]
    fn test_missing_value_skipped() {
        let attrs = key_values_to_attributes(&[KeyValue {
            key: "empty".into(),
            value: None,
        }]);
        assert!(attrs.is_empty());
    }
}
