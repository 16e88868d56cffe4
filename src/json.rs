use serde_json::Value;

const FLOAT_PRECISION: f64 = 1e6;

/// Rounds every float in the tree to six decimal places and leaves other
/// scalars untouched. Applied before canonical serialisation so equal inputs
/// produce byte-identical documents.
pub fn round_numbers(value: Value) -> Value {
    match value {
        Value::Number(number) => {
            if let Some(f) = number.as_f64() {
                if number.is_f64() {
                    let rounded = (f * FLOAT_PRECISION).round() / FLOAT_PRECISION;
                    return serde_json::Number::from_f64(rounded)
                        .map(Value::Number)
                        .unwrap_or(Value::Null);
                }
            }
            Value::Number(number)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(round_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, round_numbers(value)))
                .collect(),
        ),
        other => other,
    }
}

/// Serialises a JSON value with object keys sorted at every level. This is
/// the byte representation hashed by the content-addressed store, so the
/// writer must not depend on map insertion order.
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

pub fn to_canonical_bytes(value: &Value) -> Vec<u8> {
    to_canonical_string(value).into_bytes()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("string serialisation is infallible"))
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(key).expect("string serialisation is infallible"),
                );
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_output_is_key_order_independent() {
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let mut b = serde_json::Map::new();
        b.insert("a".to_string(), json!({"c": 3, "d": 2}));
        b.insert("b".to_string(), json!(1));
        assert_eq!(
            to_canonical_string(&a),
            to_canonical_string(&Value::Object(b))
        );
    }

    #[test]
    fn floats_round_to_six_places() {
        let value = round_numbers(json!({"x": 0.123456789, "n": 7}));
        assert_eq!(value["x"].as_f64().unwrap(), 0.123457);
        assert_eq!(value["n"].as_i64().unwrap(), 7);
    }

    #[test]
    fn canonical_round_trip_preserves_value() {
        let doc = round_numbers(json!({
            "plot_id": "plot-1",
            "scores": [0.25, 0.5],
            "nested": {"z": null, "a": true}
        }));
        let bytes = to_canonical_bytes(&doc);
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, doc);
        assert_eq!(to_canonical_bytes(&parsed), bytes);
    }
}
