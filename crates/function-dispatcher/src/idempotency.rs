//! Idempotency key derivation (spec §4.7): `(session id, turn number,
//! function name, SHA-256 of canonicalized slot map)`. Retries of the
//! same dispatch attempt reuse the same key.

use sha2::{Digest, Sha256};
use turnflow_core::id::{SessionId, TurnNumber};

/// Derive a stable idempotency key.
pub fn derive(session: &SessionId, turn: TurnNumber, function_name: &str, slots: &serde_json::Value) -> String {
    let canonical = canonicalize(slots);
    let mut hasher = Sha256::new();
    hasher.update(session.as_str().as_bytes());
    hasher.update(turn.to_string().as_bytes());
    hasher.update(function_name.as_bytes());
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Canonicalize a JSON value: object keys sorted, recursively.
fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let entries: Vec<String> =
                keys.into_iter().map(|k| format!("{:?}:{}", k, canonicalize(&map[k]))).collect();
            format!("{{{}}}", entries.join(","))
        }
        serde_json::Value::Array(items) => {
            let entries: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", entries.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_regardless_of_object_key_order() {
        let a = serde_json::json!({"departure_city": "北京", "arrival_city": "上海"});
        let b = serde_json::json!({"arrival_city": "上海", "departure_city": "北京"});
        let session = SessionId::new("s1");
        let k1 = derive(&session, TurnNumber(1), "book_flight", &a);
        let k2 = derive(&session, TurnNumber(1), "book_flight", &b);
        assert_eq!(k1, k2);
    }

    #[test]
    fn key_changes_with_turn_number() {
        let session = SessionId::new("s1");
        let slots = serde_json::json!({"a": 1});
        let k1 = derive(&session, TurnNumber(1), "book_flight", &slots);
        let k2 = derive(&session, TurnNumber(2), "book_flight", &slots);
        assert_ne!(k1, k2);
    }
}
