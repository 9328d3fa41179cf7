//! Parameter fingerprints: SHA-256 over the canonical JSON form of a
//! parameter list, so equal inputs hash equally whatever their order.

use hex::ToHex;
use sha2::Digest;

use crate::Params;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

/// Object keys sorted at every level.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Array(values) => {
            serde_json::Value::Array(values.iter().map(canonicalize).collect())
        }
        serde_json::Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

pub fn canonical_json_bytes(value: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&canonicalize(value)).unwrap_or_else(|_| b"null".to_vec())
}

/// Stable digest of parameter values. Lets logs correlate two calls with the
/// same input without ever printing the input.
pub fn fingerprint_params(params: &Params) -> String {
    sha256_hex(&canonical_json_bytes(&params.to_json()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scalar;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = serde_json::json!({"idUser": 1, "filter": {"priority": 2, "completed": true}});

        assert_eq!(
            String::from_utf8(canonical_json_bytes(&value)).expect("canonical json is utf-8"),
            r#"{"filter":{"completed":true,"priority":2},"idUser":1}"#
        );
    }

    #[test]
    fn sha256_hex_is_lowercase() {
        let h = sha256_hex(b"abc");
        assert_eq!(h.len(), 64);
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn fingerprint_ignores_insertion_order_but_not_values() {
        let a = Params::new()
            .with("title", "Buy milk")
            .with("priority", 1_i64);
        let b = Params::new()
            .with("priority", 1_i64)
            .with("title", "Buy milk");
        let c = Params::new()
            .with("title", "Buy milk")
            .with("priority", Scalar::Null);

        assert_eq!(fingerprint_params(&a), fingerprint_params(&b));
        assert_ne!(fingerprint_params(&a), fingerprint_params(&c));
        assert!(!fingerprint_params(&a).contains("milk"));
    }
}
