//! Job fingerprints: the cache key of an invocation.

use std::collections::BTreeMap;

use cas::Sha1Hash;
use kvstore::canonical_json;
use serde_json::{json, Value};

use crate::spec::ProcessorSpec;

/// SHA-1 over the canonical JSON of the processor identity, parameters,
/// input content hashes and declared output slots.
pub fn compute_fingerprint(
    spec: &ProcessorSpec,
    parameters: &BTreeMap<String, Value>,
    input_hashes: &BTreeMap<String, Sha1Hash>,
) -> Sha1Hash {
    let inputs: BTreeMap<&str, &str> = input_hashes
        .iter()
        .map(|(slot, hash)| (slot.as_str(), hash.as_str()))
        .collect();
    let outputs: Vec<&str> = spec.outputs.iter().map(|s| s.name.as_str()).collect();

    let doc = json!({
        "processor_name": spec.name,
        "processor_version": spec.version,
        "parameters": parameters,
        "inputs": inputs,
        "outputs": outputs,
    });
    Sha1Hash::from_data(canonical_json(&doc).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ParamSpec, SlotSpec};

    fn spec(version: &str) -> ProcessorSpec {
        ProcessorSpec::new("count", version)
            .input(SlotSpec::required("raw"))
            .output(SlotSpec::required("out"))
            .parameter(ParamSpec::integer("a"))
            .parameter(ParamSpec::integer("b"))
    }

    fn params(a: i64, b: i64) -> BTreeMap<String, Value> {
        // Insert in opposite orders; BTreeMap and canonical JSON must agree.
        let mut p = BTreeMap::new();
        if a % 2 == 0 {
            p.insert("a".to_string(), json!(a));
            p.insert("b".to_string(), json!(b));
        } else {
            p.insert("b".to_string(), json!(b));
            p.insert("a".to_string(), json!(a));
        }
        p
    }

    fn inputs(data: &[u8]) -> BTreeMap<String, Sha1Hash> {
        BTreeMap::from([("raw".to_string(), Sha1Hash::from_data(data))])
    }

    #[test]
    fn test_stable() {
        let a = compute_fingerprint(&spec("1"), &params(1, 2), &inputs(b"x"));
        let b = compute_fingerprint(&spec("1"), &params(1, 2), &inputs(b"x"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_sensitive_to_each_component() {
        let base = compute_fingerprint(&spec("1"), &params(1, 2), &inputs(b"x"));
        assert_ne!(base, compute_fingerprint(&spec("2"), &params(1, 2), &inputs(b"x")));
        assert_ne!(base, compute_fingerprint(&spec("1"), &params(1, 3), &inputs(b"x")));
        assert_ne!(base, compute_fingerprint(&spec("1"), &params(1, 2), &inputs(b"y")));
    }
}
