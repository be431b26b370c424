//! Stable fingerprint over the essential invocation inputs.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde_json::Value;

/// Hashes `(task, instruction, ordered context)` into a hex fingerprint.
///
/// The context map is iterated in key order, so two inputs with the same
/// entries always fingerprint identically regardless of construction
/// order. Stable within a process, which is the scope of the in-memory
/// cache.
pub fn fingerprint(task: &str, instruction: Option<&str>, context: &BTreeMap<String, Value>) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    task.hash(&mut hasher);
    0xffu8.hash(&mut hasher);
    instruction.unwrap_or_default().hash(&mut hasher);
    0xffu8.hash(&mut hasher);
    for (key, value) in context {
        key.hash(&mut hasher);
        0xfeu8.hash(&mut hasher);
        value.to_string().hash(&mut hasher);
        0xffu8.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_inputs_fingerprint_identically() {
        let ctx = BTreeMap::from([
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!("two")),
        ]);
        assert_eq!(
            fingerprint("task", Some("instr"), &ctx),
            fingerprint("task", Some("instr"), &ctx)
        );
    }

    #[test]
    fn context_insertion_order_does_not_matter() {
        let mut left = BTreeMap::new();
        left.insert("z".to_string(), json!(1));
        left.insert("a".to_string(), json!(2));
        let mut right = BTreeMap::new();
        right.insert("a".to_string(), json!(2));
        right.insert("z".to_string(), json!(1));
        assert_eq!(
            fingerprint("t", None, &left),
            fingerprint("t", None, &right)
        );
    }

    #[test]
    fn any_component_changes_the_fingerprint() {
        let ctx = BTreeMap::from([("k".to_string(), json!(1))]);
        let base = fingerprint("task", Some("i"), &ctx);
        assert_ne!(base, fingerprint("task2", Some("i"), &ctx));
        assert_ne!(base, fingerprint("task", Some("j"), &ctx));
        assert_ne!(base, fingerprint("task", None, &ctx));
        let other = BTreeMap::from([("k".to_string(), json!(2))]);
        assert_ne!(base, fingerprint("task", Some("i"), &other));
    }

    #[test]
    fn empty_instruction_and_missing_instruction_differ_from_populated() {
        let ctx = BTreeMap::new();
        assert_eq!(
            fingerprint("t", None, &ctx),
            fingerprint("t", Some(""), &ctx)
        );
        assert_ne!(
            fingerprint("t", None, &ctx),
            fingerprint("t", Some("x"), &ctx)
        );
    }
}
