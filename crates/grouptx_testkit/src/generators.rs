//! Property-based test generators using proptest.
//!
//! Provides strategies for tenant names, entity-group keys and whole
//! transaction workloads.

use proptest::prelude::*;

/// Strategy for tenant names, including characters that need escaping.
pub fn tenant_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9][a-zA-Z0-9 ./%:_~-]{0,23}").expect("Invalid regex")
}

/// Strategy for entity-group root keys such as `Greeting:12`.
pub fn entity_group_strategy() -> impl Strategy<Value = String> {
    (
        prop::string::string_regex("[A-Z][a-z]{0,7}").expect("Invalid regex"),
        0u32..10_000,
    )
        .prop_map(|(kind, id)| format!("{kind}:{id}"))
}

/// Strategy for entity keys inside a group.
pub fn entity_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,6}(/[a-z0-9]{1,4}){0,2}").expect("Invalid regex")
}

/// One transaction in a generated workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadTxn {
    /// Entity group the transaction locks.
    pub group: String,
    /// Keys it writes.
    pub keys: Vec<String>,
    /// Whether it commits or aborts.
    pub commit: bool,
}

/// Strategy for a sequence of single-group transactions over a small key
/// space, so keys are rewritten often.
pub fn workload_strategy(max_len: usize) -> impl Strategy<Value = Vec<WorkloadTxn>> {
    let key = prop::sample::select(vec!["k0", "k1", "k2", "k3", "k4"]);
    let txn = (
        prop::sample::select(vec!["G:1", "G:2", "G:3"]),
        prop::collection::btree_set(key, 1..4),
        prop::bool::weighted(0.7),
    )
        .prop_map(|(group, keys, commit)| WorkloadTxn {
            group: group.to_string(),
            keys: keys.into_iter().map(str::to_string).collect(),
            commit,
        });
    prop::collection::vec(txn, 1..=max_len.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use grouptx_coord::path;

    proptest! {
        #[test]
        fn tenant_names_escape_to_one_component(name in tenant_name_strategy()) {
            let escaped = path::escape(&name);
            prop_assert!(!escaped.contains('/'));
            prop_assert_eq!(path::unescape(&escaped), Some(name));
        }

        #[test]
        fn group_keys_have_kind_and_id(group in entity_group_strategy()) {
            let (kind, id) = group.split_once(':').unwrap();
            prop_assert!(kind.chars().next().unwrap().is_ascii_uppercase());
            prop_assert!(id.parse::<u32>().is_ok());
        }

        #[test]
        fn workloads_are_non_empty(workload in workload_strategy(8)) {
            prop_assert!(!workload.is_empty() && workload.len() <= 8);
            for txn in &workload {
                prop_assert!(!txn.keys.is_empty());
            }
        }
    }
}
