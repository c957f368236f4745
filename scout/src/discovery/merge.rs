//! Identity-keyed reconciliation of node records.

use std::collections::HashMap;

use crate::discovery::types::{Health, Node};

/// Incoming wins only when it carries strictly more information.
fn is_more_informative(incoming: &Node, existing: &Node) -> bool {
    (incoming.health == Health::Healthy && existing.health != Health::Healthy)
        || (incoming.latency_ms.is_some() && existing.latency_ms.is_none())
}

/// Folds records in encounter order, keeping one entry per identity key.
///
/// Output order is the order in which each key was first seen. When a later
/// record replaces an earlier one it takes over that earlier slot.
pub fn merge<I>(nodes: I) -> Vec<Node>
where
    I: IntoIterator<Item = Node>,
{
    let mut merged: Vec<Node> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for node in nodes {
        match index.get(node.key()) {
            Some(&slot) => {
                if is_more_informative(&node, &merged[slot]) {
                    merged[slot] = node;
                }
            }
            None => {
                index.insert(node.key().to_string(), merged.len());
                merged.push(node);
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::types::Identity;
    use proptest::prelude::*;

    fn node(key: &str, health: Health, latency: Option<u64>) -> Node {
        let mut n = Node::new(Identity::Reported(key.into()), None);
        n.health = health;
        n.latency_ms = latency;
        n.last_update = 0;
        n
    }

    #[test]
    fn healthy_with_latency_wins_in_either_order() {
        let weak = node("K", Health::Unknown, None);
        let strong = node("K", Health::Healthy, Some(42));

        let forward = merge(vec![weak.clone(), strong.clone()]);
        let reverse = merge(vec![strong.clone(), weak]);

        assert_eq!(forward, vec![strong.clone()]);
        assert_eq!(reverse, vec![strong]);
    }

    #[test]
    fn duplicate_keys_collapse_to_one() {
        let merged = merge(vec![
            node("a", Health::Unknown, None),
            node("a", Health::Unknown, None),
        ]);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn equal_information_keeps_first_seen() {
        let mut first = node("a", Health::Unhealthy, None);
        first.rpc = Some("first".into());
        let mut second = node("a", Health::Unhealthy, None);
        second.rpc = Some("second".into());

        let merged = merge(vec![first, second]);
        assert_eq!(merged[0].rpc.as_deref(), Some("first"));
    }

    #[test]
    fn unhealthy_does_not_downgrade_healthy() {
        let merged = merge(vec![
            node("a", Health::Healthy, None),
            node("a", Health::Unhealthy, None),
        ]);
        assert_eq!(merged[0].health, Health::Healthy);
    }

    #[test]
    fn replacement_keeps_first_seen_position() {
        let merged = merge(vec![
            node("a", Health::Unknown, None),
            node("b", Health::Unknown, None),
            node("a", Health::Healthy, Some(5)),
        ]);
        let keys: Vec<&str> = merged.iter().map(|n| n.key()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(merged[0].latency_ms, Some(5));
    }

    fn arb_health() -> impl Strategy<Value = Health> {
        prop_oneof![
            Just(Health::Healthy),
            Just(Health::Unhealthy),
            Just(Health::Unknown),
        ]
    }

    fn arb_nodes() -> impl Strategy<Value = Vec<Node>> {
        prop::collection::vec(
            ("[a-e]", arb_health(), prop::option::of(0u64..500)),
            0..20,
        )
        .prop_map(|entries| {
            entries
                .into_iter()
                .map(|(key, health, latency)| node(&key, health, latency))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn merge_is_idempotent(nodes in arb_nodes()) {
            let once = merge(nodes);
            let twice = merge(once.clone());
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn merge_with_itself_is_unchanged(nodes in arb_nodes()) {
            let once = merge(nodes);
            let doubled = merge(once.iter().cloned().chain(once.iter().cloned()));
            prop_assert_eq!(once, doubled);
        }

        #[test]
        fn merged_keys_are_unique(nodes in arb_nodes()) {
            let merged = merge(nodes);
            let mut keys: Vec<&str> = merged.iter().map(|n| n.key()).collect();
            let total = keys.len();
            keys.sort();
            keys.dedup();
            prop_assert_eq!(keys.len(), total);
        }
    }
}
